use std::future::Future;
use std::time::Duration;

use super::error::AttemptError;

/// Bounds one attempt; on expiry the attempt's future is dropped, cancelling it.
pub async fn with_timeout<T, E, Fut>(
    operation: &str,
    timeout: Option<Duration>,
    attempt: Fut,
) -> Result<T, AttemptError<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    let Some(timeout) = timeout else {
        return attempt.await.map_err(AttemptError::Operation);
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result.map_err(AttemptError::Operation),
        Err(_) => Err(AttemptError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_is_cancelled() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let result: Result<(), AttemptError<std::io::Error>> = with_timeout(
            "slow",
            Some(Duration::from_millis(50)),
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(AttemptError::Timeout { ref operation, timeout })
                if operation == "slow" && timeout == Duration::from_millis(50)
        ));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_passes_through_results() {
        let ok: Result<u8, AttemptError<std::io::Error>> =
            with_timeout("fast", Some(Duration::from_secs(1)), async { Ok(3) }).await;
        assert_eq!(ok.unwrap(), 3);

        let err: Result<u8, AttemptError<std::io::Error>> = with_timeout("none", None, async {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        })
        .await;
        assert!(matches!(err, Err(AttemptError::Operation(_))));
    }
}
