use std::future::Future;
use std::time::Duration;

use super::error::{AttemptError, ResilienceError};
use super::policy::RetryConfig;
use super::telemetry::TelemetrySink;
use super::timeout::with_timeout;
use crate::error::Retryable;

/// Runs `work` under the per-attempt timeout, re-invoking it on retryable
/// failures until the retry budget is spent.
///
/// Without a retry policy this is a single timed attempt. A non-retryable
/// failure is returned as-is; running out of attempts yields
/// [`ResilienceError::RetryExhausted`] carrying the last failure.
pub async fn run_with_retry<T, E, F, Fut>(
    operation: &str,
    retry: Option<&RetryConfig>,
    timeout: Option<Duration>,
    telemetry: &dyn TelemetrySink,
    work: &mut F,
) -> Result<T, ResilienceError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let Some(retry) = retry else {
        return with_timeout(operation, timeout, work())
            .await
            .map_err(ResilienceError::from_attempt);
    };

    let backoff = retry.backoff();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match with_timeout(operation, timeout, work()).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_retryable(retry.retry_on_timeout) {
            return Err(ResilienceError::from_attempt(error));
        }
        if attempt >= retry.max_attempts {
            return Err(ResilienceError::RetryExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                last: error,
            });
        }

        let delay = if retry.jitter {
            backoff.jittered_delay(attempt - 1)
        } else {
            backoff.delay(attempt - 1)
        };
        telemetry.retry_scheduled(operation, attempt, delay);
        tokio::time::sleep(delay).await;
    }
}
