use std::fmt;
use std::future::Future;
use std::pin::Pin;

use super::error::ResilienceError;

/// Produces a replacement result once a guarded call has finally failed.
#[async_trait::async_trait]
pub trait FallbackStrategy<T, E>: Send + Sync {
    async fn recover(&self, error: ResilienceError<E>) -> Result<T, ResilienceError<E>>;
}

/// Always answers with a fixed value.
#[derive(Debug, Clone)]
pub struct ValueFallback<T> {
    value: T,
}

impl<T> ValueFallback<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

#[async_trait::async_trait]
impl<T, E> FallbackStrategy<T, E> for ValueFallback<T>
where
    T: Clone + Send + Sync,
    E: Send + 'static,
{
    async fn recover(&self, _error: ResilienceError<E>) -> Result<T, ResilienceError<E>> {
        Ok(self.value.clone())
    }
}

type BoxedRecovery<T, E> = Pin<Box<dyn Future<Output = Result<T, ResilienceError<E>>> + Send>>;

/// Computes the replacement from the terminal error.
pub struct FunctionFallback<T, E> {
    recover: Box<dyn Fn(ResilienceError<E>) -> BoxedRecovery<T, E> + Send + Sync>,
}

impl<T, E> fmt::Debug for FunctionFallback<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionFallback").finish_non_exhaustive()
    }
}

impl<T, E> FunctionFallback<T, E> {
    pub fn new<F, Fut>(recover: F) -> Self
    where
        F: Fn(ResilienceError<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
        T: 'static,
        E: 'static,
    {
        Self {
            recover: Box::new(move |error| -> BoxedRecovery<T, E> { Box::pin(recover(error)) }),
        }
    }

    /// Synchronous variant for recoveries that need no I/O.
    pub fn from_fn<F>(recover: F) -> Self
    where
        F: Fn(ResilienceError<E>) -> Result<T, ResilienceError<E>> + Send + Sync + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        Self::new(move |error| std::future::ready(recover(error)))
    }
}

#[async_trait::async_trait]
impl<T, E> FallbackStrategy<T, E> for FunctionFallback<T, E>
where
    T: Send,
    E: Send + 'static,
{
    async fn recover(&self, error: ResilienceError<E>) -> Result<T, ResilienceError<E>> {
        (self.recover)(error).await
    }
}
