use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::error::{CapabilityError, GenerationFailure};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    call_timeout: Option<Duration>,
}

/// A successful call and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
            call_timeout: None,
        }
    }

    /// Bound every individual attempt; an attempt that overruns counts as `Timeout`.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = Some(call_timeout);
        self
    }

    /// Retry a capability call with exponential backoff.
    ///
    /// Makes at most `max_retries + 1` attempts. The backoff doubles after each
    /// failure and is capped at `max_backoff`.
    pub async fn retry<F, Fut, T>(
        &self,
        operation_name: &str,
        mut f: F,
    ) -> Result<Attempted<T>, GenerationFailure>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, CapabilityError>>,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let outcome = match self.call_timeout {
                Some(limit) => match timeout(limit, f()).await {
                    Ok(result) => result,
                    Err(_) => Err(CapabilityError::Timeout),
                },
                None => f().await,
            };

            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries || !e.is_retryable() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                        return Err(GenerationFailure {
                            operation: operation_name.to_string(),
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );

                    sleep(backoff).await;

                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 10000)
    }
}
