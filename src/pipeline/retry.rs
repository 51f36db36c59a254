use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tokio::time::sleep;

/// Bounded retry with exponential backoff.
///
/// The delay before attempt `n + 1` is
/// `clamp(min_wait * multiplier^(n - 1), min_wait, max_wait)`, without jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: f64,
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation failed with an error not worth retrying.
    #[error("{0}")]
    Permanent(E),

    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait,
            max_wait: max_wait.max(min_wait),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
        }
    }

    /// Backoff schedule: one delay per retry, `max_attempts - 1` in total.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_wait)
            .with_max_delay(self.max_wait)
            .with_factor(self.multiplier as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// attempts. `operation` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, P>(&self, mut operation: F, is_transient: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = AtomicU32::new(0);

        let result = (|| {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(attempt, max_attempts = self.max_attempts, "Starting attempt");
            operation(attempt)
        })
        .retry(self.backoff())
        .sleep(sleep)
        .when(|err: &E| is_transient(err))
        .notify(|err: &E, delay: Duration| {
            tracing::warn!(
                attempt = attempts.load(Ordering::Relaxed),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying after backoff"
            );
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed);
        match result {
            Ok(value) => Ok(value),
            Err(err) if is_transient(&err) => {
                tracing::warn!(attempts, error = %err, "Retries exhausted");
                Err(RetryError::Exhausted { attempts, last: err })
            }
            Err(err) => {
                tracing::debug!(attempts, error = %err, "Permanent failure, not retrying");
                Err(RetryError::Permanent(err))
            }
        }
    }
}
