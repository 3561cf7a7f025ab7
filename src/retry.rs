//! Bounded retry with exponential backoff for the transient failure class.
//!
//! Only the LLM call + parse step of an analysis pass is retried; git and
//! store failures abort the pass and are picked up again by the next poll
//! cycle. Backoff sleeps are cancellable by the shutdown token.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Backoff before retry `n` (1-based) is `base * 2^n`.
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("cancelled while backing off")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Run `op` up to `policy.attempts` times, sleeping `base * 2^attempt`
/// between failures. The sleep races against `cancel`.
pub async fn retry<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    op_name: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = policy.base * 2u32.saturating_pow(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = policy.attempts,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Attempt failed, backing off before retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
