//! Bounded retry of outbound unary calls.

use crate::error::MeshError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How often and how patiently to retry a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first; values below 1 mean 1.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Option<Duration>,
}

impl RetryPolicy {
    /// A policy making `attempts` attempts back to back.
    #[must_use]
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            delay: None,
        }
    }

    /// Pauses `delay` between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Runs `call` until it succeeds or the policy's attempts are spent.
///
/// `call` is invoked once per attempt, so each attempt can pick a fresh target.
///
/// # Errors
///
/// With a single attempt, the attempt's error. Otherwise
/// [`MeshError::RetryExhausted`] carrying the last error.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, MeshError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MeshError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(if attempts == 1 {
                    e
                } else {
                    MeshError::RetryExhausted {
                        attempts,
                        last: Box::new(e),
                    }
                });
            }
            Err(e) => {
                debug!(attempt, attempts, error = %e, "Call failed, retrying");
                if let Some(delay) = policy.delay {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
