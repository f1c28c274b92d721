//! Retrying fallible external calls.
//!
//! ## Architecture
//!
//! ```text
//! caller ──RetryPolicy::run(cancel, op)──▶ op() ──Err──▶ classify
//!                                            ▲              │
//!                                            │   Retryable: base * 2^n + jitter (capped)
//!                                            └── RateLimited: fixed wait
//!                                                Permanent: return at once
//! ```
//!
//! Every tracker and agent call goes through a policy. Both the call and the
//! wait race the cancellation token, so shutdown interrupts them immediately
//! and the caller sees [`RetryError::Cancelled`] rather than the last
//! operation error.

pub mod classify;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use classify::{Classify, ErrorClass, classify_http_status, classify_text, parse_http_status};

pub use crate::errors::RetryError;

/// Ceiling for a single exponential backoff wait.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Jitter added on top of the exponential delay, as a fraction of it.
const MAX_JITTER: f64 = 0.25;

/// How many times to try, and how long to wait between tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts; `0` retries until success, a permanent error, or cancellation.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub rate_limit_wait: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            rate_limit_wait: Duration::from_secs(5 * 60),
            max_backoff: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration, rate_limit_wait: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
            rate_limit_wait,
            max_backoff: MAX_BACKOFF,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Same waits, no attempt limit.
    pub fn unlimited(self) -> Self {
        self.with_max_attempts(0)
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// `backoff_base * 2^attempt`, capped. `attempt` counts from zero.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// [`Self::base_delay`] plus up to 25% jitter, capped after the jitter so
    /// successive delays never shrink.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = base.mul_f64(rand::thread_rng().gen_range(0.0..MAX_JITTER));
        (base + jitter).min(self.max_backoff)
    }

    /// Run `op` until it succeeds, classifying failures with [`Classify`].
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(cancel, E::classify, op).await
    }

    /// Run `op` until it succeeds, classifying failures with `classify`.
    pub async fn run_with<T, E, F, Fut, C>(
        &self,
        cancel: &CancellationToken,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let mut attempts: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = op() => outcome,
            };
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempts += 1;

            let class = classify(&err);
            if class == ErrorClass::Permanent {
                return Err(RetryError::Failed {
                    attempts,
                    source: err,
                });
            }
            if !self.is_unlimited() && attempts >= self.max_attempts {
                return Err(RetryError::Failed {
                    attempts,
                    source: err,
                });
            }

            let delay = match class {
                ErrorClass::RateLimited => self.rate_limit_wait,
                _ => self.backoff_delay(attempts - 1),
            };
            warn!(
                attempt = attempts,
                class = ?class,
                delay_secs = delay.as_secs_f64(),
                error = %err,
                "Operation failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
