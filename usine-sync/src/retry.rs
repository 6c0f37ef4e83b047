//! Bounded retry with backoff.
//!
//! One policy type serves every retry site: page fetches and single writes go
//! through [`with_retry`], batch commits go through
//! [`crate::batch::commit_with_retry`], which reuses [`RetryPolicy::delay_for`]
//! to resubmit only the failed subset.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use usine_core::config::{BackoffKind, RetrySettings};

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base × attempt`
    Linear,
    /// `base × multiplier^(attempt - 1)`
    Exponential { multiplier: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never below 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        let backoff = match settings.backoff {
            BackoffKind::Linear => Backoff::Linear,
            BackoffKind::Exponential => Backoff::Exponential {
                multiplier: settings.multiplier,
            },
        };
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff,
            jitter: settings.jitter,
        }
    }

    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    /// Un-jittered wait after `attempt` failed attempts (`attempt >= 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base_delay.as_secs_f64();
        let raw = match self.backoff {
            Backoff::Linear => base * f64::from(attempt),
            Backoff::Exponential { multiplier } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base * multiplier.powi(exponent)
            }
        };
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// The delay actually slept, with jitter applied when enabled.
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter && !delay.is_zero() {
            let factor = 0.5 + rand::random::<f64>();
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
pub async fn with_retry<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!("{operation_name} succeeded after {attempts} attempts");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) || attempts >= policy.max_attempts {
                    tracing::warn!("{operation_name} failed after {attempts} attempts: {err}");
                    return Err(err);
                }
                let delay = policy.wait_for(attempts);
                tracing::debug!(
                    "{operation_name} attempt {attempts} failed: {err}. Retrying in {delay:?}"
                );
                sleep(delay).await;
            }
        }
    }
}
