//! Retry policy seam and the built-in exponential backoff policy
//!
//! The orchestrator consults a caller-supplied [`RetryPolicy`] after every
//! failed phase attempt. The policy sees which phase failed, which worker it
//! belongs to, and how many attempts that (worker, phase) pair has made; it
//! answers with deny (abort the whole flow) or retry-after-delay. Attempt
//! counts are transient per (worker, phase) loop and never persisted.
//!
//! [`ExponentialBackoff`] is the shipped implementation: exponentially
//! growing delays with a hard cap and optional jitter to prevent thundering
//! herd when many clients recover at once.

use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::worker::FlowPhase;

/// A retry policy's answer for one failed phase attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether to re-attempt the same phase on the same worker
    pub retry: bool,
    /// How long to wait before the re-attempt (ignored when `retry` is false)
    pub delay: Duration,
}

impl RetryDecision {
    /// Grant a retry after `delay`
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }

    /// Deny the retry, aborting the flow
    pub fn deny() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// External retry policy callback
///
/// `attempt` is the number of attempts already made for this (worker, phase)
/// pair: 1 on the first failure. Switching worker or phase resets the count.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Decide whether the given failed phase attempt should be retried
    async fn on_retry(&self, phase: FlowPhase, worker: &str, attempt: u32) -> RetryDecision;
}

/// Exponential backoff with a delay cap and optional jitter
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    /// Create a policy from retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.config.backoff_multiplier.powi(exponent as i32);
        let raw = Duration::from_secs_f64(self.config.initial_delay.as_secs_f64() * factor);
        let capped = raw.min(self.config.max_delay);
        if self.config.jitter {
            add_jitter(capped)
        } else {
            capped
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoff {
    async fn on_retry(&self, phase: FlowPhase, worker: &str, attempt: u32) -> RetryDecision {
        if attempt > self.config.max_attempts {
            tracing::error!(
                %phase,
                worker,
                attempt,
                max_attempts = self.config.max_attempts,
                "retry budget exhausted, denying"
            );
            return RetryDecision::deny();
        }
        let delay = self.delay_for(attempt);
        tracing::warn!(
            %phase,
            worker,
            attempt,
            delay_ms = delay.as_millis(),
            "phase failed, granting retry"
        );
        RetryDecision::retry_after(delay)
    }
}

/// Add random jitter to a delay
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies in `[delay, 2 * delay]`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
