//! Retry with exponential backoff for calls into flaky third-party services.
//!
//! This sits at the call site of collaborator API clients. It never touches
//! task or job state: a call that exhausts its attempts simply returns the
//! last error, which the work function may then propagate.

use crate::core::errors::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Lower-cased substrings that mark an error message as transient
pub const RETRYABLE_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "503",
    "502",
    "timeout",
    "connection",
    "temporary",
    "overloaded",
    "capacity",
    "busy",
    "retry",
];

/// Heuristic classifier for transient failures (rate limits, 5xx, timeouts)
pub fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RETRYABLE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Backoff parameters for [`retry_with_backoff`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in [0.5, 1.0)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ForgeError::configuration(
                "max_attempts must be greater than 0",
            ));
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ForgeError::configuration("multiplier must be >= 1.0"));
        }
        if self.base_delay > self.max_delay {
            return Err(ForgeError::configuration(
                "base_delay cannot exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Delay after the zero-based `attempt` failed: `base * multiplier^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let scaled = if self.jitter {
            capped * (0.5 + fastrand::f64() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(scaled)
    }

    /// Run `op` under this policy, classifying errors by their message
    pub fn call<T, E, F>(&self, op: F) -> std::result::Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> std::result::Result<T, E>,
    {
        retry_with_backoff(self, op)
    }
}

/// Call `op` until it succeeds or the policy gives up.
///
/// `op` receives the zero-based attempt number. An error that does not look
/// transient aborts immediately, except on the first attempt.
pub fn retry_with_backoff<T, E, F>(policy: &RetryPolicy, op: F) -> std::result::Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> std::result::Result<T, E>,
{
    retry_with_classifier(policy, |err: &E| is_retryable_message(&err.to_string()), op)
}

/// [`retry_with_backoff`] with a caller-supplied transient-error classifier
pub fn retry_with_classifier<T, E, C, F>(
    policy: &RetryPolicy,
    classify: C,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: Display,
    C: Fn(&E) -> bool,
    F: FnMut(u32) -> std::result::Result<T, E>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => match next_delay(policy, attempts, attempt, classify(&err), &err) {
                Some(delay) => {
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

/// Async flavour of [`retry_with_backoff`] for callers already on a tokio runtime
pub async fn retry_with_backoff_async<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = is_retryable_message(&err.to_string());
                match next_delay(policy, attempts, attempt, retryable, &err) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                }
            }
        }
    }
}

fn next_delay<E: Display>(
    policy: &RetryPolicy,
    attempts: u32,
    attempt: u32,
    retryable: bool,
    err: &E,
) -> Option<Duration> {
    if !retryable && attempt > 0 {
        return None;
    }
    if attempt + 1 < attempts {
        let delay = policy.delay_for(attempt);
        warn!(
            attempt = attempt + 1,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed: {}. Retrying",
            err
        );
        Some(delay)
    } else {
        error!(max_attempts = attempts, "All attempts failed: {}", err);
        None
    }
}
