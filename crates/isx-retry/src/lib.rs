// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy and exponential backoff for pipeline stage attempts.
//!
//! `max_attempts` is a *total* attempt count: `max_attempts = 2` means at
//! most two calls to a stage's `Execute`, not "one retry on top of an
//! unbounded first try". Only errors whose [`isx_error::ErrorCode`] reports
//! `is_retryable() == true` (retryable execution errors and timeouts)
//! consume an attempt; everything else is returned immediately.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use isx_error::PipelineError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

/// Per-stage timeout configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Deadline for a single `Execute` attempt.
    #[serde(with = "duration_millis")]
    pub per_attempt: Duration,
}

impl TimeoutConfig {
    /// Default per-stage deadline (10 minutes).
    pub const DEFAULT_PER_STAGE: Duration = Duration::from_secs(600);

    /// Build a timeout config with the given per-attempt deadline.
    #[must_use]
    pub fn new(per_attempt: Duration) -> Self {
        Self { per_attempt }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_attempt: Self::DEFAULT_PER_STAGE,
        }
    }
}

/// Serde helper — `Duration` as integer milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential-backoff retry policy applied between stage attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum total number of `Execute` calls (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Start building a policy from the defaults.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Backoff delay before the given zero-indexed retry attempt
    /// (`0` = the delay before the first retry, i.e. after attempt 0 fails).
    #[must_use]
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exp = self.multiplier.powi(retry_index as i32);
        let nominal_ms = (self.initial_delay.as_millis() as f64 * exp) as u64;
        let capped_ms = nominal_ms.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(jitter(capped_ms, retry_index))
    }
}

/// Apply cheap pseudo-random jitter (up to 25% below nominal), the same
/// system-clock-nanos technique used for backoff jitter elsewhere in the
/// workspace — no external RNG dependency required.
fn jitter(nominal_ms: u64, salt: u32) -> u64 {
    if nominal_ms == 0 {
        return 0;
    }
    let jitter_range = nominal_ms / 4;
    if jitter_range == 0 {
        return nominal_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let pseudo = nanos.wrapping_mul(u64::from(salt) + 1);
    nominal_ms.saturating_sub(pseudo % jitter_range)
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicyOverrides,
}

#[derive(Debug, Default)]
struct RetryPolicyOverrides {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    multiplier: Option<f64>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Override the maximum total attempt count.
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.policy.max_attempts = Some(n);
        self
    }

    /// Override the initial retry delay.
    #[must_use]
    pub fn initial_delay(mut self, d: Duration) -> Self {
        self.policy.initial_delay = Some(d);
        self
    }

    /// Override the backoff multiplier.
    #[must_use]
    pub fn multiplier(mut self, m: f64) -> Self {
        self.policy.multiplier = Some(m);
        self
    }

    /// Override the maximum delay cap.
    #[must_use]
    pub fn max_delay(mut self, d: Duration) -> Self {
        self.policy.max_delay = Some(d);
        self
    }

    /// Build the policy, filling any unset fields from [`RetryPolicy::default`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.policy.max_attempts.unwrap_or(defaults.max_attempts),
            initial_delay: self.policy.initial_delay.unwrap_or(defaults.initial_delay),
            multiplier: self.policy.multiplier.unwrap_or(defaults.multiplier),
            max_delay: self.policy.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Record of a single failed attempt.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error from this attempt.
    pub error: PipelineError,
    /// Backoff delay applied before the next attempt.
    pub delay: Duration,
}

/// Result of a retry-governed operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Total number of attempts made (including the successful one).
    pub total_attempts: u32,
    /// Records of each failed attempt.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spanning all attempts.
    pub total_duration: Duration,
}

// ---------------------------------------------------------------------------
// Core retry loop
// ---------------------------------------------------------------------------

/// Drive `op` under `policy`, retrying while the returned error is
/// retryable and attempts remain.
///
/// `op` is re-invoked with the zero-indexed attempt number so callers can
/// reset per-attempt stage state (progress, message) before each call.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<RetryOutcome<T>, PipelineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let start = Instant::now();
    let mut failed_attempts = Vec::new();

    for attempt in 0..policy.max_attempts {
        debug!(target: "isx.retry", attempt, max_attempts = policy.max_attempts, "attempting stage execution");

        match op(attempt).await {
            Ok(value) => {
                return Ok(RetryOutcome {
                    value,
                    total_attempts: attempt + 1,
                    failed_attempts,
                    total_duration: start.elapsed(),
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= policy.max_attempts;

                if !err.is_retryable() {
                    debug!(target: "isx.retry", %err, "non-retryable error, giving up");
                    return Err(err);
                }
                if is_last {
                    warn!(target: "isx.retry", %err, attempt, "retry attempts exhausted");
                    return Err(err);
                }

                let delay = policy.delay_for(attempt);
                warn!(target: "isx.retry", %err, attempt, delay_ms = delay.as_millis() as u64, "retryable error, backing off");
                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("retry_with_policy always returns inside the loop for max_attempts >= 1")
}
