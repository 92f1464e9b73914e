// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-stage ETA estimation: blends a short-window live extrapolation with
//! the stage's historical median duration, damping sudden drops.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

const SAMPLE_WINDOW: usize = 16;
const MIN_EMIT_INTERVAL_MS: i64 = 100;
const DAMPING_THRESHOLD: f64 = 2.0;
const DAMPING_FACTOR: f64 = 0.5;

/// Fallback message emitted while neither live nor historical data exists.
pub const CALCULATING_MESSAGE: &str = "Calculating...";

/// The calculator's current best estimate for a stage's remaining duration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEstimate {
    /// Remaining duration, if one could be computed.
    pub eta: Option<Duration>,
    /// Whether `eta` leans on historical data rather than pure live rate.
    pub estimated: bool,
    /// Human-readable status message (`"Calculating..."` as a last resort).
    pub message: String,
}

/// Tracks samples and historical context for one stage attempt and produces
/// [`ProgressEstimate`]s.
pub struct ProgressCalculator {
    start: DateTime<Utc>,
    historical_median: Option<Duration>,
    samples: VecDeque<(DateTime<Utc>, u8)>,
    last_eta: Option<Duration>,
    last_emitted_at: Option<DateTime<Utc>>,
    last_emitted_percent: Option<u8>,
    last_emitted_message: Option<String>,
}

impl ProgressCalculator {
    /// Start a new calculator for a stage attempt beginning at `start`,
    /// optionally seeded with a historical median duration.
    #[must_use]
    pub fn new(start: DateTime<Utc>, historical_median: Option<Duration>) -> Self {
        Self {
            start,
            historical_median,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_eta: None,
            last_emitted_at: None,
            last_emitted_percent: None,
            last_emitted_message: None,
        }
    }

    /// Record a new `(now, percent)` sample and compute the resulting
    /// estimate.
    pub fn record(&mut self, now: DateTime<Utc>, percent: u8) -> ProgressEstimate {
        self.samples.push_back((now, percent));
        if self.samples.len() > SAMPLE_WINDOW {
            self.samples.pop_front();
        }

        let elapsed = chrono_duration_to_std(now - self.start);
        let live_eta = self.live_estimate(now, percent);

        let estimate = match (live_eta, self.historical_median) {
            (Some(live), Some(median)) => {
                let w = (elapsed.as_secs_f64() / median.as_secs_f64()).min(1.0).max(0.0);
                let historical_remaining =
                    (median.as_secs_f64() - elapsed.as_secs_f64()).max(0.0);
                let blended = w * live.as_secs_f64() + (1.0 - w) * historical_remaining;
                Some((Duration::from_secs_f64(blended.max(0.0)), true))
            }
            (Some(live), None) => Some((live, false)),
            (None, Some(median)) => {
                let remaining = (median.as_secs_f64() - elapsed.as_secs_f64()).max(0.0);
                Some((Duration::from_secs_f64(remaining), true))
            }
            (None, None) => None,
        };

        match estimate {
            Some((eta, estimated)) => {
                let damped = self.damp(eta);
                self.last_eta = Some(damped);
                ProgressEstimate {
                    eta: Some(damped),
                    estimated,
                    message: format!("{percent}% complete"),
                }
            }
            None => ProgressEstimate {
                eta: None,
                estimated: false,
                message: CALCULATING_MESSAGE.to_string(),
            },
        }
    }

    /// Whether this estimate should actually be emitted as a `stage_progress`
    /// event, per the ≤1/100ms cadence rule (percent/message changes and the
    /// final 100% always pass through).
    pub fn should_emit(&mut self, now: DateTime<Utc>, percent: u8, message: &str) -> bool {
        let should = percent == 100
            || self.last_emitted_at.is_none()
            || self.last_emitted_percent != Some(percent)
            || self.last_emitted_message.as_deref() != Some(message)
            || chrono_duration_to_std(now - self.last_emitted_at.unwrap()).as_millis()
                >= MIN_EMIT_INTERVAL_MS as u128;
        if should {
            self.last_emitted_at = Some(now);
            self.last_emitted_percent = Some(percent);
            self.last_emitted_message = Some(message.to_string());
        }
        should
    }

    fn live_estimate(&self, now: DateTime<Utc>, percent: u8) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }
        let (oldest_t, oldest_p) = *self.samples.front().expect("len >= 2");
        let dt = chrono_duration_to_std(now - oldest_t).as_secs_f64();
        let dp = f64::from(percent) - f64::from(oldest_p);
        if dt <= 0.0 || dp <= 0.0 {
            return None;
        }
        let rate_per_sec = dp / dt;
        let remaining_percent = 100.0 - f64::from(percent);
        Some(Duration::from_secs_f64((remaining_percent / rate_per_sec).max(0.0)))
    }

    fn damp(&self, eta: Duration) -> Duration {
        match self.last_eta {
            Some(prior) if prior.as_secs_f64() > 0.0 => {
                if prior.as_secs_f64() / eta.as_secs_f64().max(f64::EPSILON) > DAMPING_THRESHOLD {
                    Duration::from_secs_f64(prior.as_secs_f64() * DAMPING_FACTOR)
                } else {
                    eta
                }
            }
            _ => eta,
        }
    }
}

fn chrono_duration_to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}
