// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tracing subscriber startup and lightweight duration-summary helpers.
//!
//! This crate owns the ambient logging stack: it wires a global `tracing`
//! subscriber at process startup and offers a small collector for
//! summarizing stage durations for diagnostics (e.g. a `/healthz` payload
//! or a shutdown log line). Durable per-stage ETA history lives in
//! `isx-metrics`; this crate never persists anything to disk.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for the process-wide log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, colorized when attached to a terminal.
    #[default]
    Pretty,
    /// Newline-delimited JSON, one object per log event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?}, expected \"pretty\" or \"json\"")),
        }
    }
}

/// Install the process-wide `tracing` subscriber.
///
/// `level` seeds an [`EnvFilter`]: an explicit `RUST_LOG` always wins over
/// it, matching the `tracing_subscriber::fmt` convention used elsewhere in
/// this codebase. Call this once, at the top of `main`.
pub fn init_tracing(format: LogFormat, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }
}

/// Times a unit of work and logs its duration on drop, unless [`StageTimer::finish`]
/// was called first.
///
/// Grounded on the pattern of attaching duration metrics to a span: rather
/// than a span guard, this records into a [`DurationCollector`] so the
/// values can be summarized later.
pub struct StageTimer<'a> {
    stage_id: String,
    started: Instant,
    collector: &'a DurationCollector,
    finished: bool,
}

impl<'a> StageTimer<'a> {
    /// Start timing `stage_id`, recording into `collector` when finished.
    #[must_use]
    pub fn start(stage_id: impl Into<String>, collector: &'a DurationCollector) -> Self {
        Self {
            stage_id: stage_id.into(),
            started: Instant::now(),
            collector,
            finished: false,
        }
    }

    /// Stop the timer, recording the elapsed duration and emitting a
    /// `tracing::info!` event tagged with the stage id.
    pub fn finish(mut self) {
        self.record();
    }

    fn record(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let elapsed = self.started.elapsed();
        self.collector.record(&self.stage_id, elapsed);
        tracing::info!(
            stage_id = %self.stage_id,
            duration_ms = elapsed.as_millis() as u64,
            "stage_timer_finished"
        );
    }
}

impl Drop for StageTimer<'_> {
    fn drop(&mut self) {
        self.record();
    }
}

/// One recorded stage duration, keyed by stage id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDuration {
    /// The stage this duration belongs to.
    pub stage_id: String,
    /// Elapsed wall-clock time, in milliseconds.
    pub duration_ms: u64,
}

/// Aggregated duration statistics across recorded samples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DurationSummary {
    /// Number of samples summarized.
    pub count: usize,
    /// Arithmetic mean duration, in milliseconds.
    pub mean_duration_ms: f64,
    /// 50th percentile duration, in milliseconds.
    pub p50_duration_ms: f64,
    /// 99th percentile duration, in milliseconds.
    pub p99_duration_ms: f64,
}

impl Default for DurationSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p50_duration_ms: 0.0,
            p99_duration_ms: 0.0,
        }
    }
}

/// Linear-interpolation percentile over an already-sorted slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let weight = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
}

/// In-memory collector of stage durations, for diagnostics summaries only.
///
/// Not a substitute for `isx-metrics::MetricsStore`: this never touches
/// disk and is meant for a process's own lifetime (e.g. a `/healthz`
/// payload), not for seeding ETA estimates across restarts.
#[derive(Debug, Default)]
pub struct DurationCollector {
    inner: Mutex<Vec<StageDuration>>,
}

impl DurationCollector {
    /// Construct an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one duration sample for `stage_id`.
    pub fn record(&self, stage_id: &str, duration: Duration) {
        let mut data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        data.push(StageDuration {
            stage_id: stage_id.to_string(),
            duration_ms: duration.as_millis() as u64,
        });
    }

    /// Number of recorded samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no samples have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All recorded samples, in insertion order.
    #[must_use]
    pub fn samples(&self) -> Vec<StageDuration> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Aggregate statistics across every recorded sample, regardless of
    /// stage id.
    #[must_use]
    pub fn summary(&self) -> DurationSummary {
        let data = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if data.is_empty() {
            return DurationSummary::default();
        }

        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|d| d.duration_ms).collect();
        durations.sort_unstable();

        let total: u64 = durations.iter().sum();
        let mean_duration_ms = total as f64 / count as f64;
        let p50_duration_ms = percentile(&durations, 50.0);
        let p99_duration_ms = percentile(&durations, 99.0);

        DurationSummary {
            count,
            mean_duration_ms,
            p50_duration_ms,
            p99_duration_ms,
        }
    }

    /// Discard all recorded samples.
    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
