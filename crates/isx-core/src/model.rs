// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pipeline and stage state: the value objects mutated exclusively by the
//! Manager and read by everything else as snapshots.

use chrono::{DateTime, NaiveDate, Utc};
use isx_error::{ErrorCode, PipelineError, ProblemDocument};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much history a pipeline run should (re)process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// First-ever run for a date range; nothing to compare against.
    Initial,
    /// Re-run over an overlapping range; stages may skip unchanged work.
    Accumulative,
    /// Full re-scrape and re-derive, ignoring any skip protocol.
    Full,
}

/// Terminal and non-terminal statuses of a [`PipelineState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created but not yet driving any stage.
    Pending,
    /// Actively driving stages in topological order.
    Running,
    /// All stages ran to completion (or were skipped).
    Completed,
    /// A stage failed fatally or exhausted retries.
    Failed,
    /// Cancellation was requested and honored.
    Cancelled,
}

impl PipelineStatus {
    /// Whether this status is one of the three terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-stage status within a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Registered for this run but not yet started.
    Pending,
    /// Currently executing (validating or inside `Execute`).
    Active,
    /// Finished successfully; `progress` is guaranteed to be 100.
    Completed,
    /// Finished with a fatal error or exhausted its retries.
    Failed,
    /// Signaled nothing-to-do via the skip protocol.
    Skipped,
    /// Did not run (or was interrupted) because of pipeline cancellation.
    Cancelled,
}

impl StageStatus {
    /// Whether this status is one of the four terminal-for-this-stage states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

/// Caller-supplied request to start one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineRequest {
    /// Caller-supplied id; generated if omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// How much history to (re)process.
    pub mode: PipelineMode,
    /// Inclusive start of the date range.
    pub from_date: NaiveDate,
    /// Inclusive end of the date range; must be `>= from_date`.
    pub to_date: NaiveDate,
    /// Free-form parameters threaded through to stage bodies.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Directory stage bodies should download raw reports into.
    pub download_dir: String,
    /// Directory stage bodies should write derived reports into.
    pub report_dir: String,
}

impl PipelineRequest {
    /// Validate the request's own invariants, independent of any stage.
    ///
    /// This is the pipeline-level precondition check that runs before the
    /// resolver and any stage `Validate` call; an empty range (`from_date ==
    /// to_date`) is valid, only `to_date < from_date` is rejected.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.to_date < self.from_date {
            return Err(PipelineError::new(
                ErrorCode::ValidationFailed,
                format!(
                    "to_date ({}) is before from_date ({})",
                    self.to_date, self.from_date
                ),
            )
            .with_hint("verify date range"));
        }
        Ok(())
    }
}

/// State of a single stage within one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StageState {
    /// Stable stage identifier (matches [`crate::Stage::id`]).
    pub id: String,
    /// Human-readable stage name.
    pub name: String,
    /// Current status.
    pub status: StageStatus,
    /// Progress in `[0, 100]`.
    pub progress: u8,
    /// Latest human-readable status message.
    pub message: String,
    /// When this attempt sequence started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Number of `Execute` calls made so far (1-indexed once started).
    pub attempts: u32,
    /// Terminal error, present iff `status == Failed`.
    pub error: Option<ProblemDocument>,
    /// Stage-reported metadata, including the skip flag and ETA fields.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StageState {
    /// Construct a fresh, unstarted stage state.
    #[must_use]
    pub fn pending(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: StageStatus::Pending,
            progress: 0,
            message: String::new(),
            start_time: None,
            end_time: None,
            attempts: 0,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Reset attempt-local fields before a retry (progress to 0, message
    /// cleared, metadata cleared, `attempts` incremented).
    pub fn reset_for_attempt(&mut self) {
        self.progress = 0;
        self.message.clear();
        self.metadata.clear();
        self.attempts += 1;
    }
}

/// State of one pipeline run, owned exclusively by the Manager.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineState {
    /// Pipeline run id.
    pub id: String,
    /// Current status.
    pub status: PipelineStatus,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Terminal error, present iff `status == Failed`.
    pub error: Option<ProblemDocument>,
    /// Snapshot of the request that created this run.
    pub config: PipelineRequest,
    /// Shared string-keyed context, written only via `StageHandle::write`.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Per-stage state, in topological execution order.
    pub stages: Vec<StageState>,
}

impl PipelineState {
    /// Create a fresh run in `Pending` status, seeded from `request`.
    #[must_use]
    pub fn new(id: impl Into<String>, request: PipelineRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: PipelineStatus::Pending,
            start_time: now,
            end_time: None,
            error: None,
            config: request,
            context: BTreeMap::new(),
            stages: Vec::new(),
        }
    }

    /// Look up a stage's state by id.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Mutable lookup of a stage's state by id.
    pub fn stage_mut(&mut self, id: &str) -> Option<&mut StageState> {
        self.stages.iter_mut().find(|s| s.id == id)
    }
}

/// A recorded completion sample for a stage, used to seed the progress
/// calculator's historical ETA estimate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HistoricalSample {
    /// Schema version of this record, allowing forward-compatible skips
    /// instead of a versioned line prefix.
    #[serde(default = "HistoricalSample::current_schema_version")]
    pub schema_version: u32,
    /// Stage id this sample belongs to.
    pub stage_id: String,
    /// Wall-clock duration of the successful attempt, in nanoseconds.
    pub duration_ns: u64,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// Optional unit count (records processed, bytes transferred, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_units: Option<u64>,
}

impl HistoricalSample {
    /// Current on-disk schema version for [`HistoricalSample`] records.
    #[must_use]
    pub fn current_schema_version() -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_date_range_is_valid() {
        let req = PipelineRequest {
            id: Some("P1".into()),
            mode: PipelineMode::Initial,
            from_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            parameters: BTreeMap::new(),
            download_dir: "d".into(),
            report_dir: "r".into(),
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn inverted_date_range_is_rejected_before_any_stage_runs() {
        let req = PipelineRequest {
            id: None,
            mode: PipelineMode::Initial,
            from_date: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
            to_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            parameters: BTreeMap::new(),
            download_dir: "d".into(),
            report_dir: "r".into(),
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[test]
    fn completed_status_implies_terminal() {
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
    }

    #[test]
    fn reset_for_attempt_clears_progress_and_bumps_attempts() {
        let mut stage = StageState::pending("scrape", "Scrape ISX portal");
        stage.progress = 42;
        stage.message = "halfway".into();
        stage.metadata.insert("skip".into(), serde_json::json!(true));
        stage.reset_for_attempt();
        assert_eq!(stage.progress, 0);
        assert!(stage.message.is_empty());
        assert!(stage.metadata.is_empty());
        assert_eq!(stage.attempts, 1);
    }
}
