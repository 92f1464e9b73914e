// SPDX-License-Identifier: MIT OR Apache-2.0
//! The broadcast payload fanned out to WebSocket subscribers.
//!
//! A [`PipelineEvent`] is a single flat envelope so that the framing
//! invariant — exactly one JSON object per delivered frame — falls out of
//! the type itself: serializing one `PipelineEvent` always produces exactly
//! one JSON object.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discriminant for [`PipelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventType {
    /// Subscribers should discard any stale view of this pipeline id.
    PipelineReset,
    /// The pipeline transitioned to a new top-level status.
    PipelineStatus,
    /// Aggregate progress across all stages changed.
    PipelineProgress,
    /// The pipeline reached `Completed`.
    PipelineComplete,
    /// The pipeline reached `Failed`.
    PipelineError,
    /// A stage transitioned to a new status.
    StageStatus,
    /// A stage reported incremental progress.
    StageProgress,
    /// The pipeline completed; lists logical surfaces viewers should re-read.
    Refresh,
}

/// Coalescing/backpressure priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Never dropped; never coalesced.
    Critical,
    /// Never dropped; never coalesced.
    Normal,
    /// Coalesceable per stage id under backpressure.
    Low,
}

impl PipelineEventType {
    /// The priority class this event type belongs to when the broadcaster
    /// is under backpressure.
    ///
    /// `StageStatus` is `Critical` only when the new status is terminal;
    /// callers must pass that through [`PipelineEvent::priority`] rather
    /// than relying on the type alone, since "active" vs "completed" both
    /// serialize under the same `StageStatus` discriminant.
    #[must_use]
    pub fn base_priority(self) -> Priority {
        match self {
            Self::PipelineError | Self::PipelineComplete => Priority::Critical,
            Self::PipelineReset | Self::PipelineStatus | Self::StageStatus => Priority::Normal,
            Self::StageProgress | Self::PipelineProgress => Priority::Low,
            Self::Refresh => Priority::Normal,
        }
    }
}

/// One broadcast event. Exactly one of these serializes to exactly one
/// WebSocket text frame (the framing invariant).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PipelineEvent {
    /// Event discriminant.
    #[serde(rename = "type")]
    pub event_type: PipelineEventType,
    /// Pipeline run this event belongs to.
    pub pipeline_id: String,
    /// Stage id, present for stage-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Status string, present for status-transition events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Progress percent in `[0, 100]`, present for progress events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Additional structured fields (ETA, error hint, refresh components, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    /// RFC 3339 timestamp with nanosecond precision.
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    /// This event's priority, honoring the "terminal stage status is
    /// Critical" refinement over [`PipelineEventType::base_priority`].
    #[must_use]
    pub fn priority(&self) -> Priority {
        if self.event_type == PipelineEventType::StageStatus {
            let terminal = matches!(
                self.status.as_deref(),
                Some("completed") | Some("failed") | Some("skipped") | Some("cancelled")
            );
            return if terminal {
                Priority::Critical
            } else {
                Priority::Normal
            };
        }
        self.event_type.base_priority()
    }

    /// The coalescing key for `Low`-priority events: events with the same
    /// key may have all but the newest dropped under backpressure.
    #[must_use]
    pub fn coalesce_key(&self) -> Option<String> {
        if self.priority() != Priority::Low {
            return None;
        }
        Some(match &self.stage {
            Some(stage) => format!("{}:{}", self.event_type_str(), stage),
            None => self.event_type_str().to_string(),
        })
    }

    fn event_type_str(&self) -> &'static str {
        match self.event_type {
            PipelineEventType::PipelineReset => "pipeline_reset",
            PipelineEventType::PipelineStatus => "pipeline_status",
            PipelineEventType::PipelineProgress => "pipeline_progress",
            PipelineEventType::PipelineComplete => "pipeline_complete",
            PipelineEventType::PipelineError => "pipeline_error",
            PipelineEventType::StageStatus => "stage_status",
            PipelineEventType::StageProgress => "stage_progress",
            PipelineEventType::Refresh => "refresh",
        }
    }

    /// Build a `pipeline_reset` event.
    #[must_use]
    pub fn pipeline_reset(pipeline_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_type: PipelineEventType::PipelineReset,
            pipeline_id: pipeline_id.into(),
            stage: None,
            status: None,
            progress: None,
            message: None,
            metadata: None,
            timestamp: now,
        }
    }

    /// Build a `pipeline_status` event.
    #[must_use]
    pub fn pipeline_status(
        pipeline_id: impl Into<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: PipelineEventType::PipelineStatus,
            pipeline_id: pipeline_id.into(),
            stage: None,
            status: Some(status.into()),
            progress: None,
            message: None,
            metadata: None,
            timestamp: now,
        }
    }

    /// Build a `pipeline_complete` event.
    #[must_use]
    pub fn pipeline_complete(pipeline_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_type: PipelineEventType::PipelineComplete,
            pipeline_id: pipeline_id.into(),
            stage: None,
            status: None,
            progress: None,
            message: None,
            metadata: None,
            timestamp: now,
        }
    }

    /// Build a `pipeline_error` event from a rendered problem document.
    #[must_use]
    pub fn pipeline_error(
        pipeline_id: impl Into<String>,
        stage_id: Option<String>,
        message: impl Into<String>,
        hint: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        if let Some(h) = hint {
            metadata.insert("hint".to_string(), serde_json::json!(h));
        }
        Self {
            event_type: PipelineEventType::PipelineError,
            pipeline_id: pipeline_id.into(),
            stage: stage_id,
            status: None,
            progress: None,
            message: Some(message.into()),
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
            timestamp: now,
        }
    }

    /// Build a `stage_status` event.
    #[must_use]
    pub fn stage_status(
        pipeline_id: impl Into<String>,
        stage_id: impl Into<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: PipelineEventType::StageStatus,
            pipeline_id: pipeline_id.into(),
            stage: Some(stage_id.into()),
            status: Some(status.into()),
            progress: None,
            message: None,
            metadata: None,
            timestamp: now,
        }
    }

    /// Build a `stage_progress` event.
    #[must_use]
    pub fn stage_progress(
        pipeline_id: impl Into<String>,
        stage_id: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: PipelineEventType::StageProgress,
            pipeline_id: pipeline_id.into(),
            stage: Some(stage_id.into()),
            status: None,
            progress: Some(progress),
            message: Some(message.into()),
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
            timestamp: now,
        }
    }

    /// Build a `refresh` event listing logical surfaces to re-read.
    #[must_use]
    pub fn refresh(pipeline_id: impl Into<String>, components: Vec<String>, now: DateTime<Utc>) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("components".to_string(), serde_json::json!(components));
        Self {
            event_type: PipelineEventType::Refresh,
            pipeline_id: pipeline_id.into(),
            stage: None,
            status: None,
            progress: None,
            message: None,
            metadata: Some(metadata),
            timestamp: now,
        }
    }
}
