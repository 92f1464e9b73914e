// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the pipeline orchestration core.
//!
//! Every error raised anywhere in the engine — by a stage, the resolver, the
//! broadcaster, or the metrics store — is a [`PipelineError`]. Each variant
//! carries a stable [`ErrorCode`], a [`ErrorCategory`], a human message, and
//! an optional `hint` with operator-facing remediation text. The same type
//! renders both `StageState.error` / `PipelineState.error` and the HTTP
//! API's RFC 7807 problem documents, so there is exactly one error
//! representation in the system.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family an [`ErrorCode`] belongs to; mirrors the taxonomy in the
/// orchestration design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Pre-condition for a stage failed (bad dates, missing inputs).
    Validation,
    /// Transient execution fault; retry policy applies.
    Execution,
    /// Stage exceeded its deadline.
    Timeout,
    /// User or system cancelled the run.
    Cancellation,
    /// Registry or resolver problem detected at execute entry.
    Dependency,
    /// Broadcaster, metrics, or other infrastructure failure.
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Cancellation => "cancellation",
            Self::Dependency => "dependency",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string that does not
/// change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A stage precondition failed (e.g. `to_date < from_date`).
    ValidationFailed,
    /// Transient I/O or external fault; consumes a retry attempt.
    ExecutionRetryable,
    /// Stage body refused with a non-retryable condition.
    ExecutionFatal,
    /// Stage exceeded its deadline.
    Timeout,
    /// Pipeline or stage was cancelled.
    Cancelled,
    /// Requested stage id is not registered.
    DependencyNotFound,
    /// A stage id was registered more than once.
    DependencyDuplicate,
    /// The requested stage set contains a cycle.
    DependencyCyclic,
    /// A requested stage depends on an unregistered stage.
    DependencyMissing,
    /// Broadcaster, metrics store, or other infrastructure failed.
    SystemFailure,
    /// A pipeline with the requested id is already running.
    Conflict,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationFailed => ErrorCategory::Validation,
            Self::ExecutionRetryable | Self::ExecutionFatal => ErrorCategory::Execution,
            Self::Timeout => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::DependencyNotFound
            | Self::DependencyDuplicate
            | Self::DependencyCyclic
            | Self::DependencyMissing => ErrorCategory::Dependency,
            Self::SystemFailure | Self::Conflict => ErrorCategory::System,
        }
    }

    /// Stable `&'static str` representation (e.g. `"TIMEOUT"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ExecutionRetryable => "EXECUTION_RETRYABLE",
            Self::ExecutionFatal => "EXECUTION_FATAL",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::DependencyNotFound => "DEPENDENCY_NOT_FOUND",
            Self::DependencyDuplicate => "DEPENDENCY_DUPLICATE",
            Self::DependencyCyclic => "DEPENDENCY_CYCLIC",
            Self::DependencyMissing => "DEPENDENCY_MISSING",
            Self::SystemFailure => "SYSTEM_FAILURE",
            Self::Conflict => "CONFLICT",
        }
    }

    /// Whether an error carrying this code consumes a retry attempt.
    ///
    /// Only [`Self::ExecutionRetryable`] and [`Self::Timeout`] are retryable;
    /// every other code is either terminal or already exhausted.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionRetryable | Self::Timeout)
    }

    /// The HTTP status code this error maps to in a problem document.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationFailed => 400,
            Self::DependencyNotFound => 404,
            Self::Conflict => 409,
            Self::Cancelled => 499,
            Self::Timeout => 504,
            Self::ExecutionRetryable
            | Self::ExecutionFatal
            | Self::DependencyDuplicate
            | Self::DependencyCyclic
            | Self::DependencyMissing
            | Self::SystemFailure => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Unified pipeline error.
///
/// # Examples
///
/// ```
/// use isx_error::{PipelineError, ErrorCode};
///
/// let err = PipelineError::new(ErrorCode::Timeout, "stage exceeded 10m deadline")
///     .with_hint("rerun with a longer PIPELINE_STAGE_TIMEOUT_MS override")
///     .with_stage("scrape");
/// assert_eq!(err.code, ErrorCode::Timeout);
/// ```
#[derive(thiserror::Error)]
#[error("[{code}] {message}")]
pub struct PipelineError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Stage id this error originated from, if any.
    pub stage_id: Option<String>,
    /// Short, human-readable remediation string.
    pub hint: Option<String>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Optional underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PipelineError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage_id: None,
            hint: None,
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach the stage id this error is about.
    #[must_use]
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Attach operator-facing remediation text.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a key-value pair to the diagnostic context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.is_retryable()`.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Render this error as an RFC 7807 problem document.
    #[must_use]
    pub fn to_problem_document(&self) -> ProblemDocument {
        ProblemDocument {
            r#type: format!("https://isx-pipeline/errors/{}", self.code.as_str().to_lowercase()),
            title: self.code.category().to_string(),
            status: self.code.http_status(),
            detail: self.message.clone(),
            stage_id: self.stage_id.clone(),
            hint: self.hint.clone(),
            code: self.code,
        }
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PipelineError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref s) = self.stage_id {
            d.field("stage_id", s);
        }
        if let Some(ref h) = self.hint {
            d.field("hint", h);
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

// ---------------------------------------------------------------------------
// ProblemDocument
// ---------------------------------------------------------------------------

/// RFC 7807 problem document, the wire rendering of a [`PipelineError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProblemDocument {
    /// A URI identifying the problem type.
    pub r#type: String,
    /// Short, human-readable summary (the error category).
    pub title: String,
    /// HTTP status code.
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    pub detail: String,
    /// Stage id this problem is about, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// Short remediation hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Machine-readable error code (extension member).
    pub code: ErrorCode,
}

impl From<&PipelineError> for ProblemDocument {
    fn from(err: &PipelineError) -> Self {
        err.to_problem_document()
    }
}
