// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Stage contract and the handle passed into `Execute`.

use crate::cancel::CancellationToken;
use crate::model::PipelineState;
use async_trait::async_trait;
use isx_error::PipelineError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Log level passed through [`StageHandle::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Fine-grained diagnostic detail.
    Debug,
    /// Normal operational detail.
    Info,
    /// Unexpected but non-fatal condition.
    Warn,
    /// A condition the stage is about to fail on.
    Error,
}

/// A signal emitted by a [`StageHandle`] for the Manager to observe.
#[derive(Debug, Clone)]
pub enum HandleSignal {
    /// Progress report: percent, message, and a snapshot of metadata.
    Progress {
        percent: u8,
        message: String,
        metadata: BTreeMap<String, serde_json::Value>,
    },
    /// A log line at the given level.
    Log { level: LogLevel, message: String },
}

/// The narrow capability given to a stage's `Execute` for reporting
/// progress and touching the pipeline's shared context.
///
/// `Execute` must never mutate [`crate::model::StageState`] directly; every
/// observable effect goes through this handle.
#[derive(Clone)]
pub struct StageHandle {
    stage_id: String,
    signals_tx: mpsc::UnboundedSender<HandleSignal>,
    context: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
    metadata: Arc<std::sync::Mutex<BTreeMap<String, serde_json::Value>>>,
    progress_started: Arc<AtomicBool>,
    skip_requested: Arc<AtomicBool>,
}

impl StageHandle {
    /// Construct a handle. Manager-internal: stage bodies only ever receive
    /// an already-constructed handle.
    #[must_use]
    pub fn new(
        stage_id: impl Into<String>,
        signals_tx: mpsc::UnboundedSender<HandleSignal>,
        context: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            signals_tx,
            context,
            metadata: Arc::new(std::sync::Mutex::new(BTreeMap::new())),
            progress_started: Arc::new(AtomicBool::new(false)),
            skip_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The id of the stage this handle belongs to.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Report progress. `percent` should be non-decreasing within an
    /// attempt; the Manager, not this handle, enforces emission cadence.
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        self.progress_started.store(true, Ordering::SeqCst);
        let metadata = self.metadata.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let _ = self.signals_tx.send(HandleSignal::Progress {
            percent: percent.min(100),
            message: message.into(),
            metadata,
        });
    }

    /// Attach or update a metadata key without emitting a progress event.
    ///
    /// Per the skip protocol, setting `"skip"` here is only honored by the
    /// Manager if it happens before the first call to [`Self::progress`].
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Serialize) {
        let key = key.into();
        if let Ok(v) = serde_json::to_value(&value) {
            if key == "skip" {
                if self.progress_started.load(Ordering::SeqCst) {
                    tracing::warn!(
                        target: "isx.stage_contract",
                        stage_id = %self.stage_id,
                        "skip flag set after first progress() call; Manager will ignore it"
                    );
                } else if v == serde_json::json!(true) {
                    self.skip_requested.store(true, Ordering::SeqCst);
                }
            }
            self.metadata
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, v);
        }
    }

    /// Whether this handle honored a `skip=true` request (set before the
    /// first [`Self::progress`] call). The Manager consults this, not the
    /// raw metadata map, so a late-set flag cannot retroactively trigger
    /// the skip protocol.
    #[must_use]
    pub fn skip_requested(&self) -> bool {
        self.skip_requested.load(Ordering::SeqCst)
    }

    /// Snapshot the metadata accumulated via [`Self::set_metadata`] and
    /// [`Self::progress`]. Manager-internal: used to resolve the skip
    /// protocol once `Execute` returns.
    #[must_use]
    pub fn metadata_snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.metadata.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether [`Self::progress`] has been called at least once on this
    /// handle. Manager-internal: used to validate the skip protocol.
    #[must_use]
    pub fn progress_has_started(&self) -> bool {
        self.progress_started.load(Ordering::SeqCst)
    }

    /// Read a key from the pipeline's shared context.
    pub async fn read(&self, key: &str) -> Option<serde_json::Value> {
        self.context.read().await.get(key).cloned()
    }

    /// Write a key into the pipeline's shared context.
    pub async fn write(&self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.write().await.insert(key.into(), v);
        }
    }

    /// Emit a log line attributed to this stage's tracing span.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.signals_tx.send(HandleSignal::Log {
            level,
            message: message.into(),
        });
    }
}

/// A named unit of work with declared dependencies, validation, and
/// execution, invoked by the Manager in topological order.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable, registry-unique identifier.
    fn id(&self) -> &str;

    /// Human-readable name for logs and events.
    fn name(&self) -> &str;

    /// Ids of stages that must complete before this one runs.
    fn dependencies(&self) -> &[String];

    /// Preflight check run once per pipeline, after resolution but before
    /// any stage executes. A failure here aborts the whole pipeline before
    /// any stage runs.
    async fn validate(&self, state: &PipelineState) -> Result<(), PipelineError> {
        let _ = state;
        Ok(())
    }

    /// Run the stage. Must return promptly after `cancel` is signalled, must
    /// call `handle.progress` at least once per observable sub-unit, and
    /// must classify returned errors using [`isx_error::ErrorCode`] so the
    /// retry policy can tell retryable and fatal errors apart.
    async fn execute(
        &self,
        cancel: CancellationToken,
        handle: StageHandle,
    ) -> Result<(), PipelineError>;
}
