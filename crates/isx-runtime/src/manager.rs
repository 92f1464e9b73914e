// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Manager/Scheduler: drives one pipeline to completion per the
//! seven-step execution algorithm.

use crate::broadcast::{EventBroadcaster, EventSubscription};
use crate::progress::ProgressCalculator;
use crate::registry::StageRegistry;
use crate::resolver;
use chrono::Utc;
use isx_core::{
    CancellationToken, HandleSignal, HistoricalSample, LogLevel, PipelineEvent, PipelineRequest,
    PipelineState, PipelineStatus, Stage, StageHandle, StageState, StageStatus,
};
use isx_error::{ErrorCode, PipelineError};
use isx_metrics::MetricsStore;
use isx_retry::{retry_with_policy, RetryPolicy};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::Instrument;
use uuid::Uuid;

/// Stages default to a 10-minute deadline unless overridden per stage id.
const DEFAULT_REFRESH_COMPONENTS: &[&str] = &["reports", "indices", "tickers"];

/// Tunables threaded into the Manager; owned here rather than borrowed from
/// `isx-config` so `isx-runtime` has no dependency on the configuration
/// layer — `isx-daemon` maps `PipelineConfig` into this shape at startup.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Deadline applied to a stage attempt with no per-stage override.
    pub default_stage_timeout: Duration,
    /// Per-stage-id deadline overrides.
    pub stage_timeouts: BTreeMap<String, Duration>,
    /// Retry policy applied uniformly to every stage.
    pub retry_policy: RetryPolicy,
    /// Number of finished pipeline states retained in the in-memory index.
    pub history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_stage_timeout: isx_retry::TimeoutConfig::DEFAULT_PER_STAGE,
            stage_timeouts: BTreeMap::new(),
            retry_policy: RetryPolicy::default(),
            history_limit: 16,
        }
    }
}

struct ActiveRun {
    state: RwLock<PipelineState>,
    context: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
    cancel: CancellationToken,
}

/// Central orchestrator: owns the stage registry, drives pipelines
/// sequentially, and fans out events through the broadcaster.
pub struct Manager {
    registry: StageRegistry,
    broadcaster: Arc<EventBroadcaster>,
    metrics: Arc<MetricsStore>,
    config: ManagerConfig,
    runs: StdMutex<HashMap<String, Arc<ActiveRun>>>,
    history: StdMutex<VecDeque<PipelineState>>,
}

impl Manager {
    /// Build a manager with an empty registry.
    #[must_use]
    pub fn new(broadcaster: Arc<EventBroadcaster>, metrics: Arc<MetricsStore>, config: ManagerConfig) -> Self {
        Self {
            registry: StageRegistry::new(),
            broadcaster,
            metrics,
            config,
            runs: StdMutex::new(HashMap::new()),
            history: StdMutex::new(VecDeque::new()),
        }
    }

    /// Register a stage, delegating to the registry.
    pub fn register_stage(&mut self, stage: impl Stage + 'static) -> Result<(), PipelineError> {
        self.registry.register(stage)
    }

    /// Subscribe to the broadcaster's event stream.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.broadcaster.subscribe()
    }

    /// Whether a pipeline with this id currently has a run in flight.
    ///
    /// Used by the HTTP layer to decide between starting a run in the
    /// background and rejecting with a conflict before ever spawning it.
    #[must_use]
    pub fn is_running(&self, pipeline_id: &str) -> bool {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).contains_key(pipeline_id)
    }

    /// Request cooperative cancellation of a running pipeline.
    pub fn cancel(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        match runs.get(pipeline_id) {
            Some(run) => {
                run.cancel.cancel();
                Ok(())
            }
            None => Err(PipelineError::new(
                ErrorCode::DependencyNotFound,
                format!("pipeline '{pipeline_id}' is not running"),
            )),
        }
    }

    /// Return a deep-copy snapshot of a pipeline's state, live or historical.
    pub async fn get(&self, pipeline_id: &str) -> Result<PipelineState, PipelineError> {
        let run = self.runs.lock().unwrap_or_else(|e| e.into_inner()).get(pipeline_id).cloned();
        if let Some(run) = run {
            let mut state = run.state.read().await.clone();
            state.context = run.context.read().await.clone();
            return Ok(state);
        }
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .find(|s| s.id == pipeline_id)
            .cloned()
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorCode::DependencyNotFound,
                    format!("no pipeline state found for '{pipeline_id}'"),
                )
            })
    }

    /// Drive one pipeline run to completion per the seven-step algorithm.
    pub async fn execute(&self, request: PipelineRequest) -> Result<PipelineState, PipelineError> {
        request.validate()?;
        let id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if runs.contains_key(&id) {
                return Err(PipelineError::new(
                    ErrorCode::Conflict,
                    format!("pipeline '{id}' is already running"),
                )
                .with_stage(id));
            }
        }

        let span = tracing::info_span!("pipeline_execute", pipeline_id = %id);
        self.execute_inner(id, request).instrument(span).await
    }

    async fn execute_inner(
        &self,
        id: String,
        request: PipelineRequest,
    ) -> Result<PipelineState, PipelineError> {
        let now = Utc::now();
        self.broadcaster.publish(&PipelineEvent::pipeline_reset(&id, now));

        let mut state = PipelineState::new(id.clone(), request, now);
        let seeded_context = initial_context(&state.config);

        let all_ids: Vec<String> = self.registry.registration_order().to_vec();
        let order = match resolver::resolve(&self.registry, &all_ids) {
            Ok(order) => order,
            Err(err) => return Err(err),
        };
        for stage_id in &order {
            let stage = self.registry.get(stage_id).expect("resolved id is registered");
            state.stages.push(StageState::pending(stage_id.clone(), stage.name().to_string()));
        }

        state.status = PipelineStatus::Running;
        self.broadcaster
            .publish(&PipelineEvent::pipeline_status(&id, "running", Utc::now()));

        let run = Arc::new(ActiveRun {
            state: RwLock::new(state),
            context: Arc::new(RwLock::new(seeded_context)),
            cancel: CancellationToken::new(),
        });
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), Arc::clone(&run));

        self.drive(&id, &order, &run).await;

        self.runs.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        let mut final_state = run.state.read().await.clone();
        final_state.context = run.context.read().await.clone();
        self.push_history(final_state.clone());
        Ok(final_state)
    }

    async fn drive(&self, id: &str, order: &[String], run: &Arc<ActiveRun>) {
        for (idx, stage_id) in order.iter().enumerate() {
            if run.cancel.is_cancelled() {
                self.cancel_remaining(id, run, &order[idx..]).await;
                self.finish_as_cancelled(id, run).await;
                return;
            }

            let stage = self.registry.get(stage_id).expect("registered");
            let now = Utc::now();
            {
                let mut state = run.state.write().await;
                let s = state.stage_mut(stage_id).expect("stage present");
                s.status = StageStatus::Active;
                s.start_time = Some(now);
            }
            self.broadcaster
                .publish(&PipelineEvent::stage_status(id, stage_id.as_str(), "active", now));

            let validation_snapshot = {
                let mut snapshot = run.state.read().await.clone();
                snapshot.context = run.context.read().await.clone();
                snapshot
            };
            if let Err(err) = stage.validate(&validation_snapshot).await {
                let err = err.with_stage(stage_id.clone());
                self.fail_stage(id, run, stage_id, &err).await;
                self.cancel_remaining(id, run, &order[idx + 1..]).await;
                self.finish_as_failed(id, run, &err).await;
                return;
            }

            match self.run_stage_with_retry(id, stage_id, &stage, run).await {
                Ok(StageOutcome::Completed) => {
                    if run.cancel.is_cancelled() {
                        self.cancel_stage(id, run, stage_id).await;
                        self.cancel_remaining(id, run, &order[idx + 1..]).await;
                        self.finish_as_cancelled(id, run).await;
                        return;
                    }
                    let now = Utc::now();
                    let mut state = run.state.write().await;
                    let s = state.stage_mut(stage_id).expect("stage present");
                    s.progress = 100;
                    s.status = StageStatus::Completed;
                    s.end_time = Some(now);
                    drop(state);
                    self.broadcaster
                        .publish(&PipelineEvent::stage_progress(id, stage_id.as_str(), 100, "completed", BTreeMap::new(), now));
                    self.broadcaster
                        .publish(&PipelineEvent::stage_status(id, stage_id.as_str(), "completed", now));
                }
                Ok(StageOutcome::Skipped) => {
                    let now = Utc::now();
                    let mut state = run.state.write().await;
                    let s = state.stage_mut(stage_id).expect("stage present");
                    s.status = StageStatus::Skipped;
                    s.end_time = Some(now);
                    drop(state);
                    self.broadcaster
                        .publish(&PipelineEvent::stage_status(id, stage_id.as_str(), "skipped", now));
                }
                Err(err) if err.code == ErrorCode::Cancelled => {
                    self.cancel_stage(id, run, stage_id).await;
                    self.cancel_remaining(id, run, &order[idx + 1..]).await;
                    self.finish_as_cancelled(id, run).await;
                    return;
                }
                Err(err) => {
                    let err = err.with_stage(stage_id.clone());
                    self.fail_stage(id, run, stage_id, &err).await;
                    self.cancel_remaining(id, run, &order[idx + 1..]).await;
                    self.finish_as_failed(id, run, &err).await;
                    return;
                }
            }
        }

        self.finish_as_completed(id, run).await;
    }

    async fn run_stage_with_retry(
        &self,
        id: &str,
        stage_id: &str,
        stage: &Arc<dyn Stage>,
        run: &Arc<ActiveRun>,
    ) -> Result<StageOutcome, PipelineError> {
        let timeout = self
            .config
            .stage_timeouts
            .get(stage_id)
            .copied()
            .unwrap_or(self.config.default_stage_timeout);
        let historical_median = match self.metrics.median(stage_id).await {
            Ok(median) => median,
            Err(err) => {
                tracing::warn!(target: "isx.runtime", stage_id = %stage_id, %err, "failed to read historical metrics, proceeding without them");
                None
            }
        };

        let outcome = retry_with_policy(&self.config.retry_policy, |attempt| {
            let stage = Arc::clone(stage);
            let cancel = run.cancel.clone();
            let context = Arc::clone(&run.context);
            let broadcaster = Arc::clone(&self.broadcaster);
            let metrics = Arc::clone(&self.metrics);
            let id = id.to_string();
            let stage_id = stage_id.to_string();
            let run = Arc::clone(run);
            let span = tracing::info_span!("stage_attempt", stage_id = %stage_id, attempt);
            async move {
                if attempt > 0 {
                    let mut state = run.state.write().await;
                    if let Some(s) = state.stage_mut(&stage_id) {
                        s.reset_for_attempt();
                    }
                    drop(state);
                    broadcaster.publish(&PipelineEvent::stage_status(id.as_str(), stage_id.as_str(), "active", Utc::now()));
                }

                let attempt_start = Instant::now();
                let started_at = Utc::now();
                let (signals_tx, signals_rx) = tokio::sync::mpsc::unbounded_channel();
                let handle = StageHandle::new(stage_id.clone(), signals_tx, context);

                let execute_fut = stage.execute(cancel, handle.clone());
                let mut calc = ProgressCalculator::new(started_at, historical_median);

                let driven = drive_attempt(execute_fut, signals_rx, &run, &id, &stage_id, &broadcaster, &mut calc);
                let result = tokio::time::timeout(timeout, driven).await;

                match result {
                    Err(_elapsed) => Err(PipelineError::new(
                        ErrorCode::Timeout,
                        format!("stage '{stage_id}' exceeded its {:.0}s deadline", timeout.as_secs_f64()),
                    )
                    .with_stage(stage_id.clone())),
                    Ok(Err(err)) => Err(err),
                    Ok(Ok(())) => {
                        if handle.skip_requested() {
                            Ok(StageOutcome::Skipped)
                        } else {
                            let sample = HistoricalSample {
                                schema_version: HistoricalSample::current_schema_version(),
                                stage_id: stage_id.clone(),
                                duration_ns: attempt_start.elapsed().as_nanos() as u64,
                                started_at,
                                n_units: None,
                            };
                            if let Err(err) = metrics.record(sample).await {
                                tracing::warn!(target: "isx.runtime", stage_id = %stage_id, %err, "failed to persist historical metrics sample");
                            }
                            Ok(StageOutcome::Completed)
                        }
                    }
                }
            }
            .instrument(span)
        })
        .await;

        match outcome {
            Ok(retry_outcome) => Ok(retry_outcome.value),
            Err(err) => Err(err),
        }
    }

    async fn fail_stage(&self, id: &str, run: &Arc<ActiveRun>, stage_id: &str, err: &PipelineError) {
        let now = Utc::now();
        {
            let mut state = run.state.write().await;
            if let Some(s) = state.stage_mut(stage_id) {
                s.status = StageStatus::Failed;
                s.end_time = Some(now);
                s.error = Some(err.to_problem_document());
            }
        }
        self.broadcaster
            .publish(&PipelineEvent::pipeline_error(id, Some(stage_id.to_string()), err.message.clone(), err.hint.clone(), now));
    }

    /// Mark the stage that was actually executing when cancellation landed
    /// as `Cancelled`, distinct from `cancel_remaining`'s handling of stages
    /// that never started.
    async fn cancel_stage(&self, id: &str, run: &Arc<ActiveRun>, stage_id: &str) {
        let now = Utc::now();
        {
            let mut state = run.state.write().await;
            if let Some(s) = state.stage_mut(stage_id) {
                s.status = StageStatus::Cancelled;
                s.end_time = Some(now);
            }
        }
        self.broadcaster
            .publish(&PipelineEvent::stage_status(id, stage_id, "cancelled", now));
    }

    async fn cancel_remaining(&self, id: &str, run: &Arc<ActiveRun>, remaining: &[String]) {
        let now = Utc::now();
        let mut state = run.state.write().await;
        for stage_id in remaining {
            if let Some(s) = state.stage_mut(stage_id) {
                if s.status == StageStatus::Pending {
                    s.status = StageStatus::Cancelled;
                    s.end_time = Some(now);
                }
            }
        }
        drop(state);
        for stage_id in remaining {
            self.broadcaster
                .publish(&PipelineEvent::stage_status(id, stage_id.as_str(), "cancelled", now));
        }
    }

    async fn finish_as_failed(&self, id: &str, run: &Arc<ActiveRun>, err: &PipelineError) {
        let now = Utc::now();
        let mut state = run.state.write().await;
        state.status = PipelineStatus::Failed;
        state.end_time = Some(now);
        state.error = Some(err.to_problem_document());
    }

    async fn finish_as_cancelled(&self, id: &str, run: &Arc<ActiveRun>) {
        let now = Utc::now();
        {
            let mut state = run.state.write().await;
            state.status = PipelineStatus::Cancelled;
            state.end_time = Some(now);
        }
        self.broadcaster
            .publish(&PipelineEvent::pipeline_status(id, "cancelled", now));
    }

    async fn finish_as_completed(&self, id: &str, run: &Arc<ActiveRun>) {
        let now = Utc::now();
        {
            let mut state = run.state.write().await;
            state.status = PipelineStatus::Completed;
            state.end_time = Some(now);
        }
        self.broadcaster.publish(&PipelineEvent::pipeline_complete(id, now));
        let components = DEFAULT_REFRESH_COMPONENTS.iter().map(|s| s.to_string()).collect();
        self.broadcaster.publish(&PipelineEvent::refresh(id, components, now));
    }

    fn push_history(&self, state: PipelineState) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.retain(|s| s.id != state.id);
        history.push_back(state);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

enum StageOutcome {
    Completed,
    Skipped,
}

/// Run `execute_fut` to completion while concurrently draining `signals_rx`
/// into pipeline state updates and broadcast events.
async fn drive_attempt(
    execute_fut: impl std::future::Future<Output = Result<(), PipelineError>>,
    mut signals_rx: tokio::sync::mpsc::UnboundedReceiver<HandleSignal>,
    run: &Arc<ActiveRun>,
    id: &str,
    stage_id: &str,
    broadcaster: &Arc<EventBroadcaster>,
    calc: &mut ProgressCalculator,
) -> Result<(), PipelineError> {
    tokio::pin!(execute_fut);
    loop {
        tokio::select! {
            biased;
            signal = signals_rx.recv() => {
                match signal {
                    Some(HandleSignal::Progress { percent, message, metadata }) => {
                        let now = Utc::now();
                        let estimate = calc.record(now, percent);
                        let message = if message.is_empty() { estimate.message.clone() } else { message };
                        let mut merged_metadata = metadata.clone();
                        if let Some(eta) = estimate.eta {
                            merged_metadata.insert("eta_ms".to_string(), serde_json::json!(eta.as_millis() as u64));
                            merged_metadata.insert("estimated".to_string(), serde_json::json!(estimate.estimated));
                        }
                        {
                            let mut state = run.state.write().await;
                            if let Some(s) = state.stage_mut(stage_id) {
                                s.progress = percent;
                                s.message = message.clone();
                                s.metadata = merged_metadata.clone();
                            }
                        }
                        if calc.should_emit(now, percent, &message) {
                            broadcaster.publish(&PipelineEvent::stage_progress(id, stage_id, percent, message, merged_metadata, now));
                        }
                    }
                    Some(HandleSignal::Log { level, message }) => {
                        emit_log(stage_id, level, &message);
                    }
                    None => {}
                }
            }
            result = &mut execute_fut => {
                return result;
            }
        }
    }
}

/// Seed the shared run context from the request so stage bodies can read
/// `mode`/`from_date`/`to_date`/`download_dir`/`report_dir`/`parameters`
/// via `handle.read(...)` without the Manager threading them through every
/// call site.
fn initial_context(request: &PipelineRequest) -> BTreeMap<String, serde_json::Value> {
    let mut ctx = BTreeMap::new();
    ctx.insert("mode".to_string(), serde_json::json!(request.mode));
    ctx.insert("from_date".to_string(), serde_json::json!(request.from_date));
    ctx.insert("to_date".to_string(), serde_json::json!(request.to_date));
    ctx.insert("download_dir".to_string(), serde_json::json!(request.download_dir));
    ctx.insert("report_dir".to_string(), serde_json::json!(request.report_dir));
    ctx.insert("parameters".to_string(), serde_json::json!(request.parameters));
    ctx
}

fn emit_log(stage_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "isx.stage", stage_id = %stage_id, "{message}"),
        LogLevel::Info => tracing::info!(target: "isx.stage", stage_id = %stage_id, "{message}"),
        LogLevel::Warn => tracing::warn!(target: "isx.stage", stage_id = %stage_id, "{message}"),
        LogLevel::Error => tracing::error!(target: "isx.stage", stage_id = %stage_id, "{message}"),
    }
}
