// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end Manager scenarios: cancellation mid-run, per-stage timeout,
//! and live event delivery across a multi-stage pipeline.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use isx_core::{
    CancellationToken, PipelineEventType, PipelineMode, PipelineRequest, PipelineStatus, Stage,
    StageHandle, StageStatus,
};
use isx_error::{ErrorCode, PipelineError};
use isx_metrics::MetricsStore;
use isx_runtime::{EventBroadcaster, Manager, ManagerConfig};

fn request() -> PipelineRequest {
    PipelineRequest {
        id: None,
        mode: PipelineMode::Initial,
        from_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        to_date: NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(),
        parameters: BTreeMap::new(),
        download_dir: "/tmp/isx-in".into(),
        report_dir: "/tmp/isx-out".into(),
    }
}

async fn manager(config: ManagerConfig) -> (Manager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(MetricsStore::new(dir.path()).await.unwrap());
    let broadcaster = Arc::new(EventBroadcaster::new());
    (Manager::new(broadcaster, metrics, config), dir)
}

struct SlowStage {
    id: &'static str,
    deps: Vec<String>,
}

#[async_trait::async_trait]
impl Stage for SlowStage {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.id
    }
    fn dependencies(&self) -> &[String] {
        &self.deps
    }
    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        handle.progress(10, "starting");
        cancel.cancelled().await;
        Ok(())
    }
}

struct NeverFinishesStage;

#[async_trait::async_trait]
impl Stage for NeverFinishesStage {
    fn id(&self) -> &str {
        "stuck"
    }
    fn name(&self) -> &str {
        "Stuck stage"
    }
    fn dependencies(&self) -> &[String] {
        &[]
    }
    async fn execute(&self, _cancel: CancellationToken, _handle: StageHandle) -> Result<(), PipelineError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct ThreeStepStage(&'static str, Vec<String>);

#[async_trait::async_trait]
impl Stage for ThreeStepStage {
    fn id(&self) -> &str {
        self.0
    }
    fn name(&self) -> &str {
        self.0
    }
    fn dependencies(&self) -> &[String] {
        &self.1
    }
    async fn execute(&self, _cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        for pct in [33, 66, 100] {
            handle.progress(pct, format!("{pct}% through {}", self.0));
        }
        Ok(())
    }
}

#[tokio::test]
async fn cancelling_a_running_pipeline_stops_remaining_stages() {
    let (manager, _dir) = manager(ManagerConfig::default()).await;
    let mut manager = manager;
    manager
        .register_stage(SlowStage { id: "scrape", deps: vec![] })
        .unwrap();
    manager
        .register_stage(ThreeStepStage("process", vec!["scrape".to_string()]))
        .unwrap();

    let mut req = request();
    req.id = Some("cancel-me".to_string());

    let manager = Arc::new(manager);
    let runner = Arc::clone(&manager);
    let run = tokio::spawn(async move { runner.execute(req).await });

    // Give the pipeline a moment to enter the running state before cancelling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.cancel("cancel-me").unwrap();

    let state = run.await.unwrap().unwrap();
    assert_eq!(state.status, PipelineStatus::Cancelled);
    assert_eq!(state.stage("scrape").unwrap().status, StageStatus::Cancelled);
    assert_eq!(state.stage("process").unwrap().status, StageStatus::Cancelled);
}

/// A stage that does not observe the cancellation token at all and instead
/// returns the `Cancelled` error code itself, as the CLI-wrapping stages in
/// `isx-stages` do when the child process is killed.
struct ReportsOwnCancellation {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl Stage for ReportsOwnCancellation {
    fn id(&self) -> &str {
        "scrape"
    }
    fn name(&self) -> &str {
        "scrape"
    }
    fn dependencies(&self) -> &[String] {
        &[]
    }
    async fn execute(&self, cancel: CancellationToken, handle: StageHandle) -> Result<(), PipelineError> {
        handle.progress(10, "starting");
        self.started.notify_one();
        cancel.cancelled().await;
        Err(PipelineError::new(ErrorCode::Cancelled, "stage observed cancellation"))
    }
}

#[tokio::test]
async fn stage_that_errors_with_cancelled_code_is_marked_cancelled_not_failed() {
    let (manager, _dir) = manager(ManagerConfig::default()).await;
    let mut manager = manager;
    let started = Arc::new(tokio::sync::Notify::new());
    manager
        .register_stage(ReportsOwnCancellation { started: Arc::clone(&started) })
        .unwrap();
    manager
        .register_stage(ThreeStepStage("process", vec!["scrape".to_string()]))
        .unwrap();

    let mut req = request();
    req.id = Some("cancel-me-err".to_string());

    let manager = Arc::new(manager);
    let runner = Arc::clone(&manager);
    let run = tokio::spawn(async move { runner.execute(req).await });

    started.notified().await;
    manager.cancel("cancel-me-err").unwrap();

    let state = run.await.unwrap().unwrap();
    assert_eq!(state.status, PipelineStatus::Cancelled);
    assert_eq!(state.stage("scrape").unwrap().status, StageStatus::Cancelled);
    assert_eq!(state.stage("process").unwrap().status, StageStatus::Cancelled);
    assert!(state.error.is_none());
}

#[tokio::test]
async fn stage_exceeding_its_timeout_fails_the_pipeline() {
    let mut config = ManagerConfig::default();
    config.stage_timeouts.insert("stuck".to_string(), Duration::from_millis(20));
    config.retry_policy.max_attempts = 1;
    let (mut manager, _dir) = manager(config).await;
    manager.register_stage(NeverFinishesStage).unwrap();

    let state = manager.execute(request()).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
    let stage = state.stage("stuck").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.error.as_ref().unwrap().code, ErrorCode::Timeout);
}

#[tokio::test]
async fn subscriber_observes_progress_and_completion_events_in_order() {
    let (mut manager, _dir) = manager(ManagerConfig::default()).await;
    manager
        .register_stage(ThreeStepStage("scrape", vec![]))
        .unwrap();
    let sub = manager.subscribe();

    let mut req = request();
    req.id = Some("observed".to_string());
    let state = manager.execute(req).await.unwrap();
    assert_eq!(state.status, PipelineStatus::Completed);

    let mut saw_reset = false;
    let mut saw_complete = false;
    let mut saw_refresh = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
        match event.event_type {
            PipelineEventType::PipelineReset => saw_reset = true,
            PipelineEventType::PipelineComplete => saw_complete = true,
            PipelineEventType::Refresh => saw_refresh = true,
            _ => {}
        }
        if saw_reset && saw_complete && saw_refresh {
            break;
        }
    }
    assert!(saw_reset, "expected a pipeline_reset event");
    assert!(saw_complete, "expected a pipeline_complete event");
    assert!(saw_refresh, "expected a refresh event");
}

#[tokio::test]
async fn duplicate_active_pipeline_id_is_rejected() {
    let (manager, _dir) = manager(ManagerConfig::default()).await;
    manager
        .register_stage(SlowStage { id: "scrape", deps: vec![] })
        .unwrap();
    let manager = Arc::new(manager);

    let mut req = request();
    req.id = Some("dup".to_string());
    let runner = Arc::clone(&manager);
    let req_clone = req.clone();
    let first = tokio::spawn(async move { runner.execute(req_clone).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager.execute(req).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Conflict);

    manager.cancel("dup").unwrap();
    let _ = first.await.unwrap();
}

#[tokio::test]
async fn unknown_pipeline_id_lookup_reports_not_found() {
    let (manager, _dir) = manager(ManagerConfig::default()).await;
    let err = manager.get("never-existed").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::DependencyNotFound);
}
