// SPDX-License-Identifier: MIT OR Apache-2.0
//! REST endpoint tests for the daemon: start/status/cancel/healthz and the
//! license gate wrapping them.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use isx_core::{CancellationToken, PipelineState, Stage, StageHandle};
use isx_daemon::middleware::{AlwaysValid, LicenseGate};
use isx_daemon::{build_app, AppState};
use isx_error::PipelineError;
use isx_metrics::MetricsStore;
use isx_runtime::{EventBroadcaster, Manager, ManagerConfig};
use tower::ServiceExt;

struct ImmediateStage;

#[async_trait::async_trait]
impl Stage for ImmediateStage {
    fn id(&self) -> &str {
        "scrape"
    }
    fn name(&self) -> &str {
        "scrape"
    }
    fn dependencies(&self) -> &[String] {
        &[]
    }
    async fn execute(&self, _cancel: CancellationToken, _handle: StageHandle) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct SlowStage;

#[async_trait::async_trait]
impl Stage for SlowStage {
    fn id(&self) -> &str {
        "scrape"
    }
    fn name(&self) -> &str {
        "scrape"
    }
    fn dependencies(&self) -> &[String] {
        &[]
    }
    async fn execute(&self, cancel: CancellationToken, _handle: StageHandle) -> Result<(), PipelineError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(()),
            _ = cancel.cancelled() => Err(PipelineError::new(isx_error::ErrorCode::Cancelled, "cancelled")),
        }
    }
}

fn no_op_gate() -> LicenseGate {
    LicenseGate::new(
        Arc::new(AlwaysValid),
        Duration::from_secs(300),
        Duration::from_secs(5),
        vec!["/healthz".into()],
    )
}

async fn test_app(stage: impl Stage + 'static) -> (axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(MetricsStore::new(dir.path()).await.unwrap());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let mut manager = Manager::new(broadcaster, metrics, ManagerConfig::default());
    manager.register_stage(stage).unwrap();
    let state = AppState {
        manager: Arc::new(manager),
    };
    (build_app(state, no_op_gate().into_layer()), dir)
}

fn start_body() -> serde_json::Value {
    serde_json::json!({
        "mode": "initial",
        "from_date": "2026-01-01",
        "to_date": "2026-01-02",
        "download_dir": "/tmp/in",
        "report_dir": "/tmp/out",
    })
}

#[tokio::test]
async fn healthz_returns_ok_without_license_check() {
    let (app, _dir) = test_app(SlowStage).await;
    let resp = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn start_pipeline_returns_202_with_pipeline_id() {
    let (app, _dir) = test_app(ImmediateStage).await;
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/start")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&start_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(json["pipeline_id"].as_str().unwrap().len() > 0);
}

#[tokio::test]
async fn status_reports_404_for_unknown_pipeline() {
    let (app, _dir) = test_app(ImmediateStage).await;
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/api/pipeline/status?pipeline_id=does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["code"], "DEPENDENCY_NOT_FOUND");
}

#[tokio::test]
async fn status_reflects_completion_after_start() {
    let (app, _dir) = test_app(ImmediateStage).await;
    let start_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/start")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&start_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = start_resp.into_body().collect().await.unwrap().to_bytes();
    let started: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let pipeline_id = started["pipeline_id"].as_str().unwrap().to_string();

    for _ in 0..50 {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/pipeline/status?pipeline_id={pipeline_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        if resp.status() == StatusCode::OK {
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            let state: PipelineState = serde_json::from_slice(&body).unwrap();
            if state.status.is_terminal() {
                assert_eq!(state.status, isx_core::PipelineStatus::Completed);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pipeline never reached a terminal status via the status endpoint");
}

#[tokio::test]
async fn cancel_accepts_a_running_pipeline() {
    let (app, _dir) = test_app(SlowStage).await;
    let start_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/start")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&start_body()).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = start_resp.into_body().collect().await.unwrap().to_bytes();
    let started: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let pipeline_id = started["pipeline_id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let cancel_resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/cancel")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&serde_json::json!({ "pipeline_id": pipeline_id })).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(cancel_resp.status(), StatusCode::ACCEPTED);

    // The stage that was actually running when cancellation landed must end
    // up `Cancelled`, not `Failed` or `Completed`.
    for _ in 0..50 {
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/pipeline/status?pipeline_id={pipeline_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        if resp.status() == StatusCode::OK {
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            let state: PipelineState = serde_json::from_slice(&body).unwrap();
            if state.status.is_terminal() {
                assert_eq!(state.status, isx_core::PipelineStatus::Cancelled);
                assert_eq!(state.stage("scrape").unwrap().status, isx_core::StageStatus::Cancelled);
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cancelled pipeline never reached a terminal status via the status endpoint");
}

#[tokio::test]
async fn cancel_reports_404_for_unknown_pipeline() {
    let (app, _dir) = test_app(ImmediateStage).await;
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/pipeline/cancel")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(&serde_json::json!({ "pipeline_id": "missing" })).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_license_blocks_non_exempt_routes() {
    let dir = tempfile::tempdir().unwrap();
    let metrics = Arc::new(MetricsStore::new(dir.path()).await.unwrap());
    let broadcaster = Arc::new(EventBroadcaster::new());
    let mut manager = Manager::new(broadcaster, metrics, ManagerConfig::default());
    manager.register_stage(ImmediateStage).unwrap();
    let state = AppState {
        manager: Arc::new(manager),
    };

    struct NeverValid;
    #[async_trait::async_trait]
    impl isx_daemon::middleware::LicenseValidator for NeverValid {
        async fn validate(&self) -> bool {
            false
        }
    }

    let gate = LicenseGate::new(
        Arc::new(NeverValid),
        Duration::from_secs(300),
        Duration::from_secs(5),
        vec!["/healthz".into()],
    );
    let app = build_app(state, gate.into_layer());

    let healthz = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(healthz.status(), StatusCode::OK);

    let status = app
        .oneshot(
            Request::builder()
                .uri("/api/pipeline/status?pipeline_id=anything")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(status.status(), StatusCode::BAD_REQUEST);
}
