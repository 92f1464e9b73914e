// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control plane for the ISX pipeline orchestration core.
//!
//! [`build_app`] wires four REST endpoints plus a `/ws` event stream onto a
//! shared [`AppState`], with the license-validation gate installed in front
//! of every route. All business logic lives in
//! [`isx_runtime::Manager`]; this crate only translates HTTP in and out.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The license-validation gate as a `tower::Layer`/`tower::Service` pair.
pub mod middleware;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use isx_core::PipelineRequest;
use isx_error::{ErrorCode, PipelineError};
use isx_runtime::Manager;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use middleware::LicenseGateLayer;

/// Shared state injected into every handler via [`axum::extract::State`].
#[derive(Clone)]
pub struct AppState {
    /// The orchestrator driving pipeline runs.
    pub manager: Arc<Manager>,
}

/// A [`PipelineError`], rendered as an RFC 7807 problem document response.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let doc = self.0.to_problem_document();
        let status = StatusCode::from_u16(doc.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(doc)).into_response()
    }
}

/// Response body for `POST /api/pipeline/start`.
#[derive(Debug, Serialize)]
pub struct StartResponse {
    /// The id assigned to (or echoed back for) this run.
    pub pipeline_id: String,
}

/// Query parameters for `GET /api/pipeline/status`.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// The id returned by the corresponding `/api/pipeline/start` call.
    pub pipeline_id: String,
}

/// Request body for `POST /api/pipeline/cancel`.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    /// The id of the run to cancel.
    pub pipeline_id: String,
}

/// Response body for a successful cancel.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// The id that was cancelled.
    pub pipeline_id: String,
}

/// Starts a run in the background and returns its id immediately; the
/// caller polls `/api/pipeline/status` or subscribes to `/ws` for progress.
///
/// Conflicts with an already-running id are detected before the run is
/// spawned so the 409 response is synchronous, matching the documented
/// contract; a conflict surfacing only after the background task starts
/// (a narrow TOCTOU window) is logged rather than surfaced to the caller,
/// since the 202 response has already been sent.
async fn start_pipeline(
    State(state): State<AppState>,
    Json(request): Json<PipelineRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let pipeline_id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());

    if state.manager.is_running(&pipeline_id) {
        return Err(PipelineError::new(
            ErrorCode::Conflict,
            format!("pipeline '{pipeline_id}' is already running"),
        )
        .with_stage(pipeline_id)
        .into());
    }

    let request = PipelineRequest {
        id: Some(pipeline_id.clone()),
        ..request
    };

    let manager = Arc::clone(&state.manager);
    let spawned_id = pipeline_id.clone();
    tokio::spawn(async move {
        if let Err(err) = manager.execute(request).await {
            warn!(pipeline_id = %spawned_id, error = %err, "pipeline run failed to start or complete");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(StartResponse { pipeline_id })))
}

async fn get_status(
    State(state): State<AppState>,
    Query(params): Query<StatusQuery>,
) -> Result<Json<isx_core::PipelineState>, ApiError> {
    let state = state.manager.get(&params.pipeline_id).await?;
    Ok(Json(state))
}

async fn cancel_pipeline(
    State(state): State<AppState>,
    Json(request): Json<CancelRequest>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    state.manager.cancel(&request.pipeline_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            pipeline_id: request.pipeline_id,
        }),
    ))
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> axum::response::Response {
    ws.on_upgrade(move |socket| ws_stream_events(socket, state))
}

/// Streams [`isx_core::PipelineEvent`]s to a single WebSocket client, one
/// JSON object per frame, until the client disconnects or the subscription
/// itself is dropped for lag (disconnect policy below).
async fn ws_stream_events(mut socket: WebSocket, state: AppState) {
    let subscription = state.manager.subscribe();
    loop {
        let Some(event) = subscription.recv().await else {
            break;
        };
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to serialize pipeline event for websocket frame");
                continue;
            }
        };
        if socket.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }
    info!(lag = subscription.lag(), "websocket subscriber disconnected");
}

/// Build the router: every route below goes through the license gate except
/// `/healthz`, which the gate exempts by path regardless of configuration.
#[must_use]
pub fn build_app(state: AppState, license_gate: LicenseGateLayer) -> Router {
    Router::new()
        .route("/api/pipeline/start", post(start_pipeline))
        .route("/api/pipeline/status", get(get_status))
        .route("/api/pipeline/cancel", post(cancel_pipeline))
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(license_gate)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
