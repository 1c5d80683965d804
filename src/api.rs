//! HTTP surface: webhook ingestion, approvals, snapshots, gates, SSE.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use stagegate_assess::{assess, SessionProgress, StageAssessment};
use stagegate_gate::GateResult;
use stagegate_machine::{DecisionRequest, NewEvidence};
use stagegate_types::{
    Checkpoint, EventDisposition, MachineError, PhaseId, PhaseRecord, RunEvent, RunId, RunSnapshot,
    StoreError, WorkerEvent,
};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/approvals/{checkpoint_id}", patch(decide_checkpoint))
        .route("/approvals/{checkpoint_id}/expire", post(expire_checkpoint))
        .route("/runs", post(create_run))
        .route("/runs/{run_id}", get(run_snapshot))
        .route("/runs/{run_id}/revise", post(revise_run))
        .route("/runs/{run_id}/phases/{phase}/gate", get(phase_gate))
        .route("/runs/{run_id}/evidence", post(append_evidence))
        .route("/runs/{run_id}/events", get(run_events))
        .route("/sessions/{session_id}/assess", post(assess_session))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error envelope; the status code is chosen deterministically from the
/// underlying error so clients can branch on it.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid or missing bearer token")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<MachineError> for ApiError {
    fn from(err: MachineError) -> Self {
        let status = match &err {
            MachineError::StaleCheckpoint { .. } | MachineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            MachineError::MalformedEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MachineError::WorkerUnreachable { .. } => StatusCode::BAD_GATEWAY,
            MachineError::Store(store) => return Self::from_store(store),
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::from_store(&err)
    }
}

impl ApiError {
    fn from_store(err: &StoreError) -> Self {
        let status = match err {
            StoreError::RunNotFound(_) | StoreError::CheckpointNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            StoreError::ConcurrentModification { .. } => StatusCode::CONFLICT,
            StoreError::InvalidQualityScore(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookResponse {
    accepted: bool,
    duplicate: bool,
    run_version: u64,
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<WorkerEvent>,
) -> Result<Json<WebhookResponse>, ApiError> {
    if !bearer_authorized(&state, &headers) {
        return Err(ApiError::unauthorized());
    }
    let ack = state.machine.handle_worker_event(&event)?;
    Ok(Json(WebhookResponse {
        accepted: true,
        duplicate: ack.disposition == EventDisposition::Duplicate,
        run_version: ack.run_version,
    }))
}

fn bearer_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.webhook_token else {
        return false;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected.as_str())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionResponse {
    checkpoint: Checkpoint,
    phase: PhaseRecord,
    run_version: u64,
}

async fn decide_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let outcome = state.machine.record_decision(checkpoint_id, &request).await?;
    Ok(Json(DecisionResponse {
        checkpoint: outcome.checkpoint,
        phase: outcome.phase,
        run_version: outcome.run_version,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpireRequest {
    #[serde(default = "default_sweep_actor")]
    actor: String,
}

fn default_sweep_actor() -> String {
    "sweep".to_string()
}

async fn expire_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Json(request): Json<ExpireRequest>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let outcome = state.machine.expire_checkpoint(checkpoint_id, &request.actor)?;
    Ok(Json(DecisionResponse {
        checkpoint: outcome.checkpoint,
        phase: outcome.phase,
        run_version: outcome.run_version,
    }))
}

async fn create_run(State(state): State<AppState>) -> (StatusCode, Json<RunSnapshot>) {
    let snapshot = state.store.create_run();
    (StatusCode::CREATED, Json(snapshot))
}

async fn run_snapshot(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<Json<RunSnapshot>, ApiError> {
    Ok(Json(state.store.snapshot(run_id)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReviseRequest {
    target_phase: PhaseId,
    actor: String,
}

async fn revise_run(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Json(request): Json<ReviseRequest>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let snapshot = state
        .machine
        .revise(run_id, request.target_phase, &request.actor)?;
    Ok(Json(snapshot))
}

async fn phase_gate(
    State(state): State<AppState>,
    Path((run_id, phase)): Path<(RunId, String)>,
) -> Result<Json<GateResult>, ApiError> {
    let phase = parse_phase(&phase)?;
    Ok(Json(state.machine.gate(run_id, phase)?))
}

/// Accepts either the numeric index (`2`) or the phase name
/// (`desirability`).
fn parse_phase(raw: &str) -> Result<PhaseId, ApiError> {
    if let Ok(index) = raw.parse::<u8>() {
        return PhaseId::try_from(index)
            .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e));
    }
    PhaseId::ALL
        .into_iter()
        .find(|p| p.as_str() == raw)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("unknown phase: {raw}"),
            )
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvidenceRequest {
    phase: PhaseId,
    items: Vec<NewEvidence>,
    #[serde(default = "default_evidence_actor")]
    actor: String,
    /// Run version the caller last saw; stale expectations get a 409.
    #[serde(default)]
    expected_version: Option<u64>,
}

fn default_evidence_actor() -> String {
    "analyst".to_string()
}

async fn append_evidence(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Json(request): Json<EvidenceRequest>,
) -> Result<Json<GateResult>, ApiError> {
    let result = state.machine.append_evidence(
        run_id,
        request.phase,
        &request.items,
        &request.actor,
        request.expected_version,
    )?;
    Ok(Json(result))
}

async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Reject streams for unknown runs up front.
    state.store.snapshot(run_id)?;
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let event = msg.ok()?;
        if event.run_id() != run_id {
            return None;
        }
        let name = event_name(&event);
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(name).data(data)))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_name(event: &RunEvent) -> &'static str {
    match event {
        RunEvent::PhaseChanged { .. } => "phase_changed",
        RunEvent::CheckpointRequested { .. } => "checkpoint_requested",
        RunEvent::CheckpointDecided { .. } => "checkpoint_decided",
        RunEvent::ReadinessAlert { .. } => "readiness_alert",
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssessRequest {
    transcript_delta: String,
}

async fn assess_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<AssessRequest>,
) -> Result<Json<StageAssessment>, ApiError> {
    let mut sessions = match state.sessions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let progress = sessions
        .entry(session_id)
        .or_insert_with(|| SessionProgress::new(session_id))
        .clone();
    let (updated, assessment) = assess(&state.stage_config, &progress, &request.transcript_delta);
    sessions.insert(session_id, updated);
    Ok(Json(assessment))
}
