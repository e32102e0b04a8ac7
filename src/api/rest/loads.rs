use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::assignment::AssignOutcome;
use crate::engine::lifecycle::{TerminalTransition, TransitionOutcome};
use crate::error::AppError;
use crate::models::{DispatcherId, Load, NewLoad};
use crate::state::AppState;

pub const DISPATCHER_HEADER: &str = "x-dispatcher-id";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/loads", post(create_load).get(list_loads))
        .route("/loads/bulk", post(create_loads))
        .route("/loads/:id", get(get_load))
        .route("/loads/:id/assign", post(assign_load))
        .route("/loads/:id/complete", post(complete_load))
        .route("/loads/:id/cancel", post(cancel_load))
}

#[derive(Deserialize)]
pub struct BulkCreateRequest {
    pub loads: Vec<NewLoad>,
}

#[derive(Deserialize, Default)]
pub struct TransitionRequest {
    pub expected_version: Option<u64>,
}

async fn create_load(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewLoad>,
) -> Result<Json<Load>, AppError> {
    let load = state.intake.create(payload).await?;
    Ok(Json(load))
}

async fn create_loads(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<BulkCreateRequest>,
) -> Result<Json<Vec<Load>>, AppError> {
    let loads = state.intake.create_many(payload.loads).await?;
    Ok(Json(loads))
}

async fn list_loads(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Load>>, AppError> {
    Ok(Json(state.store.scan()?))
}

async fn get_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Load>, AppError> {
    Ok(Json(state.store.get(id)?))
}

async fn assign_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let dispatcher_id = dispatcher_from(&headers)?;
    let outcome = state.coordinator.assign(id, dispatcher_id).await?;

    let status = match &outcome {
        AssignOutcome::Assigned { .. } => StatusCode::OK,
        AssignOutcome::AlreadyAssigned { .. } | AssignOutcome::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        AssignOutcome::NotFound => StatusCode::NOT_FOUND,
    };

    Ok((status, Json(outcome)).into_response())
}

async fn complete_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, AppError> {
    transition(&state, id, body, TerminalTransition::Complete).await
}

async fn cancel_load(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<Response, AppError> {
    transition(&state, id, body, TerminalTransition::Cancel).await
}

async fn transition(
    state: &AppState,
    id: Uuid,
    body: Bytes,
    kind: TerminalTransition,
) -> Result<Response, AppError> {
    let request = if body.is_empty() {
        TransitionRequest::default()
    } else {
        serde_json::from_slice::<TransitionRequest>(&body)
            .map_err(|err| AppError::BadRequest(format!("invalid body: {err}")))?
    };

    let outcome = state
        .lifecycle
        .transition(id, request.expected_version, kind)
        .await?;

    let status = match &outcome {
        TransitionOutcome::Applied { .. } => StatusCode::OK,
        TransitionOutcome::Conflict { .. } | TransitionOutcome::InvalidState { .. } => {
            StatusCode::CONFLICT
        }
        TransitionOutcome::NotFound => StatusCode::NOT_FOUND,
    };

    Ok((status, Json(outcome)).into_response())
}

fn dispatcher_from(headers: &HeaderMap) -> Result<DispatcherId, AppError> {
    headers
        .get(DISPATCHER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| DispatcherId(value.to_string()))
        .ok_or_else(|| AppError::BadRequest(format!("{DISPATCHER_HEADER} header is required")))
}
