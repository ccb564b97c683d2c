//! HTTP route handlers for commands, entities and the mirror.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use waymark_engine::{Command, DecideError, RebuildPolicy};

use super::json_error;
use super::state::AppState;
use crate::commands::rebuild_json;

/// HTTP status of a rejected command.
pub(crate) fn status_for(error: &DecideError) -> StatusCode {
    match error {
        DecideError::UnknownCommand { .. } => StatusCode::BAD_REQUEST,
        DecideError::InvalidTransition { .. } => StatusCode::CONFLICT,
        DecideError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        DecideError::InvalidCommand { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DecideError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DecideError::Conflict { .. } => StatusCode::CONFLICT,
        DecideError::ProjectionInvariantViolation { .. } | DecideError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn rejection(error: &DecideError) -> Response {
    let body = serde_json::json!({
        "error": error.kind(),
        "message": error.to_string(),
        "retryable": error.is_retryable(),
    });
    (status_for(error), Json(body)).into_response()
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "not found")
}

/// GET /health
pub(crate) async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runtime = &state.runtime;
    let mut response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_types": runtime.router.entity_types().collect::<Vec<_>>(),
        "halted": runtime.decider.halted(),
    });
    if let Some(mirror) = &runtime.mirror {
        let (pending, submitted, failed, skipped) = mirror.status().counts();
        response["mirror"] = serde_json::json!({
            "pending": pending,
            "submitted": submitted,
            "failed": failed,
            "skipped": skipped,
        });
    }
    (StatusCode::OK, Json(response))
}

/// POST /commands
pub(crate) async fn handle_command(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let command: Command = match serde_json::from_value(body) {
        Ok(c) => c,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("malformed command: {}", e))
                .into_response()
        }
    };

    match state.runtime.router.dispatch(&command).await {
        Ok(event) => (StatusCode::OK, Json(event)).into_response(),
        Err(e) => rejection(&e),
    }
}

/// GET /entities/{id}
pub(crate) async fn handle_get_entity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.runtime.decider.snapshot(&id).await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => {
            json_error(StatusCode::NOT_FOUND, &format!("entity '{}' not found", id)).into_response()
        }
        Err(e) => rejection(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    from: Option<i64>,
}

/// GET /entities/{id}/events?from=N
pub(crate) async fn handle_get_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let from = query.from.unwrap_or(1).max(1);
    match state.runtime.decider.history(&id, from).await {
        Ok(events) => {
            let body = serde_json::json!({ "entity_id": id, "from": from, "events": events });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => rejection(&e),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RebuildQuery {
    #[serde(default)]
    repair: bool,
}

/// POST /entities/{id}/rebuild?repair=true
pub(crate) async fn handle_rebuild(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RebuildQuery>,
) -> Response {
    let policy = if query.repair {
        RebuildPolicy::Repair
    } else {
        RebuildPolicy::Verify
    };
    let result = state.runtime.decider.rebuild(&id, policy).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(e) => status_for(e),
    };
    (status, Json(rebuild_json(&id, &result))).into_response()
}

/// GET /mirror/failed
pub(crate) async fn handle_mirror_failed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = match &state.runtime.mirror {
        Some(mirror) => serde_json::json!({ "enabled": true, "failed": mirror.status().failed() }),
        None => serde_json::json!({ "enabled": false, "failed": [] }),
    };
    (StatusCode::OK, Json(body))
}
