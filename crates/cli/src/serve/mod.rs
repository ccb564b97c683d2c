//! `waymark serve` -- HTTP JSON API over the lifecycle engine.
//!
//! Security features:
//! - CORS headers on all responses (permissive for local dev)
//! - Per-IP rate limiting (default: 600 req/min, `WAYMARK_RATE_LIMIT`)
//! - Optional API key authentication via `WAYMARK_API_KEY`
//!
//! The API key only gates access to the server. The `requester` of a command
//! is taken from the request body as given and is what capability checks run
//! against, so every holder of the key can act as any requester. Deploy
//! behind a gateway that sets `requester` when that matters.
//!
//! Endpoints:
//! - GET  /health                     - Server status (exempt from auth)
//! - POST /commands                   - Decide one command; returns the event
//! - GET  /entities/{id}              - Current snapshot
//! - GET  /entities/{id}/events       - Event history (`?from=N`, inclusive)
//! - POST /entities/{id}/rebuild      - Replay the log (`?repair=true` to overwrite)
//! - GET  /mirror/failed              - Ledger submissions that exhausted retries
//!
//! All responses use Content-Type: application/json.

mod handlers;
mod middleware;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_command, handle_get_entity, handle_get_events, handle_health, handle_mirror_failed,
    handle_not_found, handle_rebuild,
};
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use crate::config::WaymarkConfig;
use crate::runtime::Runtime;

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

const DEFAULT_RATE_LIMIT: u64 = 600;

const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// How long shutdown waits for queued mirror submissions.
const MIRROR_GRACE: Duration = Duration::from_secs(10);

fn json_error(status: StatusCode, message: &str) -> impl IntoResponse {
    (status, Json(serde_json::json!({"error": message})))
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/commands", post(handle_command))
        .route("/entities/{id}", get(handle_get_entity))
        .route("/entities/{id}/events", get(handle_get_events))
        .route("/entities/{id}/rebuild", post(handle_rebuild))
        .route("/mirror/failed", get(handle_mirror_failed))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Build the runtime from `config` and serve until Ctrl+C.
pub async fn start_server(
    port: u16,
    config: WaymarkConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Runtime::build(&config)?;

    let rate_limit = std::env::var("WAYMARK_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT);
    let api_key = std::env::var("WAYMARK_API_KEY")
        .ok()
        .filter(|k| !k.is_empty());

    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(rate_limit, "per-IP rate limit (requests per minute)");

    let state = Arc::new(AppState {
        runtime,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    });
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("waymark listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.runtime.shutdown(MIRROR_GRACE).await;
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
