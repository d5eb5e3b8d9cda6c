//! HTTP route handlers for the run API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use pilot::controller::RunRequest;
use pilot::core::intent::parse_user_message;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::sse;
use crate::state::AppState;

/// Build the full application: API routes under `/api` plus CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_router())
        .layer(cors)
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/test", post(start_test))
        .route("/test/{run_id}", get(get_test).delete(delete_test))
        .route("/test/{run_id}/stop", post(stop_test))
        .route("/test/{run_id}/messages", post(post_message))
        .route("/test/{run_id}/events", get(sse::events_handler))
}

pub fn not_found() -> Json<Value> {
    Json(json!({ "status": "not_found" }))
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct StartRequest {
    apk_path: String,
    test_prompt: String,
}

#[derive(Serialize)]
struct StartResponse {
    run_id: String,
    status: &'static str,
}

/// POST /api/test - create a run and start it in the background.
async fn start_test(State(state): State<AppState>, Json(body): Json<StartRequest>) -> Response {
    let goal = body.test_prompt.trim();
    if goal.is_empty() {
        return error(StatusCode::BAD_REQUEST, "test_prompt must be non-empty");
    }
    if body.apk_path.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "apk_path must be non-empty");
    }
    let request = RunRequest {
        app: body.apk_path,
        goal: goal.to_string(),
    };
    match state.registry.create(request) {
        Ok(run) => Json(StartResponse {
            run_id: run.run_id().to_string(),
            status: "started",
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "could not create driver");
            error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// GET /api/test/{run_id} - status and history.
async fn get_test(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.registry.status(&run_id) {
        Some(snapshot) => Json(json!({
            "status": snapshot.status,
            "goal": snapshot.goal,
            "history": snapshot.history,
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, not_found()).into_response(),
    }
}

/// POST /api/test/{run_id}/stop
async fn stop_test(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    if !state.registry.stop(&run_id) {
        return (StatusCode::NOT_FOUND, not_found()).into_response();
    }
    info!(run_id = %run_id, "stop requested over HTTP");
    Json(json!({ "run_id": run_id, "stopped": true })).into_response()
}

/// DELETE /api/test/{run_id} - stop and discard.
async fn delete_test(State(state): State<AppState>, Path(run_id): Path<String>) -> Response {
    match state.registry.remove(&run_id) {
        Some(_) => Json(json!({ "run_id": run_id, "removed": true })).into_response(),
        None => (StatusCode::NOT_FOUND, not_found()).into_response(),
    }
}

/// POST /api/test/{run_id}/messages - one `user_message` frame.
///
/// The message is classified and dispatched in the background; a malformed
/// frame is rejected here and reported on the run's event stream.
async fn post_message(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: String,
) -> Response {
    let Some(run) = state.registry.get(&run_id) else {
        return (StatusCode::NOT_FOUND, not_found()).into_response();
    };
    match parse_user_message(&body) {
        Ok(message) => {
            tokio::spawn(async move {
                run.handle_message(&message).await;
            });
            (StatusCode::ACCEPTED, Json(json!({ "accepted": true }))).into_response()
        }
        Err(err) => {
            run.report_protocol_error(&err);
            error(StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}
