use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::models;
use crate::orchestrator::ChatCompletionRequest;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response, Sse};
use serde_json::{Value, json};

pub const SESSION_HEADER: &str = "x-session-id";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn list_models() -> Json<Value> {
    Json(models::model_list(now_ts()))
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    let body = match body {
        Ok(Json(body)) if body.as_object().is_some_and(|m| !m.is_empty()) => body,
        Ok(_) => return Err(AppError::bad_request("Missing request body")),
        Err(rejection) => {
            tracing::debug!("rejected completion body: {rejection}");
            return Err(AppError::bad_request("Missing request body"));
        }
    };
    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|err| AppError::bad_request(format!("Invalid request body: {err}")))?;

    let requested_session = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let turn = state.orchestrator.prepare(request, requested_session).await?;
    let session_id = turn.session_id.clone();
    tracing::info!(
        session_id = %session_id,
        new_session = turn.session_created,
        stream = turn.stream,
        "chat completion"
    );

    let mut response = if turn.stream {
        let mut response = Sse::new(state.orchestrator.stream(turn)).into_response();
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response
    } else {
        Json(state.orchestrator.complete(turn).await?).into_response()
    };
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list();
    Json(json!({ "sessions": sessions }))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<Value>> {
    if state.sessions.remove(&session_id) {
        Ok(Json(json!({ "message": "Session deleted successfully" })))
    } else {
        Err(AppError::not_found("Session not found"))
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": now_ts() }))
}

pub async fn not_found() -> AppError {
    AppError::not_found("Not found")
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
