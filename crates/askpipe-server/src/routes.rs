//! Router assembly and the four HTTP handlers.
//!
//! `/chat/stream` answers with server-sent events. Each frame is
//! `event: <name>` plus a `data:` JSON payload; the sequence number rides
//! inside the payload so clients can detect gaps after a reconnect.

use std::sync::Arc;

use askpipe_core::{AnswerMeta, ChatRequest, Error, GenerationBackend, StreamEvent};
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::auth;
use crate::orchestrate::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<dyn GenerationBackend>,
    pub api_key: Option<String>,
}

/// Health stays outside the auth layer so probes work with or without a key.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/models", get(list_models))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/", get(health))
        .merge(protected)
        .with_state(state)
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Budget(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn validate(req: &ChatRequest) -> Result<(), Error> {
    if req.model.trim().is_empty() {
        return Err(Error::InvalidRequest("model must not be empty".to_string()));
    }
    if req.prompt.trim().is_empty() {
        return Err(Error::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"message": "askpipe server is running"}))
}

async fn list_models(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state.backend.models().await?;
    Ok(Json(json!({"models": models})))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<AnswerMeta>, ApiError> {
    validate(&req)?;
    let meta = state.orchestrator.respond(&req).await?;
    Ok(Json(meta))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    validate(&req)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>(32);
    let orch = state.orchestrator.clone();
    tokio::spawn(async move {
        orch.stream(req, tx).await;
    });

    let frames = ReceiverStream::new(rx).map(|ev| {
        serde_json::to_string(&ev)
            .map(|data| {
                Bytes::from(format!(
                    "event: {}\ndata: {data}\n\n",
                    ev.body.event_name()
                ))
            })
            .map_err(std::io::Error::other)
    });

    Ok((
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        Body::from_stream(frames),
    )
        .into_response())
}
