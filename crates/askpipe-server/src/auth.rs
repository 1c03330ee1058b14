//! Optional API-key gate for the chat and model routes.
//!
//! With no key configured the layer is a pass-through, which is the normal
//! single-user setup. The health route is mounted outside this layer so
//! probes work either way.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::routes::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        None => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "ApiKey")],
            Json(json!({
                "detail": "Missing API key. Include 'X-API-Key' header in your request.",
                "error": "unauthorized",
            })),
        )
            .into_response(),
        Some(key) if key != expected => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "detail": "Invalid API key",
                "error": "forbidden",
            })),
        )
            .into_response(),
        Some(_) => next.run(req).await,
    }
}
