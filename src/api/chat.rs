use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::state::AppState;
use crate::stream::{chat_event_stream, sse_body_stream, StreamContext};
use crate::transport::InvocationRequest;

/// Request body of `POST /api/chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Parse and check a chat request body.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for malformed JSON or a blank
/// prompt or session id.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, GatewayError> {
    let request: ChatRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("Invalid request body: {err}")))?;
    if request.prompt.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "prompt must not be empty".to_string(),
        ));
    }
    if request.session_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest(
            "session_id must not be empty".to_string(),
        ));
    }
    Ok(request)
}

pub fn handler(
    State(state): State<Arc<AppState>>,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: String,
) -> Response {
    match handler_inner(&state, headers, body, request_id.clone()) {
        Ok(response) => response,
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "chat request rejected");
            err.into_response()
        }
    }
}

fn handler_inner(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: String,
) -> Result<Response, GatewayError> {
    let identity = state.identity().resolve(headers)?;
    let request = parse_chat_request(body)?;
    let model_id = request
        .model_id
        .filter(|model| !model.trim().is_empty())
        .unwrap_or_else(|| state.config.runtime.default_model_id.clone());

    info!(
        request_id = %request_id,
        session_id = %request.session_id,
        user_id = %identity.user_id,
        model_id = %model_id,
        prompt_chars = request.prompt.chars().count(),
        "chat stream started"
    );

    let invocation = InvocationRequest::new(
        request.prompt,
        request.session_id,
        identity.user_id,
        model_id,
        &state.config.guardrail,
    );
    let events = chat_event_stream(
        Arc::clone(&state.runtime),
        Arc::clone(&state.sink),
        invocation,
        StreamContext {
            request_id,
            user_email: identity.email,
        },
    );
    Ok(sse_ok_response(Body::from_stream(sse_body_stream(events))))
}

/// `OPTIONS /api/chat`
#[must_use]
pub fn preflight_response() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = http::StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_METHODS,
        http::HeaderValue::from_static("POST, OPTIONS"),
    );
    headers.insert(
        http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        http::HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

#[inline]
fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache, no-store, no-transform"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        http::header::HeaderName::from_static("x-accel-buffering"),
        http::HeaderValue::from_static("no"),
    );
    response
}
