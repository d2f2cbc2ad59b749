use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::analytics::{format_timestamp, FeedbackRecord, Sentiment};
use crate::error::GatewayError;
use crate::state::AppState;

/// Request body of `POST /api/feedback`.
#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub user_message: String,
    #[serde(default)]
    pub assistant_response: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub sentiment: String,
    #[serde(default)]
    pub user_comment: Option<String>,
}

/// A feedback body that passed validation.
#[derive(Debug)]
pub struct ValidFeedback {
    pub request: FeedbackRequest,
    pub sentiment: Sentiment,
}

/// Parse and check a feedback body.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for malformed JSON, an empty
/// required field, or a sentiment other than `positive` / `negative`.
pub fn parse_feedback_request(body: &[u8]) -> Result<ValidFeedback, GatewayError> {
    let request: FeedbackRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("Invalid request body: {err}")))?;
    for (field, value) in [
        ("session_id", &request.session_id),
        ("message_id", &request.message_id),
        ("user_message", &request.user_message),
        ("assistant_response", &request.assistant_response),
    ] {
        if value.is_empty() {
            return Err(GatewayError::InvalidRequest(format!(
                "{field} must not be empty"
            )));
        }
    }
    let sentiment = Sentiment::parse(&request.sentiment).ok_or_else(|| {
        GatewayError::InvalidRequest("sentiment must be 'positive' or 'negative'".to_string())
    })?;
    Ok(ValidFeedback { request, sentiment })
}

pub fn handler(
    State(state): State<Arc<AppState>>,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: String,
) -> Response {
    match handler_inner(&state, headers, body, &request_id) {
        Ok(response) => response,
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "feedback rejected");
            err.into_response()
        }
    }
}

fn handler_inner(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &Bytes,
    request_id: &str,
) -> Result<Response, GatewayError> {
    let identity = state.identity().resolve(headers)?;
    let ValidFeedback { request, sentiment } = parse_feedback_request(body)?;

    info!(
        request_id = %request_id,
        user_id = %identity.user_id,
        session_id = %request.session_id,
        message_id = %request.message_id,
        sentiment = sentiment.as_str(),
        "feedback received"
    );

    let message_id = request.message_id.clone();
    state.sink.record_feedback(FeedbackRecord {
        user_id: identity.user_id,
        timestamp: format_timestamp(chrono::Utc::now()),
        session_id: request.session_id,
        message_id: request.message_id,
        user_message: request.user_message,
        assistant_response: request.assistant_response,
        tools_used: request.tools_used,
        sentiment,
        user_comment: request.user_comment.filter(|comment| !comment.is_empty()),
    });

    Ok(Json(json!({
        "status": "success",
        "message": "Feedback recorded",
        "message_id": message_id,
        "sentiment": sentiment,
    }))
    .into_response())
}
