/// Error type shared by the transport, storage and HTTP layers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Auth error: {0}")]
    Auth(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::Auth(_) => ErrorCategory::Authentication,
            GatewayError::Config(_)
            | GatewayError::Transport(_)
            | GatewayError::Storage(_)
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
            GatewayError::Upstream { status, .. } => category_from_upstream_status(*status),
        }
    }

    /// User-facing summary for a failed runtime invocation.
    ///
    /// The raw error text is carried separately as the event `details`.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        let GatewayError::Upstream { status, .. } = self else {
            return "Failed to invoke agent runtime";
        };
        match category_from_upstream_status(*status) {
            ErrorCategory::InvalidRequest => "Invalid request to agent runtime",
            ErrorCategory::RateLimit => "Request throttled by agent runtime",
            ErrorCategory::ServerError => "Agent runtime internal error",
            ErrorCategory::Authentication | ErrorCategory::Permission | ErrorCategory::Unknown => {
                "Failed to invoke agent runtime"
            }
        }
    }

    fn detail(&self) -> String {
        match self {
            GatewayError::Config(msg)
            | GatewayError::Auth(msg)
            | GatewayError::InvalidRequest(msg)
            | GatewayError::Transport(msg)
            | GatewayError::Storage(msg)
            | GatewayError::Internal(msg) => msg.clone(),
            GatewayError::Upstream { .. } => self.to_string(),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::Permission => http::StatusCode::FORBIDDEN,
        ErrorCategory::RateLimit => http::StatusCode::TOO_MANY_REQUESTS,
        ErrorCategory::ServerError | ErrorCategory::Unknown => {
            http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Format an error as `(status, {"detail": ...})`.
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for_category(err.category());
    (status, serde_json::json!({ "detail": err.detail() }))
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
