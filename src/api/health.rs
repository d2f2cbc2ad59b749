use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "ok",
        "runtime": {
            "arn": config.runtime.arn,
            "region": config.runtime.region,
            "endpoint": config.runtime.endpoint_url(),
            "default_model_id": config.runtime.default_model_id,
        },
        "guardrail": {
            "enabled": config.guardrail.enabled,
            "id": config.guardrail.id,
            "version": config.guardrail.version,
        },
        "storage": config.storage.backend.to_string(),
        "log_level": config.features.log_level,
    }))
}
