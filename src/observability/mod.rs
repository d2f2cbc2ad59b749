use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::analytics::StreamUsage;
use crate::config::LogFormat;

/// Map a configured log level to a tracing filter directive.
///
/// - "DISABLED" -> `None`, no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber with the configured level and format.
pub fn init_tracing(log_level: &str, format: LogFormat) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

/// Log the final usage of a chat stream at INFO level.
pub fn log_stream_complete(usage: &StreamUsage, outcome: &str, duration: Duration) {
    let tool_calls: u64 = usage.tool_usage.values().map(|tool| tool.call_count).sum();
    let tool_errors: u64 = usage.tool_usage.values().map(|tool| tool.error_count).sum();
    info!(
        request_id = %usage.request_id,
        session_id = %usage.session_id,
        user_id = %usage.user_id,
        model_id = %usage.model_id,
        outcome,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens,
        latency_ms = usage.latency_ms,
        tool_calls,
        tool_errors,
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}
