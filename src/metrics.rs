use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::event::UsageMetrics;

/// Heuristic failure markers for string tool results, matched case-insensitively.
const ERROR_MARKERS: [&str; 13] = [
    "error",
    "failed",
    "exception",
    "not found",
    "invalid",
    "unable to",
    "could not",
    "cannot",
    "traceback",
    "404",
    "403",
    "500",
    "timeout",
];

/// Per-tool call outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub call_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

/// Usage accumulated over one stream.
///
/// Token and latency values are last-write-wins per metadata event. A tool
/// call counts once when invoked and is resolved by its first matching result;
/// calls still pending when the stream ends count as errors.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub tool_usage: BTreeMap<String, ToolUsage>,
    pending: FxHashMap<String, String>,
}

impl StreamMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tool_invoked(&mut self, tool_call_id: &str, tool_name: &str) {
        self.tool_usage
            .entry(tool_name.to_string())
            .or_default()
            .call_count += 1;
        self.pending
            .insert(tool_call_id.to_string(), tool_name.to_string());
    }

    /// Resolve a pending call. Results for unknown or already-resolved ids are
    /// ignored.
    pub fn record_tool_result(&mut self, tool_call_id: &str, status: &str, result: Option<&Value>) {
        let Some(tool_name) = self.pending.remove(tool_call_id) else {
            return;
        };
        let usage = self.tool_usage.entry(tool_name).or_default();
        if is_error_result(result, status) {
            usage.error_count += 1;
        } else {
            usage.success_count += 1;
        }
    }

    /// Overwrite token and latency figures with whatever the event carries.
    pub fn record_metadata(&mut self, data: &UsageMetrics) {
        if let Some(value) = data.input_tokens {
            self.input_tokens = value;
        }
        if let Some(value) = data.output_tokens {
            self.output_tokens = value;
        }
        if let Some(value) = data.total_tokens {
            self.total_tokens = value;
        }
        if let Some(value) = data.latency_ms {
            self.latency_ms = value;
        }
    }

    /// Count every still-pending call as an error.
    pub fn close_pending(&mut self) {
        for (_, tool_name) in self.pending.drain() {
            self.tool_usage.entry(tool_name).or_default().error_count += 1;
        }
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.total_tokens == 0
            && self.tool_usage.is_empty()
    }
}

/// Decide whether a tool result reports failure.
#[must_use]
pub fn is_error_result(result: Option<&Value>, status: &str) -> bool {
    if status.eq_ignore_ascii_case("error") || status.eq_ignore_ascii_case("failed") {
        return true;
    }
    match result {
        Some(Value::String(text)) => {
            let lowered = text.to_ascii_lowercase();
            ERROR_MARKERS.iter().any(|marker| lowered.contains(marker))
        }
        Some(Value::Object(fields)) => {
            fields.get("error").is_some_and(is_truthy)
                || fields.get("status").and_then(Value::as_str) == Some("error")
        }
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
