use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATUS_STARTED: &str = "started";
pub const STATUS_COMPLETED: &str = "completed";
/// Guardrail action that marks a blocked or rewritten turn.
pub const GUARDRAIL_INTERVENED: &str = "GUARDRAIL_INTERVENED";

/// Token and latency figures reported by the runtime.
///
/// Serialized with the runtime's camelCase names; absent values are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// One client-facing stream event.
///
/// The serde representation is the SSE wire format: a `type` discriminator
/// plus the variant fields, with `None` fields left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "message")]
    TextChunk { content: String },
    #[serde(rename = "tool_use")]
    ToolInvoked {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
        #[serde(rename = "tool_use_id")]
        tool_call_id: String,
        status: String,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_result: Option<Value>,
        #[serde(rename = "tool_use_id")]
        tool_call_id: String,
        status: String,
    },
    #[serde(rename = "metadata")]
    Metadata { data: UsageMetrics },
    /// Informational; the runtime has already applied the guardrail.
    #[serde(rename = "guardrail")]
    GuardrailNotice {
        source: String,
        action: String,
        assessments: Value,
    },
    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    #[serde(rename = "done")]
    Done,
}

impl Event {
    /// Wire discriminator, handy for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TextChunk { .. } => "message",
            Event::ToolInvoked { .. } => "tool_use",
            Event::ToolResult { .. } => "tool_result",
            Event::Metadata { .. } => "metadata",
            Event::GuardrailNotice { .. } => "guardrail",
            Event::Error { .. } => "error",
            Event::Done => "done",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error { .. } | Event::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        let cases = [
            (
                Event::TextChunk {
                    content: "hi".to_string(),
                },
                json!({"type": "message", "content": "hi"}),
            ),
            (
                Event::ToolInvoked {
                    tool_name: "get_weather".to_string(),
                    tool_input: Some(json!({"city": "Oslo"})),
                    tool_call_id: "t1".to_string(),
                    status: STATUS_STARTED.to_string(),
                },
                json!({
                    "type": "tool_use",
                    "tool_name": "get_weather",
                    "tool_input": {"city": "Oslo"},
                    "tool_use_id": "t1",
                    "status": "started"
                }),
            ),
            (
                Event::ToolResult {
                    tool_name: "get_weather".to_string(),
                    tool_result: None,
                    tool_call_id: "t1".to_string(),
                    status: STATUS_COMPLETED.to_string(),
                },
                json!({
                    "type": "tool_result",
                    "tool_name": "get_weather",
                    "tool_use_id": "t1",
                    "status": "completed"
                }),
            ),
            (
                Event::Metadata {
                    data: UsageMetrics {
                        input_tokens: Some(10),
                        output_tokens: Some(5),
                        total_tokens: None,
                        latency_ms: Some(120),
                    },
                },
                json!({
                    "type": "metadata",
                    "data": {"inputTokens": 10, "outputTokens": 5, "latencyMs": 120}
                }),
            ),
            (
                Event::Error {
                    message: "Failed to invoke agent runtime".to_string(),
                    details: None,
                },
                json!({"type": "error", "message": "Failed to invoke agent runtime"}),
            ),
            (Event::Done, json!({"type": "done"})),
        ];

        for (event, expected) in cases {
            assert_eq!(serde_json::to_value(&event).unwrap(), expected);
        }
    }

    #[test]
    fn test_guardrail_notice_round_trips() {
        let event = Event::GuardrailNotice {
            source: "INPUT".to_string(),
            action: GUARDRAIL_INTERVENED.to_string(),
            assessments: json!([{"topicPolicy": {}}]),
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "guardrail");
        assert!(!back.is_terminal());
    }
}
