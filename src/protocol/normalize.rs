//! Maps one NDJSON line from the agent runtime to at most one [`Event`].
//!
//! The runtime emits several generations of line shapes for the same
//! information. Each shape has its own recognizer; recognizers run in a fixed
//! priority order and the first match decides the line. Lines that are not
//! JSON objects or match no shape are skipped, never errors.

use std::sync::atomic::AtomicU64;

use serde_json::{Map, Value};

use super::event::{Event, UsageMetrics, STATUS_COMPLETED, STATUS_STARTED};
use crate::stream::markup::MarkupFilter;
use crate::util::{next_generated_id, strip_sse_data_prefix};

static SYNTHETIC_TOOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type Object = Map<String, Value>;
type Recognizer = for<'a> fn(&'a Object) -> Option<WireShape<'a>>;

/// A recognized runtime line shape, borrowing from the parsed line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireShape<'a> {
    /// `event.contentBlockDelta.delta.text`
    ContentDelta(&'a str),
    /// `{"type": "TextStreamEvent", "text": ...}`
    TextStream(&'a str),
    /// `{"type": "tool_use", ...}`
    ToolUse(&'a Object),
    /// `{"type": "tool_result", ...}`
    ToolResult(&'a Object),
    /// `{"type": "guardrail", ...}`
    Guardrail(&'a Object),
    /// First `content[]` block carrying `toolUse`.
    ContentBlockToolUse(&'a Object),
    /// First `content[]` block carrying `toolResult`.
    ContentBlockToolResult(&'a Object),
    /// `message.content`: the aggregate of text already streamed.
    FinalMessage,
    /// `{"type": "message", "content": [{"text": ...}]}`
    LegacyMessage(&'a [Value]),
    /// Top-level `usage` / `metrics`.
    Usage {
        usage: Option<&'a Object>,
        metrics: Option<&'a Object>,
    },
    /// `event.metadata.usage` / `event.metadata.metrics`.
    LegacyMetadata {
        usage: Option<&'a Object>,
        metrics: Option<&'a Object>,
    },
}

const RECOGNIZERS: [Recognizer; 10] = [
    content_delta,
    text_stream,
    flattened_tool_use,
    flattened_tool_result,
    guardrail,
    content_block,
    final_message,
    legacy_message,
    top_level_usage,
    legacy_metadata,
];

/// Parse one line and turn it into an event. Text-bearing shapes pass their
/// text through `filter`; extracted tool calls stay queued in the filter.
pub fn normalize_line(line: &str, filter: &mut MarkupFilter) -> Option<Event> {
    let payload = strip_sse_data_prefix(line.trim());
    let value: Value = serde_json::from_str(payload).ok()?;
    let object = value.as_object()?;
    recognize(object)?.into_event(filter)
}

/// First matching shape for a parsed line.
#[must_use]
pub fn recognize(object: &Object) -> Option<WireShape<'_>> {
    RECOGNIZERS
        .iter()
        .find_map(|recognizer| recognizer(object))
}

impl WireShape<'_> {
    pub fn into_event(self, filter: &mut MarkupFilter) -> Option<Event> {
        match self {
            WireShape::ContentDelta(text) | WireShape::TextStream(text) => {
                filtered_text(text, filter)
            }
            WireShape::ToolUse(object) => Some(Event::ToolInvoked {
                tool_name: tool_name(object, &["tool_name", "name"]),
                tool_input: first_truthy(object, &["tool_input", "input"]),
                tool_call_id: tool_call_id(object, &["tool_use_id", "id"]),
                status: status_or(object, STATUS_STARTED),
            }),
            WireShape::ToolResult(object) => Some(Event::ToolResult {
                tool_name: tool_name(object, &["tool_name", "name"]),
                tool_result: first_truthy(object, &["tool_result", "result"]),
                tool_call_id: tool_call_id(object, &["tool_use_id", "id"]),
                status: status_or(object, STATUS_COMPLETED),
            }),
            WireShape::Guardrail(object) => Some(Event::GuardrailNotice {
                source: str_or(object, "source", "INPUT"),
                action: str_or(object, "action", "NONE"),
                assessments: object
                    .get("assessments")
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new())),
            }),
            WireShape::ContentBlockToolUse(tool_use) => Some(Event::ToolInvoked {
                tool_name: tool_name(tool_use, &["name"]),
                tool_input: non_null(tool_use.get("input")),
                tool_call_id: tool_call_id(tool_use, &["toolUseId"]),
                status: STATUS_STARTED.to_string(),
            }),
            WireShape::ContentBlockToolResult(tool_result) => Some(Event::ToolResult {
                tool_name: tool_name(tool_result, &["name"]),
                tool_result: non_null(tool_result.get("content")),
                tool_call_id: tool_call_id(tool_result, &["toolUseId"]),
                status: status_or(tool_result, STATUS_COMPLETED),
            }),
            WireShape::FinalMessage => None,
            WireShape::LegacyMessage(blocks) => {
                let text: String = blocks
                    .iter()
                    .filter_map(|block| non_empty_str(block.get("text")))
                    .collect();
                if text.is_empty() {
                    return None;
                }
                filtered_text(&text, filter)
            }
            WireShape::Usage { usage, metrics } => Some(Event::Metadata {
                data: UsageMetrics {
                    input_tokens: Some(count(usage, "inputTokens").unwrap_or(0)),
                    output_tokens: Some(count(usage, "outputTokens").unwrap_or(0)),
                    total_tokens: Some(count(usage, "totalTokens").unwrap_or(0)),
                    latency_ms: Some(count(metrics, "latencyMs").unwrap_or(0)),
                },
            }),
            WireShape::LegacyMetadata { usage, metrics } => Some(Event::Metadata {
                data: UsageMetrics {
                    input_tokens: count(usage, "inputTokens"),
                    output_tokens: count(usage, "outputTokens"),
                    total_tokens: None,
                    latency_ms: count(metrics, "latencyMs"),
                },
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Recognizers, in priority order
// ---------------------------------------------------------------------------

fn content_delta(object: &Object) -> Option<WireShape<'_>> {
    let delta = as_object(object.get("event"))
        .and_then(|event| as_object(event.get("contentBlockDelta")))
        .and_then(|block| as_object(block.get("delta")))?;
    non_empty_str(delta.get("text")).map(WireShape::ContentDelta)
}

fn text_stream(object: &Object) -> Option<WireShape<'_>> {
    if !type_is(object, "TextStreamEvent") {
        return None;
    }
    non_empty_str(object.get("text")).map(WireShape::TextStream)
}

fn flattened_tool_use(object: &Object) -> Option<WireShape<'_>> {
    type_is(object, "tool_use").then_some(WireShape::ToolUse(object))
}

fn flattened_tool_result(object: &Object) -> Option<WireShape<'_>> {
    type_is(object, "tool_result").then_some(WireShape::ToolResult(object))
}

fn guardrail(object: &Object) -> Option<WireShape<'_>> {
    type_is(object, "guardrail").then_some(WireShape::Guardrail(object))
}

fn content_block(object: &Object) -> Option<WireShape<'_>> {
    let blocks = object.get("content")?.as_array()?;
    blocks.iter().filter_map(Value::as_object).find_map(|block| {
        if let Some(tool_use) = non_empty_object(block.get("toolUse")) {
            return Some(WireShape::ContentBlockToolUse(tool_use));
        }
        non_empty_object(block.get("toolResult")).map(WireShape::ContentBlockToolResult)
    })
}

fn final_message(object: &Object) -> Option<WireShape<'_>> {
    let content = as_object(object.get("message"))?.get("content")?;
    is_truthy(content).then_some(WireShape::FinalMessage)
}

fn legacy_message(object: &Object) -> Option<WireShape<'_>> {
    if !type_is(object, "message") {
        return None;
    }
    let blocks = object.get("content")?.as_array()?;
    Some(WireShape::LegacyMessage(blocks.as_slice()))
}

fn top_level_usage(object: &Object) -> Option<WireShape<'_>> {
    let usage = non_empty_object(object.get("usage"));
    let metrics = non_empty_object(object.get("metrics"));
    (usage.is_some() || metrics.is_some()).then_some(WireShape::Usage { usage, metrics })
}

fn legacy_metadata(object: &Object) -> Option<WireShape<'_>> {
    let metadata = as_object(object.get("event"))
        .and_then(|event| non_empty_object(event.get("metadata")))?;
    let usage = non_empty_object(metadata.get("usage"));
    let metrics = non_empty_object(metadata.get("metrics"));
    (usage.is_some() || metrics.is_some()).then_some(WireShape::LegacyMetadata { usage, metrics })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn filtered_text(text: &str, filter: &mut MarkupFilter) -> Option<Event> {
    filter
        .filter(text)
        .map(|content| Event::TextChunk { content })
}

#[inline]
fn as_object(value: Option<&Value>) -> Option<&Object> {
    value?.as_object()
}

#[inline]
fn non_empty_object(value: Option<&Value>) -> Option<&Object> {
    as_object(value).filter(|object| !object.is_empty())
}

#[inline]
fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value?.as_str().filter(|text| !text.is_empty())
}

#[inline]
fn type_is(object: &Object, expected: &str) -> bool {
    object.get("type").and_then(Value::as_str) == Some(expected)
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

fn non_null(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| !value.is_null()).cloned()
}

/// First truthy value among `keys`; otherwise the last key's value as-is.
fn first_truthy(object: &Object, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find(|value| is_truthy(value))
        .or_else(|| keys.last().and_then(|key| object.get(*key)))
        .and_then(|value| non_null(Some(value)))
}

fn tool_name(object: &Object, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| non_empty_str(object.get(*key)))
        .unwrap_or("unknown")
        .to_string()
}

fn tool_call_id(object: &Object, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| non_empty_str(object.get(*key)))
        .map_or_else(
            || next_generated_id("tool", &SYNTHETIC_TOOL_ID_COUNTER),
            str::to_string,
        )
}

fn status_or(object: &Object, default: &str) -> String {
    object
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn str_or(object: &Object, key: &str, default: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn count(object: Option<&Object>, key: &str) -> Option<u64> {
    object?.get(key)?.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalize(line: &str) -> Option<Event> {
        normalize_line(line, &mut MarkupFilter::new())
    }

    fn shape_name(line: &str) -> Option<&'static str> {
        let value: Value = serde_json::from_str(line).unwrap();
        let shape = recognize(value.as_object().unwrap())?;
        Some(match shape {
            WireShape::ContentDelta(_) => "content_delta",
            WireShape::TextStream(_) => "text_stream",
            WireShape::ToolUse(_) => "tool_use",
            WireShape::ToolResult(_) => "tool_result",
            WireShape::Guardrail(_) => "guardrail",
            WireShape::ContentBlockToolUse(_) => "block_tool_use",
            WireShape::ContentBlockToolResult(_) => "block_tool_result",
            WireShape::FinalMessage => "final_message",
            WireShape::LegacyMessage(_) => "legacy_message",
            WireShape::Usage { .. } => "usage",
            WireShape::LegacyMetadata { .. } => "legacy_metadata",
        })
    }

    #[test]
    fn test_content_delta() {
        let event = normalize(r#"{"event":{"contentBlockDelta":{"delta":{"text":"Hi"}}}}"#);
        assert_eq!(
            event,
            Some(Event::TextChunk {
                content: "Hi".to_string()
            })
        );
    }

    #[test]
    fn test_text_stream_with_sse_prefix() {
        let event = normalize(r#"data: {"type":"TextStreamEvent","text":"Hello"}"#);
        assert_eq!(
            event,
            Some(Event::TextChunk {
                content: "Hello".to_string()
            })
        );
    }

    #[test]
    fn test_text_fully_filtered_is_skipped() {
        let mut filter = MarkupFilter::new();
        let line = r#"{"type":"TextStreamEvent","text":"<thinking>hmm"}"#;
        assert_eq!(normalize_line(line, &mut filter), None);
        let line = r#"{"type":"TextStreamEvent","text":"</thinking>ok"}"#;
        assert_eq!(
            normalize_line(line, &mut filter),
            Some(Event::TextChunk {
                content: "ok".to_string()
            })
        );
    }

    #[test]
    fn test_flattened_tool_use_defaults() {
        let event = normalize(r#"{"type":"tool_use","name":"calc","input":{"x":1}}"#).unwrap();
        let Event::ToolInvoked {
            tool_name,
            tool_input,
            tool_call_id,
            status,
        } = event
        else {
            panic!("expected tool_use");
        };
        assert_eq!(tool_name, "calc");
        assert_eq!(tool_input, Some(json!({"x": 1})));
        assert!(tool_call_id.starts_with("tool-"));
        assert_eq!(status, "started");
    }

    #[test]
    fn test_flattened_tool_use_prefers_primary_keys() {
        let event = normalize(
            r#"{"type":"tool_use","tool_name":"a","name":"b","tool_input":{},"input":{"q":2},"tool_use_id":"t9","id":"x","status":"running"}"#,
        );
        assert_eq!(
            event,
            Some(Event::ToolInvoked {
                tool_name: "a".to_string(),
                tool_input: Some(json!({"q": 2})),
                tool_call_id: "t9".to_string(),
                status: "running".to_string(),
            })
        );
    }

    #[test]
    fn test_flattened_tool_result() {
        let event = normalize(
            r#"{"type":"tool_result","tool_name":"calc","result":"42","tool_use_id":"t1"}"#,
        );
        assert_eq!(
            event,
            Some(Event::ToolResult {
                tool_name: "calc".to_string(),
                tool_result: Some(json!("42")),
                tool_call_id: "t1".to_string(),
                status: "completed".to_string(),
            })
        );
    }

    #[test]
    fn test_guardrail_defaults() {
        assert_eq!(
            normalize(r#"{"type":"guardrail"}"#),
            Some(Event::GuardrailNotice {
                source: "INPUT".to_string(),
                action: "NONE".to_string(),
                assessments: json!([]),
            })
        );
    }

    #[test]
    fn test_content_block_tool_use_and_result() {
        let event = normalize(
            r#"{"content":[{"text":"x"},{"toolUse":{"name":"search","input":{"q":"rust"},"toolUseId":"tu-1"}}]}"#,
        );
        assert_eq!(
            event,
            Some(Event::ToolInvoked {
                tool_name: "search".to_string(),
                tool_input: Some(json!({"q": "rust"})),
                tool_call_id: "tu-1".to_string(),
                status: "started".to_string(),
            })
        );

        let event = normalize(
            r#"{"content":[{"toolResult":{"content":[{"text":"found"}],"toolUseId":"tu-1","status":"error"}}]}"#,
        );
        assert_eq!(
            event,
            Some(Event::ToolResult {
                tool_name: "unknown".to_string(),
                tool_result: Some(json!([{"text": "found"}])),
                tool_call_id: "tu-1".to_string(),
                status: "error".to_string(),
            })
        );
    }

    #[test]
    fn test_final_message_is_skipped() {
        let line = r#"{"message":{"role":"assistant","content":[{"text":"whole answer"}]},"usage":{"inputTokens":1}}"#;
        assert_eq!(shape_name(line), Some("final_message"));
        assert_eq!(normalize(line), None);
    }

    #[test]
    fn test_legacy_message_concatenates_text() {
        let line = r#"{"type":"message","content":[{"text":"Hel"},{"image":{}},{"text":"lo"}]}"#;
        assert_eq!(
            normalize(line),
            Some(Event::TextChunk {
                content: "Hello".to_string()
            })
        );
        assert_eq!(normalize(r#"{"type":"message","content":[]}"#), None);
    }

    #[test]
    fn test_top_level_usage_defaults_to_zero() {
        let line = r#"{"usage":{"inputTokens":12,"outputTokens":30},"metrics":{"latencyMs":850}}"#;
        assert_eq!(
            normalize(line),
            Some(Event::Metadata {
                data: UsageMetrics {
                    input_tokens: Some(12),
                    output_tokens: Some(30),
                    total_tokens: Some(0),
                    latency_ms: Some(850),
                }
            })
        );
    }

    #[test]
    fn test_legacy_metadata_keeps_missing_fields_absent() {
        let line = r#"{"event":{"metadata":{"usage":{"inputTokens":5,"outputTokens":7}}}}"#;
        assert_eq!(
            normalize(line),
            Some(Event::Metadata {
                data: UsageMetrics {
                    input_tokens: Some(5),
                    output_tokens: Some(7),
                    total_tokens: None,
                    latency_ms: None,
                }
            })
        );
    }

    #[test]
    fn test_priority_order() {
        assert_eq!(
            shape_name(r#"{"event":{"contentBlockDelta":{"delta":{"text":"a"}},"metadata":{"usage":{"inputTokens":1}}}}"#),
            Some("content_delta")
        );
        assert_eq!(
            shape_name(r#"{"type":"tool_use","content":[{"toolResult":{"toolUseId":"x"}}]}"#),
            Some("tool_use")
        );
        assert_eq!(
            shape_name(r#"{"type":"message","content":[{"toolUse":{"name":"n"}}]}"#),
            Some("block_tool_use")
        );
        assert_eq!(
            shape_name(r#"{"type":"TextStreamEvent","text":"","usage":{"inputTokens":1}}"#),
            Some("usage")
        );
    }

    #[test]
    fn test_unknown_and_malformed_lines() {
        for line in [
            "",
            "not json",
            "data: {broken",
            "[1,2,3]",
            r#""just a string""#,
            r#"{"type":"something_else"}"#,
            r#"{"usage":{},"metrics":{}}"#,
            r#"{"event":{"contentBlockDelta":{"delta":{"text":""}}}}"#,
            r#"{"event":"not an object"}"#,
        ] {
            assert_eq!(normalize(line), None, "line {line:?}");
        }
    }

    #[test]
    fn test_synthesized_ids_are_unique() {
        let a = normalize(r#"{"type":"tool_use","name":"x"}"#).unwrap();
        let b = normalize(r#"{"type":"tool_use","name":"x"}"#).unwrap();
        let (Event::ToolInvoked { tool_call_id: a, .. }, Event::ToolInvoked { tool_call_id: b, .. }) =
            (a, b)
        else {
            panic!("expected tool_use events");
        };
        assert_ne!(a, b);
    }
}
