use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GuardrailViolation, StreamUsage};
use crate::metrics::ToolUsage;
use crate::storage::record_key;

/// Persisted usage for one chat turn, keyed by user id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub timestamp: String,
    pub session_id: String,
    pub model_id: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub tool_usage: BTreeMap<String, ToolUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl UsageRecord {
    /// A missing total is filled in as input + output.
    #[must_use]
    pub fn from_usage(usage: &StreamUsage, at: DateTime<Utc>) -> Self {
        let total_tokens = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.input_tokens.saturating_add(usage.output_tokens)
        };
        Self {
            user_id: usage.user_id.clone(),
            timestamp: format_timestamp(at),
            session_id: usage.session_id.clone(),
            model_id: usage.model_id.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens,
            latency_ms: usage.latency_ms,
            tool_usage: usage.tool_usage.clone(),
            user_email: usage.user_email.clone(),
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        record_key(&self.user_id, &self.timestamp)
    }
}

/// Persisted guardrail intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailRecord {
    pub user_id: String,
    pub timestamp: String,
    pub session_id: String,
    pub source: String,
    pub action: String,
    pub assessments: Value,
    #[serde(default)]
    pub content_preview: String,
}

impl GuardrailRecord {
    #[must_use]
    pub fn from_violation(violation: &GuardrailViolation, at: DateTime<Utc>) -> Self {
        Self {
            user_id: violation.user_id.clone(),
            timestamp: format_timestamp(at),
            session_id: violation.session_id.clone(),
            source: violation.source.clone(),
            action: violation.action.clone(),
            assessments: violation.assessments.clone(),
            content_preview: String::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        record_key(&self.user_id, &self.timestamp)
    }

    /// Policy families that blocked or flagged content, first occurrence order.
    #[must_use]
    pub fn policy_types(&self) -> Vec<&'static str> {
        let mut found: Vec<&'static str> = Vec::new();
        let mut push = |name: &'static str| {
            if !found.contains(&name) {
                found.push(name);
            }
        };

        for assessment in self.assessments.as_array().into_iter().flatten() {
            if any_blocked(assessment, "contentPolicy", "filters") {
                push("content");
            }
            if any_blocked(assessment, "topicPolicy", "topics") {
                push("topic");
            }
            if has_entries(assessment, "wordPolicy", &["customWords", "managedWordLists"]) {
                push("word");
            }
            if has_entries(
                assessment,
                "sensitiveInformationPolicy",
                &["piiEntities", "regexes"],
            ) {
                push("sensitive_information");
            }
            if any_blocked(assessment, "contextualGroundingPolicy", "filters") {
                push("contextual_grounding");
            }
        }
        found
    }
}

/// Thumbs up or down on one assistant reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
}

impl Sentiment {
    /// Exact, lower-case match only.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

/// Persisted user feedback on a single assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub user_id: String,
    pub timestamp: String,
    pub session_id: String,
    pub message_id: String,
    pub user_message: String,
    pub assistant_response: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub sentiment: Sentiment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_comment: Option<String>,
}

impl FeedbackRecord {
    #[must_use]
    pub fn key(&self) -> String {
        record_key(&self.user_id, &self.timestamp)
    }
}

/// RFC 3339 in UTC with microseconds, the sort half of every record key.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn any_blocked(assessment: &Value, policy: &str, list: &str) -> bool {
    assessment
        .get(policy)
        .and_then(|policy| policy.get(list))
        .and_then(Value::as_array)
        .is_some_and(|entries| {
            entries
                .iter()
                .any(|entry| entry.get("action").and_then(Value::as_str) == Some("BLOCKED"))
        })
}

fn has_entries(assessment: &Value, policy: &str, lists: &[&str]) -> bool {
    let Some(policy) = assessment.get(policy) else {
        return false;
    };
    lists.iter().any(|list| {
        policy
            .get(*list)
            .and_then(Value::as_array)
            .is_some_and(|entries| !entries.is_empty())
    })
}
