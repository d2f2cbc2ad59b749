//! Usage, guardrail and feedback analytics, written off the request path.

mod records;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::metrics::ToolUsage;
use crate::storage::RecordStore;

pub(crate) use records::format_timestamp;
pub use records::{FeedbackRecord, GuardrailRecord, Sentiment, UsageRecord};

/// Final metrics of one stream, owned so it can outlive the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub request_id: String,
    pub user_id: String,
    pub user_email: Option<String>,
    pub session_id: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub latency_ms: u64,
    pub tool_usage: BTreeMap<String, ToolUsage>,
}

impl StreamUsage {
    /// Nothing worth persisting: no tokens, no latency and no tool calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.total_tokens == 0
            && self.latency_ms == 0
            && self.tool_usage.is_empty()
    }
}

/// A guardrail notice whose action was `GUARDRAIL_INTERVENED`.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailViolation {
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,
    pub source: String,
    pub action: String,
    pub assessments: Value,
}

/// Receiver for stream analytics.
///
/// Every call returns immediately; implementations do their work in the
/// background and never report failures back to the caller.
pub trait AnalyticsSink: Send + Sync {
    fn record_usage(&self, usage: StreamUsage);
    fn record_violation(&self, violation: GuardrailViolation);
    fn record_feedback(&self, feedback: FeedbackRecord);
}

/// Sink that persists records into a [`RecordStore`] from detached tasks.
pub struct StoreSink {
    store: Arc<dyn RecordStore>,
    usage_table: String,
    guardrail_table: String,
    feedback_table: String,
}

impl StoreSink {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, tables: &StorageConfig) -> Self {
        Self {
            store,
            usage_table: tables.usage_table.clone(),
            guardrail_table: tables.guardrail_table.clone(),
            feedback_table: tables.feedback_table.clone(),
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => error!("no async runtime available, dropping analytics record"),
        }
    }
}

impl AnalyticsSink for StoreSink {
    fn record_usage(&self, usage: StreamUsage) {
        if usage.is_empty() {
            debug!(
                request_id = %usage.request_id,
                session_id = %usage.session_id,
                "no usage to record"
            );
            return;
        }

        let store = Arc::clone(&self.store);
        let table = self.usage_table.clone();
        self.spawn(async move {
            let record = UsageRecord::from_usage(&usage, chrono::Utc::now());
            let key = record.key();
            let result = match serde_json::to_value(&record) {
                Ok(item) => store.put(&table, &key, item).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => info!(
                    request_id = %usage.request_id,
                    user_id = %record.user_id,
                    session_id = %record.session_id,
                    total_tokens = record.total_tokens,
                    tools = record.tool_usage.len(),
                    "usage recorded"
                ),
                Err(err) => error!(
                    request_id = %usage.request_id,
                    user_id = %record.user_id,
                    session_id = %record.session_id,
                    error = %err,
                    "failed to record usage"
                ),
            }
        });
    }

    fn record_violation(&self, violation: GuardrailViolation) {
        let store = Arc::clone(&self.store);
        let table = self.guardrail_table.clone();
        self.spawn(async move {
            let record = GuardrailRecord::from_violation(&violation, chrono::Utc::now());
            let key = record.key();
            let result = match serde_json::to_value(&record) {
                Ok(item) => store.put(&table, &key, item).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => info!(
                    request_id = %violation.request_id,
                    user_id = %record.user_id,
                    session_id = %record.session_id,
                    source = %record.source,
                    policies = ?record.policy_types(),
                    "guardrail violation recorded"
                ),
                Err(err) => error!(
                    request_id = %violation.request_id,
                    user_id = %record.user_id,
                    session_id = %record.session_id,
                    error = %err,
                    "failed to record guardrail violation"
                ),
            }
        });
    }

    fn record_feedback(&self, feedback: FeedbackRecord) {
        let store = Arc::clone(&self.store);
        let table = self.feedback_table.clone();
        self.spawn(async move {
            let key = feedback.key();
            let result = match serde_json::to_value(&feedback) {
                Ok(item) => store.put(&table, &key, item).await,
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => debug!(
                    user_id = %feedback.user_id,
                    message_id = %feedback.message_id,
                    "feedback stored"
                ),
                Err(err) => error!(
                    user_id = %feedback.user_id,
                    session_id = %feedback.session_id,
                    message_id = %feedback.message_id,
                    error = %err,
                    "failed to record feedback"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for_rows(store: &MemoryStore, table: &str, expected: usize) {
        for _ in 0..100 {
            if store.len(table) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {expected} rows in {table}");
    }

    fn sink(store: &Arc<MemoryStore>) -> StoreSink {
        StoreSink::new(
            Arc::clone(store) as Arc<dyn RecordStore>,
            &StorageConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_usage_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_usage(StreamUsage {
            request_id: "req-1".to_string(),
            user_id: "user-1".to_string(),
            session_id: "s-1".to_string(),
            model_id: "m".to_string(),
            input_tokens: 3,
            output_tokens: 4,
            ..StreamUsage::default()
        });
        wait_for_rows(&store, "usage-records", 1).await;

        let rows = store.scan("usage-records", "user-1#").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1["total_tokens"], 7);
        assert_eq!(rows[0].1["session_id"], "s-1");
    }

    #[tokio::test]
    async fn test_empty_usage_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_usage(StreamUsage {
            request_id: "req-0".to_string(),
            user_id: "user-0".to_string(),
            ..StreamUsage::default()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.is_empty("usage-records"));
    }

    #[tokio::test]
    async fn test_latency_only_usage_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_usage(StreamUsage {
            user_id: "user-3".to_string(),
            session_id: "s-3".to_string(),
            latency_ms: 120,
            ..StreamUsage::default()
        });
        wait_for_rows(&store, "usage-records", 1).await;

        let rows = store.scan("usage-records", "user-3#").await.unwrap();
        assert_eq!(rows[0].1["latency_ms"], 120);
        assert_eq!(rows[0].1["total_tokens"], 0);
    }

    #[tokio::test]
    async fn test_violation_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_violation(GuardrailViolation {
            request_id: "req-2".to_string(),
            user_id: "user-2".to_string(),
            session_id: "s-2".to_string(),
            source: "INPUT".to_string(),
            action: "GUARDRAIL_INTERVENED".to_string(),
            assessments: json!([{"topicPolicy": {"topics": [{"action": "BLOCKED"}]}}]),
        });
        wait_for_rows(&store, "guardrail-violations", 1).await;

        let rows = store.scan("guardrail-violations", "user-2#").await.unwrap();
        assert_eq!(rows[0].1["action"], "GUARDRAIL_INTERVENED");
        assert_eq!(rows[0].1["content_preview"], "");
    }

    #[test]
    fn test_without_runtime_does_not_panic() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_violation(GuardrailViolation {
            request_id: "r".to_string(),
            user_id: "u".to_string(),
            session_id: "s".to_string(),
            source: "INPUT".to_string(),
            action: "GUARDRAIL_INTERVENED".to_string(),
            assessments: json!([]),
        });
        assert!(store.is_empty("guardrail-violations"));
    }

    #[tokio::test]
    async fn test_feedback_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        sink(&store).record_feedback(FeedbackRecord {
            user_id: "user-4".to_string(),
            timestamp: "2026-03-01T12:30:00.000000Z".to_string(),
            session_id: "s-4".to_string(),
            message_id: "msg-1".to_string(),
            user_message: "hi".to_string(),
            assistant_response: "hello".to_string(),
            tools_used: Vec::new(),
            sentiment: Sentiment::Negative,
            user_comment: Some("off topic".to_string()),
        });
        wait_for_rows(&store, "feedback-records", 1).await;

        let item = store
            .get("feedback-records", "user-4#2026-03-01T12:30:00.000000Z")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item["sentiment"], "negative");
        assert_eq!(item["user_comment"], "off topic");
    }
}
