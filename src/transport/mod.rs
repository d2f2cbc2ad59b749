mod retry;
mod runtime_client;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::GuardrailConfig;
use crate::error::GatewayError;

pub use runtime_client::HttpRuntimeClient;

/// Raw response body of one invocation, chunked however the network delivers it.
pub type ByteStream = BoxStream<'static, Result<Bytes, GatewayError>>;

/// Invocation payload sent to the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub prompt: String,
    pub session_id: String,
    pub user_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardrail_version: Option<String>,
    pub guardrail_enabled: bool,
}

impl InvocationRequest {
    #[must_use]
    pub fn new(
        prompt: String,
        session_id: String,
        user_id: String,
        model_id: String,
        guardrail: &GuardrailConfig,
    ) -> Self {
        Self {
            prompt,
            session_id,
            user_id,
            model_id,
            guardrail_id: guardrail.id.clone(),
            guardrail_version: guardrail.version.clone(),
            guardrail_enabled: guardrail.enabled,
        }
    }
}

/// An agent runtime that answers a prompt with an NDJSON byte stream.
///
/// The returned future resolves once the response head has arrived and
/// retries are settled; body chunks are then pulled from the stream.
pub trait AgentRuntime: Send + Sync {
    fn invoke(&self, request: InvocationRequest) -> BoxFuture<'static, Result<ByteStream, GatewayError>>;
}
