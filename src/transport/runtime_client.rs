use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::RuntimeConfig;
use crate::error::GatewayError;
use crate::util::{percent_encode_component, truncate_on_char_boundary};

use super::retry::{is_transient_message, RetryPolicy};
use super::{AgentRuntime, ByteStream, InvocationRequest};

const SESSION_ID_HEADER: HeaderName =
    HeaderName::from_static("x-amzn-bedrock-agentcore-runtime-session-id");
const ERROR_BODY_MAX_BYTES: usize = 2_048;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    connect_timeout: Duration,
) -> Result<reqwest::Client, GatewayError> {
    // No overall timeout: agent turns stream for as long as the model runs.
    reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .tcp_nodelay(true)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// `{endpoint}/runtimes/{encoded arn}/invocations[?qualifier=...]`
pub(crate) fn build_invoke_url(
    endpoint: &str,
    arn: &str,
    qualifier: Option<&str>,
) -> Result<url::Url, GatewayError> {
    let raw = format!(
        "{}/runtimes/{}/invocations",
        endpoint.trim_end_matches('/'),
        percent_encode_component(arn)
    );
    let mut url = url::Url::parse(&raw)
        .map_err(|err| GatewayError::Config(format!("Invalid runtime endpoint: {err}")))?;
    if let Some(qualifier) = qualifier.map(str::trim).filter(|q| !q.is_empty()) {
        url.query_pairs_mut().append_pair("qualifier", qualifier);
    }
    Ok(url)
}

/// HTTP client for the agent runtime's invoke endpoint.
pub struct HttpRuntimeClient {
    client: reqwest::Client,
    invoke_url: url::Url,
    authorization: Option<HeaderValue>,
    retry: RetryPolicy,
}

impl HttpRuntimeClient {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] for an unusable endpoint or token and
    /// [`GatewayError::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &RuntimeConfig) -> Result<Self, GatewayError> {
        let client = build_reqwest_client(
            config.pool_max_idle_per_host,
            Duration::from_secs(config.connect_timeout_secs),
        )?;
        let invoke_url = build_invoke_url(
            &config.endpoint_url(),
            &config.arn,
            config.qualifier.as_deref(),
        )?;
        let authorization = config
            .bearer_token
            .as_deref()
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                    GatewayError::Config("runtime.bearer_token is not a valid header value".into())
                })?;
                value.set_sensitive(true);
                Ok::<_, GatewayError>(value)
            })
            .transpose()?;

        Ok(Self {
            client,
            invoke_url,
            authorization,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn invoke_url(&self) -> &url::Url {
        &self.invoke_url
    }

    fn request_headers(&self, session_id: &str) -> Result<HeaderMap, GatewayError> {
        let mut headers = HeaderMap::with_capacity(4);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let session = HeaderValue::from_str(session_id).map_err(|_| {
            GatewayError::InvalidRequest("session_id is not a valid header value".into())
        })?;
        headers.insert(SESSION_ID_HEADER, session);
        if let Some(authorization) = &self.authorization {
            headers.insert(AUTHORIZATION, authorization.clone());
        }
        Ok(headers)
    }
}

impl AgentRuntime for HttpRuntimeClient {
    fn invoke(
        &self,
        request: InvocationRequest,
    ) -> BoxFuture<'static, Result<ByteStream, GatewayError>> {
        let client = self.client.clone();
        let url = self.invoke_url.clone();
        let headers = self.request_headers(&request.session_id);
        let body = serde_json::to_vec(&request);
        let retry = self.retry;

        Box::pin(async move {
            let headers = headers?;
            let body = body.map(Bytes::from).map_err(|err| {
                GatewayError::Internal(format!("Failed to encode invocation: {err}"))
            })?;
            let response = send_with_retry(&client, &url, &headers, body, retry).await?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    message: truncate_on_char_boundary(&text, ERROR_BODY_MAX_BYTES).to_string(),
                });
            }

            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|err| GatewayError::Transport(err.to_string())));
            Ok(stream.boxed())
        })
    }
}

/// POST with retries on retriable statuses and transient transport errors.
async fn send_with_retry(
    client: &reqwest::Client,
    url: &url::Url,
    headers: &HeaderMap,
    body: Bytes,
    retry: RetryPolicy,
) -> Result<reqwest::Response, GatewayError> {
    let mut retries_done = 0;
    loop {
        let mut request = reqwest::Request::new(http::Method::POST, url.clone());
        *request.headers_mut() = headers.clone();
        *request.body_mut() = Some(reqwest::Body::from(body.clone()));

        let delay = match client.execute(request).await {
            Ok(response) => {
                let status = response.status();
                let Some(delay) = retry.after_status(status, response.headers(), retries_done)
                else {
                    return Ok(response);
                };
                tracing::debug!(
                    status = status.as_u16(),
                    retry = retries_done + 1,
                    delay_ms = delay.as_millis(),
                    "agent runtime busy, retrying invocation"
                );
                delay
            }
            Err(err) => {
                let message = err.to_string();
                let transient = err.is_connect() || err.is_timeout() || is_transient_message(&message);
                let Some(delay) = retry.after_transport_error(transient, retries_done) else {
                    return Err(GatewayError::Transport(message));
                };
                tracing::debug!(
                    retry = retries_done + 1,
                    delay_ms = delay.as_millis(),
                    error = %message,
                    "agent runtime unreachable, retrying invocation"
                );
                delay
            }
        };
        tokio::time::sleep(delay).await;
        retries_done += 1;
    }
}
