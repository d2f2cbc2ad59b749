//! When to re-send a runtime invocation, and how long to wait first.
//!
//! Only the request head is ever retried: once a success response has been
//! handed to the stream, its body is never re-requested.

use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use memchr::memmem;

/// Lower-cased fragments of transport error messages that are worth a retry.
const TRANSIENT_FRAGMENTS: [&str; 8] = [
    "timed out",
    "timeout",
    "connection reset",
    "connection closed",
    "connection refused",
    "broken pipe",
    "unexpected eof",
    "error sending request",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Retries on top of the first attempt.
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait before retrying a response with `status`, or `None` when the
    /// response is final.
    pub(crate) fn after_status(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        retries_done: u32,
    ) -> Option<Duration> {
        if retries_done >= self.max_retries || !is_retriable_status(status) {
            return None;
        }
        Some(
            self.retry_after(headers)
                .unwrap_or_else(|| self.backoff(retries_done)),
        )
    }

    /// Wait before retrying a failed send, or `None` when the failure is final.
    pub(crate) fn after_transport_error(&self, transient: bool, retries_done: u32) -> Option<Duration> {
        (transient && retries_done < self.max_retries).then(|| self.backoff(retries_done))
    }

    fn backoff(&self, retries_done: u32) -> Duration {
        let factor = 1_u32 << retries_done.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `Retry-After` as delta-seconds or an HTTP date, clamped.
    fn retry_after(&self, headers: &HeaderMap) -> Option<Duration> {
        let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
        let delay = match value.parse::<u64>() {
            Ok(seconds) => Duration::from_secs(seconds),
            Err(_) => httpdate::parse_http_date(value)
                .ok()?
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        };
        Some(delay.min(self.max_retry_after))
    }
}

fn is_retriable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// True when a transport error message reads like a transient network fault.
pub(crate) fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_FRAGMENTS
        .iter()
        .any(|fragment| memmem::find(lowered.as_bytes(), fragment.as_bytes()).is_some())
}
