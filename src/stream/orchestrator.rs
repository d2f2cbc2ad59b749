//! Drives one chat turn: runtime bytes in, client events out.
//!
//! The pipeline is a single pull stream. Each poll either hands out a queued
//! event or awaits the next upstream chunk, decodes it into lines and
//! normalizes every complete line. Usage metrics are dispatched exactly once,
//! when the stream ends, fails, or is dropped by a disconnecting client.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::decoder::LineDecoder;
use super::markup::MarkupFilter;
use crate::analytics::{AnalyticsSink, GuardrailViolation, StreamUsage};
use crate::error::GatewayError;
use crate::metrics::StreamMetrics;
use crate::observability::log_stream_complete;
use crate::protocol::event::{Event, GUARDRAIL_INTERVENED, STATUS_STARTED};
use crate::protocol::normalize::normalize_line;
use crate::transport::{AgentRuntime, ByteStream, InvocationRequest};

/// Request-scoped values that do not travel to the runtime.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub request_id: String,
    pub user_email: Option<String>,
}

/// How a stream ended, for the completion log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl StreamOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Failed => "failed",
            StreamOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    Closed,
}

struct PendingEvents {
    events: SmallVec<[Option<Event>; 8]>,
    head: usize,
}

impl PendingEvents {
    #[inline]
    fn new() -> Self {
        Self {
            events: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn push(&mut self, event: Event) {
        self.events.push(Some(event));
    }

    #[inline]
    fn pop_front(&mut self) -> Option<Event> {
        if self.head >= self.events.len() {
            return None;
        }
        let event = self.events[self.head].take();
        self.head += 1;
        if self.head == self.events.len() {
            self.events.clear();
            self.head = 0;
        }
        event
    }
}

/// Build the client event stream for one invocation.
///
/// The runtime is invoked on first poll. Failures become a single
/// [`Event::Error`] followed by end of stream; a clean end yields
/// [`Event::Done`].
pub fn chat_event_stream(
    runtime: Arc<dyn AgentRuntime>,
    sink: Arc<dyn AnalyticsSink>,
    invocation: InvocationRequest,
    context: StreamContext,
) -> impl Stream<Item = Event> + Send + 'static {
    let driver = StreamDriver::new(runtime, sink, invocation, context);
    futures_util::stream::unfold(driver, |mut driver| async move {
        let event = driver.next_event().await?;
        Some((event, driver))
    })
}

struct StreamDriver {
    runtime: Arc<dyn AgentRuntime>,
    sink: Arc<dyn AnalyticsSink>,
    invocation: Option<InvocationRequest>,
    upstream: Option<ByteStream>,
    phase: Phase,
    decoder: LineDecoder,
    filter: MarkupFilter,
    metrics: StreamMetrics,
    announced: FxHashSet<String>,
    lines: Vec<String>,
    pending: PendingEvents,
    request_id: String,
    user_id: String,
    user_email: Option<String>,
    session_id: String,
    model_id: String,
    started: Instant,
    outcome: StreamOutcome,
    finalized: bool,
}

impl StreamDriver {
    fn new(
        runtime: Arc<dyn AgentRuntime>,
        sink: Arc<dyn AnalyticsSink>,
        invocation: InvocationRequest,
        context: StreamContext,
    ) -> Self {
        Self {
            runtime,
            sink,
            user_id: invocation.user_id.clone(),
            session_id: invocation.session_id.clone(),
            model_id: invocation.model_id.clone(),
            invocation: Some(invocation),
            upstream: None,
            phase: Phase::Open,
            decoder: LineDecoder::new(),
            filter: MarkupFilter::new(),
            metrics: StreamMetrics::new(),
            announced: FxHashSet::default(),
            lines: Vec::with_capacity(8),
            pending: PendingEvents::new(),
            request_id: context.request_id,
            user_email: context.user_email,
            started: Instant::now(),
            outcome: StreamOutcome::Cancelled,
            finalized: false,
        }
    }

    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    debug!(
                        request_id = %self.request_id,
                        kind = event.kind(),
                        "terminal event delivered"
                    );
                }
                return Some(event);
            }
            match self.phase {
                Phase::Open => self.pull().await,
                Phase::Draining => {
                    self.decoder.finish_into(&mut self.lines);
                    self.process_lines();
                    self.push(Event::Done);
                    self.outcome = StreamOutcome::Completed;
                    self.phase = Phase::Closed;
                }
                Phase::Closed => {
                    self.finalize();
                    return None;
                }
            }
        }
    }

    async fn pull(&mut self) {
        if self.upstream.is_none() {
            let Some(invocation) = self.invocation.take() else {
                self.phase = Phase::Closed;
                return;
            };
            match self.runtime.invoke(invocation).await {
                Ok(stream) => self.upstream = Some(stream),
                Err(err) => {
                    self.fail(&err);
                    return;
                }
            }
        }

        let Some(upstream) = self.upstream.as_mut() else {
            self.phase = Phase::Closed;
            return;
        };
        match upstream.next().await {
            Some(Ok(chunk)) => {
                self.decoder.feed_into(&chunk, &mut self.lines);
                self.process_lines();
            }
            Some(Err(err)) => self.fail(&err),
            None => {
                self.upstream = None;
                self.phase = Phase::Draining;
            }
        }
    }

    fn process_lines(&mut self) {
        let mut lines = std::mem::take(&mut self.lines);
        for line in lines.drain(..) {
            if let Some(event) = normalize_line(&line, &mut self.filter) {
                self.push(event);
            }
            if self.filter.has_tool_calls() {
                for call in self.filter.take_tool_calls() {
                    self.push(Event::ToolInvoked {
                        tool_name: call.name,
                        tool_input: Some(call.input),
                        tool_call_id: call.id,
                        status: STATUS_STARTED.to_string(),
                    });
                }
            }
        }
        self.lines = lines;
    }

    fn push(&mut self, event: Event) {
        match &event {
            Event::ToolInvoked {
                tool_name,
                tool_call_id,
                ..
            } => {
                if !self.announced.insert(tool_call_id.clone()) {
                    debug!(
                        request_id = %self.request_id,
                        tool_call_id = %tool_call_id,
                        "suppressing repeated tool invocation"
                    );
                    return;
                }
                debug!(
                    request_id = %self.request_id,
                    tool_name = %tool_name,
                    tool_call_id = %tool_call_id,
                    "tool invoked"
                );
                self.metrics.record_tool_invoked(tool_call_id, tool_name);
            }
            Event::ToolResult {
                tool_call_id,
                tool_result,
                status,
                ..
            } => {
                self.metrics
                    .record_tool_result(tool_call_id, status, tool_result.as_ref());
            }
            Event::Metadata { data } => self.metrics.record_metadata(data),
            Event::GuardrailNotice {
                source,
                action,
                assessments,
            } if action == GUARDRAIL_INTERVENED => {
                warn!(
                    request_id = %self.request_id,
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    source = %source,
                    "guardrail intervened"
                );
                self.sink.record_violation(GuardrailViolation {
                    request_id: self.request_id.clone(),
                    user_id: self.user_id.clone(),
                    session_id: self.session_id.clone(),
                    source: source.clone(),
                    action: action.clone(),
                    assessments: assessments.clone(),
                });
            }
            _ => {}
        }
        self.pending.push(event);
    }

    fn fail(&mut self, err: &GatewayError) {
        warn!(
            request_id = %self.request_id,
            session_id = %self.session_id,
            user_id = %self.user_id,
            error = %err,
            "agent runtime stream failed"
        );
        self.upstream = None;
        self.push(Event::Error {
            message: err.client_message().to_string(),
            details: Some(err.to_string()),
        });
        self.outcome = StreamOutcome::Failed;
        self.phase = Phase::Closed;
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        // Text still undecided at close (an unclosed reasoning block, a torn
        // last line) is dropped.
        let withheld_bytes = self.filter.unrendered_len();
        let undecoded_bytes = self.decoder.buffered_len();
        if withheld_bytes > 0 || undecoded_bytes > 0 {
            debug!(
                request_id = %self.request_id,
                withheld_bytes,
                undecoded_bytes,
                "discarding unfinished stream text"
            );
        }

        self.metrics.close_pending();
        let metrics = std::mem::take(&mut self.metrics);
        let usage = StreamUsage {
            request_id: self.request_id.clone(),
            user_id: self.user_id.clone(),
            user_email: self.user_email.clone(),
            session_id: self.session_id.clone(),
            model_id: self.model_id.clone(),
            input_tokens: metrics.input_tokens,
            output_tokens: metrics.output_tokens,
            total_tokens: metrics.total_tokens,
            latency_ms: metrics.latency_ms,
            tool_usage: metrics.tool_usage,
        };
        log_stream_complete(&usage, self.outcome.as_str(), self.started.elapsed());
        self.sink.record_usage(usage);
    }
}

impl Drop for StreamDriver {
    fn drop(&mut self) {
        self.finalize();
    }
}
