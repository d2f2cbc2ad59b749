//! SSE framing for client-facing events.

use std::convert::Infallible;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::protocol::event::Event;

const FALLBACK_ERROR_FRAME: &[u8] =
    b"data: {\"type\":\"error\",\"message\":\"Failed to encode stream event\"}\n\n";

/// Encode one event as a `data: <json>\n\n` frame.
#[must_use]
pub fn encode_event(event: &Event) -> Bytes {
    let mut frame = Vec::with_capacity(128);
    frame.extend_from_slice(b"data: ");
    if serde_json::to_writer(&mut frame, event).is_err() {
        return Bytes::from_static(FALLBACK_ERROR_FRAME);
    }
    frame.extend_from_slice(b"\n\n");
    Bytes::from(frame)
}

/// Frame an event stream for `Body::from_stream`.
pub fn sse_body_stream<S>(events: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
where
    S: Stream<Item = Event> + Send + 'static,
{
    events.map(|event| Ok(encode_event(&event)))
}
