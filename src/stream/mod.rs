//! The streaming pipeline: bytes to lines, lines to events, events to SSE.

pub mod decoder;
pub mod markup;
pub mod orchestrator;
pub mod sse;

pub use decoder::LineDecoder;
pub use markup::{ExtractedToolCall, MarkupFilter};
pub use orchestrator::{chat_event_stream, StreamContext, StreamOutcome};
pub use sse::{encode_event, sse_body_stream};
