pub mod event;
pub mod normalize;

pub use event::{Event, UsageMetrics};
pub use normalize::{normalize_line, WireShape};
