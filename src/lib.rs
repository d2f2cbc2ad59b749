pub mod analytics;
pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod state;
pub mod storage;
pub mod stream;
pub mod transport;
pub(crate) mod util;
