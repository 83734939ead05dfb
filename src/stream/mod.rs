//! Server-sent-event streaming: keeps one reconnecting connection open per
//! subscribed key, falling back to the cache's stale-TTL polling whenever
//! streaming cannot be established or is disabled.

pub mod backoff;
pub mod engine;

pub use engine::{StreamSink, StreamingEngine};
