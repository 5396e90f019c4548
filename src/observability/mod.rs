//! Observability: structured logging and spans via `tracing`.
//!
//! flowgraph emits spans for:
//! - graph operations (`graph`)
//! - element lifecycle (`element`)
//! - connection tasks (`connection`)
//!
//! and events at these levels:
//!
//! | Level | Events |
//! |-------|--------|
//! | `error` | contract violations, failed deliveries |
//! | `warn` | items on unmapped pads, failed jobs |
//! | `info` | graph finalized, graph closed |
//! | `debug` | pad mapping, connection start/stop, stream close |
//! | `trace` | per-item publish and forward |
//!
//! Install any `tracing` subscriber to see them, for example
//! `tracing_subscriber::fmt().with_env_filter("flowgraph=debug").init()`.

mod tracing_support;

pub use tracing_support::{
    TracingConfig, span_connection, span_element, span_graph, trace_delivery_error,
    trace_item_dropped, trace_item_forwarded, trace_pad_mapped, trace_pad_skipped,
};
