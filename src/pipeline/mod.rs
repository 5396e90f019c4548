//! Graph construction and wiring.
//!
//! - [`Graph`]: registry of named stages plus their connections
//! - [`GraphConfig`]: name, finalize timeout, event capacity, spans
//! - [`ElementHandle`]: typed handle returned on registration and lookup
//! - [`GraphEvent`]: events emitted while wiring, finalizing and closing
//!
//! # Wiring protocol
//!
//! `connect` configures the sink's pads from the source's output metadata,
//! registers a forwarder on the source's stream and spawns one task per
//! connection that lives until the stream closes or the graph is closed.
//! `finalize` waits for every connection task to report that it started;
//! publish only after it returns.

mod events;
mod graph;

pub use events::{EventReceiver, EventSender, GraphEvent};
pub use graph::{ElementHandle, Graph, GraphConfig, PadMap};
