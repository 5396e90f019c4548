//! # flowgraph
//!
//! An async dataflow runtime for composing pipelines out of independently
//! written sources, sinks and transformers connected through numbered pads.
//!
//! Payloads may wrap external resources (pooled buffers, hardware handles).
//! Every stream hands each subscriber its own handle through the
//! [`Reference`](reference::Reference) contract, so a resource is released
//! exactly once, after the last consumer is done with it.
//!
//! ## Features
//!
//! - **Cloning broadcast**: [`CloningStream`](stream::CloningStream) fans
//!   every item out as one clone per subscriber and waits for all of them
//! - **Reentrant publishing**: a delivery may publish back into a stream its
//!   call chain already locked, via an explicit [`LockContext`](sync::LockContext)
//! - **Race-free wiring**: [`Graph`](pipeline::Graph) registers every
//!   connection before producers start
//! - **Job transformers**: [`JobTransformer`](element::JobTransformer)
//!   starts its task once all input pads are configured and drains it on close
//!
//! ## Quick Start
//!
//! ```rust
//! use flowgraph::prelude::*;
//! use flowgraph::elements::{BufferSink, BufferSource};
//!
//! # #[tokio::main]
//! # async fn main() -> flowgraph::Result<()> {
//! let mut graph = Graph::new(GraphConfig::new("quickstart"));
//! let source = graph.add_source("source", BufferSource::new([(0, "number")]))?;
//! let sink = graph.add_sink("sink", BufferSink::<u64, &str>::new())?;
//! graph.connect(&source, &sink)?;
//! graph.finalize().await?;
//!
//! for n in 0..3 {
//!     source.submit(0, n).await?;
//! }
//! assert_eq!(sink.values(0), vec![0, 1, 2]);
//! graph.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod element;
pub mod elements;
pub mod error;
pub mod item;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod reference;
pub mod stream;
pub mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::element::{
        ExpectedPads, Job, JobContext, JobQueue, JobTransformer, Metadata, Sink, Source,
        SourceBase, Stage, Transformer,
    };
    pub use crate::error::{Error, Result};
    pub use crate::item::{FlowItem, PadId};
    pub use crate::pipeline::{ElementHandle, Graph, GraphConfig};
    pub use crate::reference::Reference;
    pub use crate::stream::{CloningStream, Subscriber};
    pub use crate::sync::LockContext;
}

pub use error::{Error, Result};
