//! Stage roles for flowgraph pipelines.
//!
//! This module defines the contracts a stage implements to take part in a
//! [`Graph`](crate::pipeline::Graph):
//!
//! - [`Source`]: publishes items on a [`CloningStream`](crate::stream::CloningStream)
//! - [`Sink`]: accepts items on configured input pads
//! - [`Transformer`]: both at once
//!
//! Every stage also implements [`Stage`], which carries the single `close`
//! a stage has regardless of how many roles it plays.
//!
//! # Building blocks
//!
//! - [`SourceBase`]: output metadata table plus output stream
//! - [`PadMetadata`]: concurrency-safe pad table for either direction
//! - [`JobTransformer`]: a transformer whose output is produced by a
//!   background [`Job`] task that starts once its input pads are configured

mod base;
mod job;
mod pad;
mod traits;

pub use base::SourceBase;
pub use job::{ExpectedPads, Job, JobContext, JobQueue, JobTransformer};
pub use pad::{PadDirection, PadMetadata};
pub use traits::{Metadata, Sink, Source, Stage, Transformer};
