//! Built-in stages.
//!
//! ## Sources
//! - [`BufferSource`]: Publishes values handed to it by application code
//!
//! ## Sinks
//! - [`BufferSink`]: Records received items per pad for inspection

mod buffer_sink;
mod buffer_source;

pub use buffer_sink::BufferSink;
pub use buffer_source::BufferSource;
