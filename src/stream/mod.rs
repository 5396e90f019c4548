//! Multicast streams.

mod cloning;

pub(crate) use cloning::ensure_open;
pub use cloning::{CloningStream, FnSubscriber, StreamStats, Subscriber, Subscription};
