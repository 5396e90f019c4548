//! Synchronization primitives used by the streams.

mod reentrant;

pub use reentrant::{LockContext, LockId, ReentrantMutex};
