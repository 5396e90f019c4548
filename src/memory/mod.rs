//! Pooled memory for resource-bearing payloads.
//!
//! [`BufferPool`] hands out fixed-size slots as [`PooledBuffer`] handles.
//! A handle implements [`Reference`](crate::reference::Reference), so it can
//! travel through any stream: every subscriber gets its own handle and the
//! slot returns to the pool once all of them are closed.
//!
//! # Example
//!
//! ```rust
//! use flowgraph::memory::BufferPool;
//!
//! let pool = BufferPool::new(4096, 16);
//! let frame = pool.loan(&[0u8; 1024]).unwrap();
//! assert_eq!(pool.outstanding(), 1);
//! drop(frame);
//! assert_eq!(pool.outstanding(), 0);
//! ```

mod bitmap;
mod pool;

pub use pool::{BufferPool, PooledBuffer};
