//! Async mutex that a call chain may re-enter.
//!
//! Re-entry is decided by an explicit [`LockContext`] carried through the
//! call chain, never by thread identity. A task running on any worker thread
//! that was handed the context of a chain holding the lock passes straight
//! through; everything else waits its turn.

use smallvec::SmallVec;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one [`ReentrantMutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u64);

/// The set of reentrant locks held by a logical call chain.
///
/// Pass it to anything spawned or awaited inside a locked region so that a
/// nested call on the same lock proceeds instead of deadlocking. An empty
/// (default) context holds nothing.
#[derive(Debug, Clone, Default)]
pub struct LockContext {
    held: SmallVec<[LockId; 4]>,
}

impl LockContext {
    /// A context holding no locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the chain holds `lock`.
    pub fn holds(&self, lock: LockId) -> bool {
        self.held.contains(&lock)
    }

    /// Number of locks held by the chain.
    pub fn depth(&self) -> usize {
        self.held.len()
    }

    fn with(&self, lock: LockId) -> Self {
        let mut held = self.held.clone();
        held.push(lock);
        Self { held }
    }
}

/// An async mutual-exclusion lock that tolerates re-entry from the call
/// chain already holding it.
///
/// # Example
///
/// ```rust
/// use flowgraph::sync::{LockContext, ReentrantMutex};
///
/// # #[tokio::main]
/// # async fn main() {
/// let lock = ReentrantMutex::new();
/// let lock = &lock;
/// let value = lock
///     .with_reentrant_lock(&LockContext::new(), |cx| async move {
///         // Same chain, same lock: no deadlock.
///         lock.with_reentrant_lock(&cx, |_| async { 42 }).await
///     })
///     .await;
/// assert_eq!(value, 42);
/// # }
/// ```
#[derive(Debug)]
pub struct ReentrantMutex {
    id: LockId,
    inner: Mutex<()>,
}

impl ReentrantMutex {
    /// Create an unlocked mutex.
    pub fn new() -> Self {
        Self {
            id: LockId(NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)),
            inner: Mutex::new(()),
        }
    }

    /// This lock's identity.
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Run `body` while holding the lock.
    ///
    /// If `cx` already holds this lock, `body` runs immediately with the same
    /// context. Otherwise this waits for the lock, then runs `body` with a
    /// context extended by this lock. The lock is released when `body`
    /// completes or is dropped.
    pub async fn with_reentrant_lock<F, Fut, R>(&self, cx: &LockContext, body: F) -> R
    where
        F: FnOnce(LockContext) -> Fut,
        Fut: Future<Output = R>,
    {
        if cx.holds(self.id) {
            return body(cx.clone()).await;
        }
        let _guard = self.inner.lock().await;
        body(cx.with(self.id)).await
    }

    /// Whether some chain currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}
