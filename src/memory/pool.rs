//! Fixed-slot buffer pool with reference-counted loans.

use super::bitmap::SlotBitmap;
use crate::error::{Error, Result};
use crate::reference::Reference;
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

struct PoolInner {
    slot_size: usize,
    slots: Box<[RwLock<Vec<u8>>]>,
    bitmap: SlotBitmap,
    loans: AtomicU64,
    releases: AtomicU64,
}

impl PoolInner {
    fn release(&self, index: usize) {
        self.slots[index].write().clear();
        if self.bitmap.release(index) {
            self.releases.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(slot = index, "slot released");
        } else {
            tracing::error!(slot = index, "slot released twice");
        }
    }
}

/// A pool of equally sized byte slots.
///
/// Each [`loan`](Self::loan) fills a free slot and returns a
/// [`PooledBuffer`] handle to it. Handles are a [`Reference`]: cloning shares
/// the slot, and the slot is cleared and handed back to the pool when the last
/// handle is closed. The pool counts loans and releases so that leaks and
/// double releases show up in tests.
///
/// # Example
///
/// ```rust
/// use flowgraph::memory::BufferPool;
/// use flowgraph::reference::Reference;
///
/// let pool = BufferPool::new(64, 2);
/// let buf = pool.loan(b"frame").unwrap();
/// let copy = buf.try_clone().unwrap();
/// assert_eq!(pool.available(), 1);
///
/// buf.close();
/// assert_eq!(pool.releases(), 0);
/// copy.close();
/// assert_eq!(pool.releases(), 1);
/// assert_eq!(pool.available(), 2);
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `slots` slots of `slot_size` bytes each.
    pub fn new(slot_size: usize, slots: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slot_size,
                slots: (0..slots)
                    .map(|_| RwLock::new(Vec::with_capacity(slot_size)))
                    .collect(),
                bitmap: SlotBitmap::new(slots),
                loans: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }),
        }
    }

    /// Copy `data` into a free slot.
    ///
    /// # Errors
    ///
    /// [`Error::SlotOverflow`] when `data` is larger than a slot,
    /// [`Error::PoolExhausted`] when every slot is loaned.
    pub fn loan(&self, data: &[u8]) -> Result<PooledBuffer> {
        if data.len() > self.inner.slot_size {
            return Err(Error::SlotOverflow {
                len: data.len(),
                slot_size: self.inner.slot_size,
            });
        }
        let index = self.inner.bitmap.acquire().ok_or(Error::PoolExhausted)?;
        self.inner.slots[index].write().extend_from_slice(data);
        self.inner.loans.fetch_add(1, Ordering::AcqRel);

        Ok(PooledBuffer {
            slot: Arc::new(Slot {
                pool: Arc::clone(&self.inner),
                index,
                refs: AtomicUsize::new(1),
            }),
        })
    }

    /// Size of each slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.inner.slot_size
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.bitmap.capacity()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.capacity() - self.outstanding()
    }

    /// Slots currently loaned.
    pub fn outstanding(&self) -> usize {
        self.inner.bitmap.loaned()
    }

    /// Total successful loans since creation.
    pub fn loans(&self) -> u64 {
        self.inner.loans.load(Ordering::Acquire)
    }

    /// Total slot releases since creation.
    pub fn releases(&self) -> u64 {
        self.inner.releases.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("slot_size", &self.slot_size())
            .field("capacity", &self.capacity())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

struct Slot {
    pool: Arc<PoolInner>,
    index: usize,
    refs: AtomicUsize,
}

/// One handle to a loaned pool slot.
///
/// The slot goes back to the pool when the last handle is closed or dropped.
pub struct PooledBuffer {
    slot: Arc<Slot>,
}

impl PooledBuffer {
    /// The slot's contents.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.slot.pool.slots[self.slot.index].read(), |v| v.as_slice())
    }

    /// Copy of the slot's contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Slot index within the pool.
    pub fn slot(&self) -> usize {
        self.slot.index
    }

    /// Number of live handles to this slot.
    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }
}

impl Reference for PooledBuffer {
    fn try_clone(&self) -> Result<Self> {
        self.slot
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .map_err(|_| Error::Released)?;
        Ok(Self {
            slot: Arc::clone(&self.slot),
        })
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.pool.release(self.slot.index);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("slot", &self.slot.index)
            .field("refs", &self.ref_count())
            .finish()
    }
}
