//! BufferSink - keeps received items for the application to inspect.

use crate::element::{Metadata, PadDirection, PadMetadata, Sink, Stage};
use crate::error::{Error, Result};
use crate::item::{FlowItem, PadId};
use crate::reference::Reference;
use crate::sync::LockContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// A sink that records every accepted item, grouped by input pad.
///
/// Items stay owned by the sink until taken with [`take`](Self::take) or
/// until the sink is closed, which closes whatever is still held.
pub struct BufferSink<T: Reference, P: Metadata> {
    input: PadMetadata<P>,
    received: Mutex<BTreeMap<PadId, Vec<FlowItem<T, P>>>>,
    total: watch::Sender<usize>,
    closed: AtomicBool,
}

impl<T: Reference, P: Metadata> BufferSink<T, P> {
    /// Create a sink whose pads are configured by the graph.
    pub fn new() -> Self {
        Self::with_pads([])
    }

    /// Create a sink with pre-configured input pads.
    pub fn with_pads(pads: impl IntoIterator<Item = (PadId, P)>) -> Self {
        Self {
            input: PadMetadata::with_pads(PadDirection::Input, pads),
            received: Mutex::new(BTreeMap::new()),
            total: watch::Sender::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of items held for `pad`.
    pub fn count(&self, pad: PadId) -> usize {
        self.received.lock().get(&pad).map_or(0, Vec::len)
    }

    /// Number of items accepted since creation, over all pads.
    pub fn total(&self) -> usize {
        *self.total.borrow()
    }

    /// Item counts per pad.
    pub fn received(&self) -> BTreeMap<PadId, usize> {
        self.received
            .lock()
            .iter()
            .map(|(pad, items)| (*pad, items.len()))
            .collect()
    }

    /// Take every item held for `pad`. The caller must close them.
    pub fn take(&self, pad: PadId) -> Vec<FlowItem<T, P>> {
        self.received.lock().remove(&pad).unwrap_or_default()
    }

    /// Wait until at least `count` items are held for `pad`.
    ///
    /// Returns early if the sink is dropped.
    pub async fn wait_for(&self, pad: PadId, count: usize) {
        let mut updates = self.total.subscribe();
        while self.count(pad) < count {
            if updates.changed().await.is_err() {
                return;
            }
        }
    }
}

impl<T: Reference + Clone, P: Metadata> BufferSink<T, P> {
    /// Copies of the values held for `pad`, in arrival order.
    pub fn values(&self, pad: PadId) -> Vec<T> {
        self.received
            .lock()
            .get(&pad)
            .map(|items| items.iter().map(|item| item.value().clone()).collect())
            .unwrap_or_default()
    }
}

impl<T: Reference, P: Metadata> Default for BufferSink<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Reference, P: Metadata> Stage for BufferSink<T, P> {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let held = std::mem::take(&mut *self.received.lock());
        let released: usize = held
            .into_values()
            .map(|items| {
                let n = items.len();
                items.into_iter().for_each(Reference::close);
                n
            })
            .sum();
        tracing::debug!(released, "buffer sink closed");
        Ok(())
    }
}

#[async_trait]
impl<T: Reference, P: Metadata> Sink<T, P> for BufferSink<T, P> {
    fn input_metadata(&self) -> BTreeMap<PadId, Option<P>> {
        self.input
            .snapshot()
            .into_iter()
            .map(|(pad, meta)| (pad, Some(meta)))
            .collect()
    }

    fn configured_metadata(&self, pad: PadId) -> Option<P> {
        self.input.get(pad)
    }

    fn configure(&self, pad: PadId, metadata: P) -> Result<()> {
        self.input.insert_new(pad, metadata)
    }

    async fn submit(&self, _cx: &LockContext, item: FlowItem<T, P>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            item.close();
            return Err(Error::Closed);
        }
        self.received.lock().entry(item.pad()).or_default().push(item);
        self.total.send_modify(|n| *n += 1);
        Ok(())
    }
}

impl<T: Reference, P: Metadata> std::fmt::Debug for BufferSink<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSink")
            .field("pads", &self.input.pads())
            .field("received", &self.received())
            .finish()
    }
}
