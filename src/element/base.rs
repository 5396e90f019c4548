//! Reusable source state.

use super::pad::{PadDirection, PadMetadata};
use super::traits::Metadata;
use crate::error::Result;
use crate::item::{FlowItem, PadId};
use crate::reference::Reference;
use crate::stream::{CloningStream, ensure_open};
use crate::sync::LockContext;
use std::collections::BTreeMap;

/// Output metadata table plus output stream, the state every source needs.
///
/// Embed it in a stage and forward [`Source`](super::Source) to it.
pub struct SourceBase<T: Reference, P: Metadata> {
    metadata: PadMetadata<P>,
    stream: CloningStream<FlowItem<T, P>>,
}

impl<T: Reference, P: Metadata> SourceBase<T, P> {
    /// Create a source with no output pads yet.
    pub fn new() -> Self {
        Self {
            metadata: PadMetadata::outputs(),
            stream: CloningStream::new(),
        }
    }

    /// Create a source with fixed output pads.
    pub fn with_pads(pads: impl IntoIterator<Item = (PadId, P)>) -> Self {
        Self {
            metadata: PadMetadata::with_pads(PadDirection::Output, pads),
            stream: CloningStream::new(),
        }
    }

    /// Output metadata table.
    pub fn metadata(&self) -> &PadMetadata<P> {
        &self.metadata
    }

    /// Copy of the output metadata.
    pub fn output_metadata(&self) -> BTreeMap<PadId, P> {
        self.metadata.snapshot()
    }

    /// Set the metadata of an output pad.
    pub fn set_output_metadata(&self, pad: PadId, metadata: P) {
        if let Some(previous) = self.metadata.set(pad, metadata) {
            previous.close();
        }
    }

    /// The output stream.
    pub fn stream(&self) -> &CloningStream<FlowItem<T, P>> {
        &self.stream
    }

    /// Publish `item` and close this handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`](crate::Error::Closed) once the source is
    /// closed, otherwise whatever the stream's publish returns.
    pub async fn publish(&self, item: FlowItem<T, P>) -> Result<()> {
        self.publish_in(&LockContext::new(), item).await
    }

    /// [`publish`](Self::publish) within a call chain's lock context.
    pub async fn publish_in(&self, cx: &LockContext, item: FlowItem<T, P>) -> Result<()> {
        let result = match ensure_open(&self.stream) {
            Ok(()) => self.stream.publish_in(cx, &item).await,
            Err(e) => Err(e),
        };
        item.close();
        result
    }

    /// Build an item for `pad` carrying that pad's metadata.
    ///
    /// Returns `None` when the pad has no metadata.
    pub fn item(&self, pad: PadId, value: T) -> Option<FlowItem<T, P>> {
        self.metadata
            .get(pad)
            .map(|metadata| FlowItem::new(pad, metadata, value))
    }

    /// Close the output stream.
    pub fn close(&self) {
        self.stream.close();
    }
}

impl<T: Reference, P: Metadata> Default for SourceBase<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reference, P: Metadata> std::fmt::Debug for SourceBase<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBase")
            .field("pads", &self.metadata.pads())
            .field("stream", &self.stream)
            .finish()
    }
}
