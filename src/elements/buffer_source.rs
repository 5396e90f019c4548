//! BufferSource - injects application values into a graph.

use crate::element::{Metadata, Source, SourceBase, Stage};
use crate::error::{Error, Result};
use crate::item::{FlowItem, PadId};
use crate::reference::Reference;
use crate::stream::CloningStream;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// A source with fixed output pads whose items come from application code.
///
/// # Example
///
/// ```rust
/// use flowgraph::elements::BufferSource;
/// use flowgraph::element::Source;
///
/// let source = BufferSource::<Vec<u8>, &str>::new([(0, "video"), (1, "audio")]);
/// assert_eq!(source.output_metadata().len(), 2);
/// ```
pub struct BufferSource<T: Reference, P: Metadata> {
    base: SourceBase<T, P>,
}

impl<T: Reference, P: Metadata> BufferSource<T, P> {
    /// Create a source with the given output pads.
    pub fn new(pads: impl IntoIterator<Item = (PadId, P)>) -> Self {
        Self {
            base: SourceBase::with_pads(pads),
        }
    }

    /// Publish `value` on `pad` and close this handle to it.
    ///
    /// Returns once every current subscriber has handled the item.
    ///
    /// # Errors
    ///
    /// [`Error::ContractViolation`] when `pad` is not an output pad of this
    /// source (the value is closed), otherwise whatever publishing returns.
    pub async fn submit(&self, pad: PadId, value: T) -> Result<()> {
        match self.base.metadata().get(pad) {
            Some(metadata) => self.base.publish(FlowItem::new(pad, metadata, value)).await,
            None => {
                value.close();
                Err(Error::contract_violation(pad, "unknown output pad"))
            }
        }
    }
}

#[async_trait]
impl<T: Reference, P: Metadata> Stage for BufferSource<T, P> {
    async fn close(&self) -> Result<()> {
        self.base.close();
        Ok(())
    }
}

impl<T: Reference, P: Metadata> Source<T, P> for BufferSource<T, P> {
    fn output_metadata(&self) -> BTreeMap<PadId, P> {
        self.base.output_metadata()
    }

    fn stream(&self) -> &CloningStream<FlowItem<T, P>> {
        self.base.stream()
    }
}

impl<T: Reference, P: Metadata> std::fmt::Debug for BufferSource<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSource").field("base", &self.base).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferPool;

    #[tokio::test]
    async fn test_submit_without_subscribers_releases_value() {
        let pool = BufferPool::new(16, 1);
        let source = BufferSource::new([(0, ())]);
        source.submit(0, pool.loan(b"x").unwrap()).await.unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(source.stream().stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_submit_unknown_pad() {
        let pool = BufferPool::new(16, 1);
        let source = BufferSource::new([(0, ())]);
        let err = source.submit(3, pool.loan(b"x").unwrap()).await.unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let source = BufferSource::new([(0, ())]);
        source.close().await.unwrap();
        assert!(matches!(source.submit(0, 1u8).await, Err(Error::Closed)));
    }
}
