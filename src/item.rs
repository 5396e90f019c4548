//! Flow items: the envelope every stream carries.

use crate::error::Result;
use crate::reference::Reference;

/// Identifier of an input or output pad, scoped to one stage.
pub type PadId = u32;

/// A value travelling through the graph, tagged with the pad it belongs to
/// and the metadata describing that pad.
///
/// A `FlowItem` is itself a [`Reference`]: cloning clones both the value and
/// the metadata through their own reference contracts, and closing closes
/// both. Every subscriber of a stream receives its own clone and must close
/// it when done.
///
/// # Example
///
/// ```rust
/// use flowgraph::item::FlowItem;
/// use flowgraph::reference::Reference;
///
/// let item = FlowItem::new(0, String::from("text/plain"), 42u64);
/// let copy = item.try_clone().unwrap();
/// assert_eq!(copy.value(), &42);
///
/// // Moving to another pad keeps the same value, no clone involved.
/// let moved = copy.with_pad(3);
/// assert_eq!(moved.pad(), 3);
///
/// moved.close();
/// item.close();
/// ```
#[derive(Debug, PartialEq)]
pub struct FlowItem<T, P> {
    pad: PadId,
    metadata: P,
    value: T,
}

impl<T, P> FlowItem<T, P> {
    /// Create a new item.
    pub fn new(pad: PadId, metadata: P, value: T) -> Self {
        Self {
            pad,
            metadata,
            value,
        }
    }

    /// The pad this item is tagged with.
    #[inline]
    pub fn pad(&self) -> PadId {
        self.pad
    }

    /// Metadata of the item's pad.
    #[inline]
    pub fn metadata(&self) -> &P {
        &self.metadata
    }

    /// The payload.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Retag this item with another pad.
    ///
    /// The value and metadata move into the new item unchanged; no handle is
    /// created or released.
    #[inline]
    pub fn with_pad(self, pad: PadId) -> Self {
        Self { pad, ..self }
    }

    /// Split the item into `(pad, metadata, value)`.
    ///
    /// The caller becomes responsible for closing the metadata and value.
    pub fn into_parts(self) -> (PadId, P, T) {
        (self.pad, self.metadata, self.value)
    }
}

impl<T: Reference, P: Reference> Reference for FlowItem<T, P> {
    fn try_clone(&self) -> Result<Self> {
        let value = self.value.try_clone()?;
        let metadata = match self.metadata.try_clone() {
            Ok(metadata) => metadata,
            Err(e) => {
                value.close();
                return Err(e);
            }
        };
        Ok(Self {
            pad: self.pad,
            metadata,
            value,
        })
    }

    fn close(self) {
        self.value.close();
        self.metadata.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Tracked {
        live: Arc<AtomicUsize>,
    }

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::AcqRel);
            Self { live: live.clone() }
        }
    }

    impl Reference for Tracked {
        fn try_clone(&self) -> Result<Self> {
            Ok(Tracked::new(&self.live))
        }

        fn close(self) {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    #[derive(Debug)]
    struct Refusing(Arc<AtomicBool>);

    impl Reference for Refusing {
        fn try_clone(&self) -> Result<Self> {
            self.0.store(true, Ordering::Release);
            Err(Error::Released)
        }
    }

    #[test]
    fn test_clone_and_close_delegate() {
        let live = Arc::new(AtomicUsize::new(0));
        let item = FlowItem::new(1, Tracked::new(&live), Tracked::new(&live));
        assert_eq!(live.load(Ordering::Acquire), 2);

        let clone = item.try_clone().unwrap();
        assert_eq!(clone.pad(), 1);
        assert_eq!(live.load(Ordering::Acquire), 4);

        clone.close();
        item.close();
        assert_eq!(live.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_failed_metadata_clone_releases_value_clone() {
        let live = Arc::new(AtomicUsize::new(0));
        let attempted = Arc::new(AtomicBool::new(false));
        let item = FlowItem::new(0, Refusing(attempted.clone()), Tracked::new(&live));

        assert!(matches!(item.try_clone(), Err(Error::Released)));
        assert!(attempted.load(Ordering::Acquire));
        assert_eq!(live.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_with_pad_does_not_clone() {
        let live = Arc::new(AtomicUsize::new(0));
        let item = FlowItem::new(0, (), Tracked::new(&live)).with_pad(9);
        assert_eq!(item.pad(), 9);
        assert_eq!(live.load(Ordering::Acquire), 1);
        item.close();
        assert_eq!(live.load(Ordering::Acquire), 0);
    }
}
