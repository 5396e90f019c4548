//! Core stage traits.

use crate::error::{Error, Result};
use crate::item::{FlowItem, PadId};
use crate::reference::Reference;
use crate::stream::CloningStream;
use crate::sync::LockContext;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Pad metadata: a plain, comparable reference type.
///
/// Implemented for every type that satisfies the bounds.
pub trait Metadata: Reference + Clone + PartialEq + Debug {}

impl<P: Reference + Clone + PartialEq + Debug> Metadata for P {}

/// Behaviour shared by every stage in a graph.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    /// Release the stage's resources.
    ///
    /// Must be idempotent. For stages that produce items, closing also closes
    /// their output stream, which ends every connection reading from it.
    async fn close(&self) -> Result<()>;
}

/// A stage that produces items.
///
/// # Example
///
/// ```rust
/// use flowgraph::element::{Source, SourceBase, Stage};
/// use flowgraph::item::{FlowItem, PadId};
/// use flowgraph::stream::CloningStream;
/// use flowgraph::Result;
/// use std::collections::BTreeMap;
///
/// struct Counter {
///     base: SourceBase<u64, &'static str>,
/// }
///
/// #[async_trait::async_trait]
/// impl Stage for Counter {
///     async fn close(&self) -> Result<()> {
///         self.base.close();
///         Ok(())
///     }
/// }
///
/// impl Source<u64, &'static str> for Counter {
///     fn output_metadata(&self) -> BTreeMap<PadId, &'static str> {
///         self.base.output_metadata()
///     }
///
///     fn stream(&self) -> &CloningStream<FlowItem<u64, &'static str>> {
///         self.base.stream()
///     }
/// }
/// ```
pub trait Source<T: Reference, P: Metadata>: Stage {
    /// Metadata of every output pad.
    fn output_metadata(&self) -> BTreeMap<PadId, P>;

    /// The stream this source publishes on.
    fn stream(&self) -> &CloningStream<FlowItem<T, P>>;
}

/// A stage that consumes items.
#[async_trait]
pub trait Sink<T: Reference, P: Metadata>: Stage {
    /// Metadata of every known input pad; `None` for a pad that is declared
    /// but not configured yet.
    fn input_metadata(&self) -> BTreeMap<PadId, Option<P>>;

    /// Configured metadata of one input pad.
    ///
    /// The default looks the pad up in [`input_metadata`](Self::input_metadata);
    /// override it when that map is expensive to build.
    fn configured_metadata(&self, pad: PadId) -> Option<P> {
        self.input_metadata().remove(&pad).flatten()
    }

    /// Configure an input pad.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the pad is already configured,
    /// not supported, or the metadata is unacceptable.
    fn configure(&self, pad: PadId, metadata: P) -> Result<()>;

    /// Consume an item that already passed the pad checks.
    ///
    /// The sink owns `item` and must close it (or keep it and close it later).
    async fn submit(&self, cx: &LockContext, item: FlowItem<T, P>) -> Result<()>;

    /// Check an item against the input pad configuration, then
    /// [`submit`](Self::submit) it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ContractViolation`] when the item's pad is not
    /// configured or its metadata differs from the configured metadata. The
    /// item is closed in that case.
    async fn accept(&self, cx: &LockContext, item: FlowItem<T, P>) -> Result<()> {
        let pad = item.pad();
        let violation = match self.configured_metadata(pad) {
            None => Some("pad not configured"),
            Some(expected) => {
                let mismatch = &expected != item.metadata();
                if mismatch {
                    tracing::error!(
                        pad,
                        expected = ?expected,
                        actual = ?item.metadata(),
                        "metadata mismatch"
                    );
                }
                expected.close();
                mismatch.then_some("metadata mismatch")
            }
        };

        match violation {
            Some(reason) => {
                tracing::error!(pad, reason, "item rejected");
                item.close();
                Err(Error::contract_violation(pad, reason))
            }
            None => self.submit(cx, item).await,
        }
    }
}

/// A stage that is both a [`Sink`] and a [`Source`].
pub trait Transformer<IT: Reference, IP: Metadata, OT: Reference, OP: Metadata>:
    Sink<IT, IP> + Source<OT, OP>
{
}

impl<IT, IP, OT, OP, X> Transformer<IT, IP, OT, OP> for X
where
    IT: Reference,
    IP: Metadata,
    OT: Reference,
    OP: Metadata,
    X: Sink<IT, IP> + Source<OT, OP>,
{
}
