//! Pad metadata tables.
//!
//! Every stage keeps one table for its input pads and one for its output
//! pads. Pad ids are scoped per table, so input pad 0 and output pad 0 are
//! unrelated.

use crate::error::{Error, Result};
use crate::item::PadId;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Direction of a pad (input or output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    /// An input pad (receives items from upstream).
    Input,
    /// An output pad (publishes items downstream).
    Output,
}

impl std::fmt::Display for PadDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PadDirection::Input => f.write_str("input"),
            PadDirection::Output => f.write_str("output"),
        }
    }
}

/// Concurrency-safe `PadId -> metadata` table.
#[derive(Debug)]
pub struct PadMetadata<P> {
    direction: PadDirection,
    pads: RwLock<BTreeMap<PadId, P>>,
}

impl<P: Clone> PadMetadata<P> {
    /// Create an empty table.
    pub fn new(direction: PadDirection) -> Self {
        Self {
            direction,
            pads: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create an empty input table.
    pub fn inputs() -> Self {
        Self::new(PadDirection::Input)
    }

    /// Create an empty output table.
    pub fn outputs() -> Self {
        Self::new(PadDirection::Output)
    }

    /// Create a table with fixed pads.
    pub fn with_pads(direction: PadDirection, pads: impl IntoIterator<Item = (PadId, P)>) -> Self {
        Self {
            direction,
            pads: RwLock::new(pads.into_iter().collect()),
        }
    }

    /// Direction of the pads in this table.
    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    /// Metadata of one pad.
    pub fn get(&self, pad: PadId) -> Option<P> {
        self.pads.read().get(&pad).cloned()
    }

    /// Whether `pad` has metadata.
    pub fn contains(&self, pad: PadId) -> bool {
        self.pads.read().contains_key(&pad)
    }

    /// Set a pad's metadata, replacing any previous value.
    pub fn set(&self, pad: PadId, metadata: P) -> Option<P> {
        self.pads.write().insert(pad, metadata)
    }

    /// Set a pad's metadata unless it already has some.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the pad is already configured.
    pub fn insert_new(&self, pad: PadId, metadata: P) -> Result<()> {
        let mut pads = self.pads.write();
        if pads.contains_key(&pad) {
            return Err(Error::configuration(
                pad,
                format!("{} pad already configured", self.direction),
            ));
        }
        pads.insert(pad, metadata);
        Ok(())
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> BTreeMap<PadId, P> {
        self.pads.read().clone()
    }

    /// Configured pad ids, ascending.
    pub fn pads(&self) -> Vec<PadId> {
        self.pads.read().keys().copied().collect()
    }

    /// Number of configured pads.
    pub fn len(&self) -> usize {
        self.pads.read().len()
    }

    /// Whether no pad is configured.
    pub fn is_empty(&self) -> bool {
        self.pads.read().is_empty()
    }
}
