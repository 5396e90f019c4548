//! Error types for flowgraph.

use crate::item::PadId;
use thiserror::Error;

/// Result type alias using flowgraph's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Role a graph element was registered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementRole {
    /// Produces items only.
    Source,
    /// Consumes items only.
    Sink,
    /// Consumes and produces items.
    Transformer,
}

impl std::fmt::Display for ElementRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementRole::Source => f.write_str("source"),
            ElementRole::Sink => f.write_str("sink"),
            ElementRole::Transformer => f.write_str("transformer"),
        }
    }
}

/// Main error type for flowgraph operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A sink refused a pad configuration (pad already configured,
    /// unsupported pad, unacceptable metadata).
    #[error("pad {pad} configuration rejected: {reason}")]
    Configuration {
        /// The input pad being configured.
        pad: PadId,
        /// Why the sink refused.
        reason: String,
    },

    /// An item reached a sink that was not wired to receive it.
    ///
    /// This signals a wiring bug, not a data condition.
    #[error("contract violation on pad {pad}: {reason}")]
    ContractViolation {
        /// Pad the offending item was tagged with.
        pad: PadId,
        /// What was violated.
        reason: String,
    },

    /// Connecting two elements failed.
    #[error("cannot connect {source_name}:{source_pad} -> {sink_name}:{sink_pad}: {cause}")]
    Wiring {
        /// Name of the upstream element.
        source_name: String,
        /// Output pad of the upstream element.
        source_pad: PadId,
        /// Name of the downstream element.
        sink_name: String,
        /// Input pad of the downstream element.
        sink_pad: PadId,
        /// Underlying failure.
        #[source]
        cause: Box<Error>,
    },

    /// A connection would close a cycle in the graph.
    #[error("connecting {source_name} -> {sink_name} would create a cycle")]
    Cycle {
        /// Name of the upstream element.
        source_name: String,
        /// Name of the downstream element.
        sink_name: String,
    },

    /// No element with this name is registered.
    #[error("element '{0}' not found")]
    ElementNotFound(String),

    /// The element exists but was registered with another role.
    #[error("element '{name}' is a {actual}, not a {expected}")]
    WrongRole {
        /// Element name.
        name: String,
        /// Role asked for.
        expected: ElementRole,
        /// Role it was registered with.
        actual: ElementRole,
    },

    /// The element exists with the right role but a different implementation type.
    #[error("element '{name}' is not a {expected}")]
    ElementTypeMismatch {
        /// Element name.
        name: String,
        /// Type name asked for.
        expected: &'static str,
    },

    /// An element with this name is already registered.
    #[error("element '{0}' already exists")]
    DuplicateElement(String),

    /// The underlying resource has already been released.
    #[error("resource already released")]
    Released,

    /// Buffer pool has no free slots.
    #[error("buffer pool exhausted: no slots available")]
    PoolExhausted,

    /// Data does not fit into a pool slot.
    #[error("{len} bytes exceed slot size of {slot_size} bytes")]
    SlotOverflow {
        /// Requested length.
        len: usize,
        /// Slot capacity.
        slot_size: usize,
    },

    /// A background task failed or panicked.
    #[error("task '{name}' failed: {reason}")]
    Task {
        /// Task or element name.
        name: String,
        /// Failure description.
        reason: String,
    },

    /// The stream or element is closed.
    #[error("closed")]
    Closed,

    /// Waiting for graph finalization took too long.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Stage-specific failure.
    #[error("element error: {0}")]
    Element(String),
}

impl Error {
    /// Shorthand for a configuration rejection.
    pub fn configuration(pad: PadId, reason: impl Into<String>) -> Self {
        Error::Configuration {
            pad,
            reason: reason.into(),
        }
    }

    /// Shorthand for a contract violation.
    pub fn contract_violation(pad: PadId, reason: impl Into<String>) -> Self {
        Error::ContractViolation {
            pad,
            reason: reason.into(),
        }
    }

    /// Whether this error is (or wraps) a contract violation.
    pub fn is_contract_violation(&self) -> bool {
        match self {
            Error::ContractViolation { .. } => true,
            Error::Wiring { cause, .. } => cause.is_contract_violation(),
            _ => false,
        }
    }
}
