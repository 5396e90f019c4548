//! Tracing integration for graph wiring and item flow.

use crate::item::PadId;
use tracing::{Level, Span, span};

/// Which spans a graph creates.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Span around graph-wide operations (finalize, close).
    pub graph_spans: bool,
    /// Span around element lifecycle operations.
    pub element_spans: bool,
    /// Span around every connection task. Cheap, one per connection.
    pub connection_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            graph_spans: true,
            element_spans: true,
            connection_spans: true,
        }
    }
}

impl TracingConfig {
    /// Only graph spans.
    pub fn minimal() -> Self {
        Self {
            graph_spans: true,
            element_spans: false,
            connection_spans: false,
        }
    }

    /// No spans at all.
    pub fn none() -> Self {
        Self {
            graph_spans: false,
            element_spans: false,
            connection_spans: false,
        }
    }

    pub(crate) fn graph(&self, name: &str) -> Span {
        if self.graph_spans {
            span_graph(name)
        } else {
            Span::none()
        }
    }

    pub(crate) fn element(&self, graph: &str, element: &str, role: &str) -> Span {
        if self.element_spans {
            span_element(graph, element, role)
        } else {
            Span::none()
        }
    }

    pub(crate) fn connection(&self, graph: &str, source: &str, sink: &str) -> Span {
        if self.connection_spans {
            span_connection(graph, source, sink)
        } else {
            Span::none()
        }
    }
}

/// Create a span for a graph.
///
/// # Example
///
/// ```rust
/// use flowgraph::observability::span_graph;
///
/// let span = span_graph("decode");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_graph(name: &str) -> Span {
    span!(Level::INFO, "graph", graph = %name)
}

/// Create a span for one element.
#[inline]
pub fn span_element(graph: &str, element: &str, role: &str) -> Span {
    span!(
        Level::DEBUG,
        "element",
        graph = %graph,
        element = %element,
        role = %role
    )
}

/// Create a span for one connection task.
#[inline]
pub fn span_connection(graph: &str, source: &str, sink: &str) -> Span {
    span!(
        Level::DEBUG,
        "connection",
        graph = %graph,
        source = %source,
        sink = %sink
    )
}

/// Log a configured pad mapping.
#[inline]
pub fn trace_pad_mapped(source: &str, source_pad: PadId, sink: &str, sink_pad: PadId) {
    tracing::debug!(
        source = %source,
        source_pad,
        sink = %sink,
        sink_pad,
        "pad mapped"
    );
}

/// Log a source pad the selector left unconnected.
#[inline]
pub fn trace_pad_skipped(source: &str, source_pad: PadId, sink: &str) {
    tracing::debug!(
        source = %source,
        source_pad,
        sink = %sink,
        "pad not connected"
    );
}

/// Log an item forwarded by a connection.
#[inline]
pub fn trace_item_forwarded(source_pad: PadId, sink_pad: PadId) {
    tracing::trace!(source_pad, sink_pad, "item forwarded");
}

/// Log an item dropped because its pad is not mapped.
#[inline]
pub fn trace_item_dropped(source_pad: PadId) {
    tracing::warn!(source_pad, "item on unmapped pad dropped");
}

/// Log a failed delivery inside a connection task.
#[inline]
pub fn trace_delivery_error(source: &str, sink: &str, error: &dyn std::error::Error) {
    tracing::error!(
        source = %source,
        sink = %sink,
        error = %error,
        "delivery failed"
    );
}
