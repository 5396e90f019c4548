//! Graph registry and wiring, with daggy keeping the topology acyclic.

use super::events::{EventReceiver, EventSender, GraphEvent};
use crate::element::{Metadata, Sink, Source, Stage, Transformer};
use crate::error::{ElementRole, Error, Result};
use crate::item::{FlowItem, PadId};
use crate::observability::{
    TracingConfig, trace_delivery_error, trace_item_dropped, trace_item_forwarded,
    trace_pad_mapped, trace_pad_skipped,
};
use crate::reference::Reference;
use crate::stream::Subscriber;
use crate::sync::LockContext;
use async_trait::async_trait;
use daggy::{Dag, EdgeIndex, NodeIndex};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Source pad to sink pad mapping of one connection.
pub type PadMap = BTreeMap<PadId, PadId>;

/// Configuration for a [`Graph`].
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Name used in logs and spans.
    pub name: String,
    /// Upper bound for [`Graph::finalize`]; `None` waits forever.
    pub finalize_timeout: Option<Duration>,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Which spans to create.
    pub tracing: TracingConfig,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: "graph".to_string(),
            finalize_timeout: Some(Duration::from_secs(5)),
            event_capacity: 256,
            tracing: TracingConfig::default(),
        }
    }
}

impl GraphConfig {
    /// Default configuration with a custom name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the finalize timeout.
    pub fn with_finalize_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the span configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}

/// Typed handle to an element registered in a [`Graph`].
///
/// Dereferences to the element.
pub struct ElementHandle<E> {
    name: String,
    role: ElementRole,
    element: Arc<E>,
}

impl<E> ElementHandle<E> {
    /// Name the element was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role the element was registered with.
    pub fn role(&self) -> ElementRole {
        self.role
    }

    /// Shared pointer to the element.
    pub fn arc(&self) -> &Arc<E> {
        &self.element
    }
}

impl<E> Clone for ElementHandle<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            role: self.role,
            element: Arc::clone(&self.element),
        }
    }
}

impl<E> Deref for ElementHandle<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.element
    }
}

impl<E> std::fmt::Debug for ElementHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementHandle")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish()
    }
}

struct Entry {
    name: String,
    role: ElementRole,
    node: NodeIndex,
    stage: Arc<dyn Stage>,
    handle: Box<dyn Any + Send + Sync>,
}

struct Connection {
    source: String,
    sink: String,
    started: Option<oneshot::Receiver<()>>,
    task: Option<JoinHandle<()>>,
}

/// Forwards one source's items to one sink, remapping pads.
struct Forward<T, P, K> {
    sink: Arc<K>,
    mapping: PadMap,
    source_name: String,
    sink_name: String,
    events: EventSender,
    _marker: PhantomData<fn() -> (T, P)>,
}

#[async_trait]
impl<T, P, K> Subscriber<FlowItem<T, P>> for Forward<T, P, K>
where
    T: Reference,
    P: Metadata,
    K: Sink<T, P>,
{
    async fn deliver(&self, cx: &LockContext, item: FlowItem<T, P>) -> Result<()> {
        let source_pad = item.pad();
        let Some(&sink_pad) = self.mapping.get(&source_pad) else {
            trace_item_dropped(source_pad);
            item.close();
            return Ok(());
        };

        trace_item_forwarded(source_pad, sink_pad);
        let result = self.sink.accept(cx, item.with_pad(sink_pad)).await;
        if let Err(e) = &result {
            trace_delivery_error(&self.source_name, &self.sink_name, e);
            self.events
                .send_error(e.to_string(), Some(self.sink_name.clone()));
        }
        result
    }
}

/// A set of named stages and the connections between them.
///
/// # Lifecycle
///
/// 1. Register stages with [`add_source`](Self::add_source),
///    [`add_sink`](Self::add_sink) and [`add_transformer`](Self::add_transformer).
/// 2. Wire them with [`connect`](Self::connect) or
///    [`connect_with`](Self::connect_with).
/// 3. Call [`finalize`](Self::finalize); producers start publishing after it
///    returns.
/// 4. [`close`](Self::close) stops every connection and closes every stage.
///
/// # Example
///
/// ```rust
/// use flowgraph::elements::{BufferSink, BufferSource};
/// use flowgraph::pipeline::{Graph, GraphConfig};
///
/// # #[tokio::main]
/// # async fn main() -> flowgraph::Result<()> {
/// let mut graph = Graph::new(GraphConfig::new("example"));
/// let source = graph.add_source("numbers", BufferSource::new([(0, "int")]))?;
/// let sink = graph.add_sink("collect", BufferSink::<u32, &str>::new())?;
///
/// // Source pad 0 feeds sink pad 1.
/// graph.connect_with(&source, &sink, |_, _, pad, _| Some(pad + 1))?;
/// graph.finalize().await?;
///
/// source.submit(0, 42).await?;
/// sink.wait_for(1, 1).await;
/// assert_eq!(sink.values(1), vec![42]);
///
/// graph.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Graph {
    config: GraphConfig,
    dag: Dag<String, PadMap>,
    elements: Vec<Entry>,
    by_name: HashMap<String, usize>,
    connections: Vec<Connection>,
    cancel: CancellationToken,
    events: EventSender,
    finalized: bool,
    closed: bool,
}

impl Graph {
    /// Create an empty graph.
    pub fn new(config: GraphConfig) -> Self {
        let events = EventSender::new(config.event_capacity);
        Self {
            config,
            dag: Dag::new(),
            elements: Vec::new(),
            by_name: HashMap::new(),
            connections: Vec::new(),
            cancel: CancellationToken::new(),
            events,
            finalized: false,
            closed: false,
        }
    }

    /// Create a graph, let `wire` register and connect stages, then
    /// [`finalize`](Self::finalize) it.
    ///
    /// The graph is closed again if wiring or finalizing fails.
    pub async fn build<F>(config: GraphConfig, wire: F) -> Result<Self>
    where
        F: FnOnce(&mut Graph) -> Result<()>,
    {
        let mut graph = Graph::new(config);
        let result = match wire(&mut graph) {
            Ok(()) => graph.finalize().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(graph),
            Err(e) => {
                let _ = graph.close().await;
                Err(e)
            }
        }
    }

    /// The graph's configuration.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Receive graph events from now on.
    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Register a source.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateElement`] when the name is taken.
    pub fn add_source<T, P, S>(
        &mut self,
        name: impl Into<String>,
        source: S,
    ) -> Result<ElementHandle<S>>
    where
        T: Reference,
        P: Metadata,
        S: Source<T, P>,
    {
        self.register(name.into(), ElementRole::Source, source)
    }

    /// Register a sink.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateElement`] when the name is taken.
    pub fn add_sink<T, P, S>(&mut self, name: impl Into<String>, sink: S) -> Result<ElementHandle<S>>
    where
        T: Reference,
        P: Metadata,
        S: Sink<T, P>,
    {
        self.register(name.into(), ElementRole::Sink, sink)
    }

    /// Register a transformer.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateElement`] when the name is taken.
    pub fn add_transformer<IT, IP, OT, OP, X>(
        &mut self,
        name: impl Into<String>,
        transformer: X,
    ) -> Result<ElementHandle<X>>
    where
        IT: Reference,
        IP: Metadata,
        OT: Reference,
        OP: Metadata,
        X: Transformer<IT, IP, OT, OP>,
    {
        self.register(name.into(), ElementRole::Transformer, transformer)
    }

    fn register<E: Stage>(
        &mut self,
        name: String,
        role: ElementRole,
        element: E,
    ) -> Result<ElementHandle<E>> {
        if self.closed {
            return Err(Error::Closed);
        }
        if self.by_name.contains_key(&name) {
            return Err(Error::DuplicateElement(name));
        }

        let element = Arc::new(element);
        let node = self.dag.add_node(name.clone());
        self.by_name.insert(name.clone(), self.elements.len());
        self.elements.push(Entry {
            name: name.clone(),
            role,
            node,
            stage: Arc::clone(&element) as Arc<dyn Stage>,
            handle: Box::new(Arc::clone(&element)),
        });

        tracing::debug!(graph = %self.config.name, element = %name, role = %role, "element added");
        self.events.send(GraphEvent::ElementAdded {
            name: name.clone(),
            role,
        });
        Ok(ElementHandle {
            name,
            role,
            element,
        })
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.by_name
            .get(name)
            .map(|&i| &self.elements[i])
            .ok_or_else(|| Error::ElementNotFound(name.to_string()))
    }

    /// The entry `handle` was issued for. A handle from another graph fails
    /// even when an element here has the same name.
    fn registered<E: Send + Sync + 'static>(&self, handle: &ElementHandle<E>) -> Result<&Entry> {
        let entry = self.entry(handle.name())?;
        match entry.handle.downcast_ref::<Arc<E>>() {
            Some(element) if Arc::ptr_eq(element, handle.arc()) => Ok(entry),
            _ => Err(Error::ElementNotFound(handle.name().to_string())),
        }
    }

    fn lookup<E: Send + Sync + 'static>(
        &self,
        name: &str,
        role: ElementRole,
    ) -> Result<ElementHandle<E>> {
        let entry = self.entry(name)?;
        if entry.role != role {
            return Err(Error::WrongRole {
                name: name.to_string(),
                expected: role,
                actual: entry.role,
            });
        }
        let element = entry.handle.downcast_ref::<Arc<E>>().ok_or_else(|| {
            Error::ElementTypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<E>(),
            }
        })?;
        Ok(ElementHandle {
            name: entry.name.clone(),
            role,
            element: Arc::clone(element),
        })
    }

    /// Look up a source by name.
    ///
    /// # Errors
    ///
    /// [`Error::ElementNotFound`], [`Error::WrongRole`] when the element is
    /// not registered as a source, [`Error::ElementTypeMismatch`] when it is
    /// not an `E`.
    pub fn source<E: Send + Sync + 'static>(&self, name: &str) -> Result<ElementHandle<E>> {
        self.lookup(name, ElementRole::Source)
    }

    /// Look up a sink by name. Fails like [`source`](Self::source).
    pub fn sink<E: Send + Sync + 'static>(&self, name: &str) -> Result<ElementHandle<E>> {
        self.lookup(name, ElementRole::Sink)
    }

    /// Look up a transformer by name. Fails like [`source`](Self::source).
    pub fn transformer<E: Send + Sync + 'static>(&self, name: &str) -> Result<ElementHandle<E>> {
        self.lookup(name, ElementRole::Transformer)
    }

    /// Role of a registered element.
    pub fn role_of(&self, name: &str) -> Option<ElementRole> {
        self.entry(name).ok().map(|e| e.role)
    }

    /// Names of all elements, in registration order.
    pub fn element_names(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.name.as_str()).collect()
    }

    /// Number of registered elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether no element is registered.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All connections as `(source, sink, pad map)`.
    pub fn connections(&self) -> Vec<(&str, &str, &PadMap)> {
        self.dag
            .raw_edges()
            .iter()
            .map(|edge| {
                (
                    self.dag[edge.source()].as_str(),
                    self.dag[edge.target()].as_str(),
                    &edge.weight,
                )
            })
            .collect()
    }

    /// Connect `source` to `sink`, output pad `n` feeding input pad `n`.
    pub fn connect<T, P, A, B>(
        &mut self,
        source: &ElementHandle<A>,
        sink: &ElementHandle<B>,
    ) -> Result<()>
    where
        T: Reference,
        P: Metadata,
        A: Source<T, P>,
        B: Sink<T, P>,
    {
        self.connect_with(source, sink, |_, _, pad, _| Some(pad))
    }

    /// Connect `source` to `sink` with a pad selector.
    ///
    /// For each output pad of `source`, in ascending order, `selector` gets
    /// the mapping built so far, all output pads with their metadata, the pad
    /// and its metadata, and returns the sink pad to feed or `None` to leave
    /// the pad unconnected. Every selected sink pad is configured with the
    /// source pad's metadata, then a connection task starts forwarding.
    ///
    /// Registration on the source stream is complete when this returns.
    ///
    /// # Errors
    ///
    /// - [`Error::Cycle`] when the connection would close a cycle.
    /// - [`Error::Wiring`] when the sink refuses a pad configuration. Pads
    ///   configured before the failing one stay configured.
    /// - [`Error::ElementNotFound`] when a handle was not issued by this graph.
    /// - [`Error::Task`] outside a Tokio runtime.
    pub fn connect_with<T, P, A, B, F>(
        &mut self,
        source: &ElementHandle<A>,
        sink: &ElementHandle<B>,
        mut selector: F,
    ) -> Result<()>
    where
        T: Reference,
        P: Metadata,
        A: Source<T, P>,
        B: Sink<T, P>,
        F: FnMut(&PadMap, &BTreeMap<PadId, P>, PadId, &P) -> Option<PadId>,
    {
        if self.closed {
            return Err(Error::Closed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::Task {
            name: self.config.name.clone(),
            reason: e.to_string(),
        })?;
        let source_node = self.registered(source)?.node;
        let sink_node = self.registered(sink)?.node;

        let edge = self
            .dag
            .add_edge(source_node, sink_node, PadMap::new())
            .map_err(|_| Error::Cycle {
                source_name: source.name().to_string(),
                sink_name: sink.name().to_string(),
            })?;

        let metadata = source.output_metadata();
        let mut mapping = PadMap::new();
        for (&pad, meta) in &metadata {
            match selector(&mapping, &metadata, pad, meta) {
                Some(sink_pad) => {
                    mapping.insert(pad, sink_pad);
                }
                None => trace_pad_skipped(source.name(), pad, sink.name()),
            }
        }

        if let Err(e) = self.configure_pads(source, sink, &metadata, &mapping) {
            self.dag.remove_edge(edge);
            return Err(e);
        }
        self.record_mapping(edge, &mapping);

        let forward = Forward {
            sink: Arc::clone(sink.arc()),
            mapping: mapping.clone(),
            source_name: source.name().to_string(),
            sink_name: sink.name().to_string(),
            events: self.events.clone(),
            _marker: PhantomData,
        };
        let subscription = source.stream().register(forward);

        let (started_tx, started_rx) = oneshot::channel();
        let cancel = self.cancel.clone();
        let events = self.events.clone();
        let source_name = source.name().to_string();
        let sink_name = sink.name().to_string();
        let span = self
            .config
            .tracing
            .connection(&self.config.name, &source_name, &sink_name);

        let task = {
            let source_name = source_name.clone();
            let sink_name = sink_name.clone();
            runtime.spawn(
                async move {
                    tracing::debug!("connection started");
                    events.send(GraphEvent::ConnectionStarted {
                        source: source_name.clone(),
                        sink: sink_name.clone(),
                    });
                    let _ = started_tx.send(());

                    tokio::select! {
                        _ = cancel.cancelled() => tracing::debug!("connection cancelled"),
                        _ = subscription.closed() => tracing::debug!("source stream closed"),
                    }
                    drop(subscription);

                    events.send(GraphEvent::ConnectionFinished {
                        source: source_name,
                        sink: sink_name,
                    });
                }
                .instrument(span),
            )
        };

        self.events.send(GraphEvent::Connected {
            source: source_name.clone(),
            sink: sink_name.clone(),
            pads: mapping.into_iter().collect(),
        });
        self.connections.push(Connection {
            source: source_name,
            sink: sink_name,
            started: Some(started_rx),
            task: Some(task),
        });
        Ok(())
    }

    fn configure_pads<T, P, A, B>(
        &self,
        source: &ElementHandle<A>,
        sink: &ElementHandle<B>,
        metadata: &BTreeMap<PadId, P>,
        mapping: &PadMap,
    ) -> Result<()>
    where
        T: Reference,
        P: Metadata,
        A: Source<T, P>,
        B: Sink<T, P>,
    {
        for (source_pad, &sink_pad) in mapping {
            let Some(meta) = metadata.get(source_pad) else {
                continue;
            };
            sink.configure(sink_pad, meta.clone())
                .map_err(|cause| Error::Wiring {
                    source_name: source.name().to_string(),
                    source_pad: *source_pad,
                    sink_name: sink.name().to_string(),
                    sink_pad,
                    cause: Box::new(cause),
                })?;
            trace_pad_mapped(source.name(), *source_pad, sink.name(), sink_pad);
        }
        Ok(())
    }

    fn record_mapping(&mut self, edge: EdgeIndex, mapping: &PadMap) {
        if let Some(weight) = self.dag.edge_weight_mut(edge) {
            weight.clone_from(mapping);
        }
    }

    /// Wait until every connection task has started.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] after [`GraphConfig::finalize_timeout`],
    /// [`Error::Task`] when a connection task died before starting.
    pub async fn finalize(&mut self) -> Result<()> {
        let span = self.config.tracing.graph(&self.config.name);
        self.finalize_connections().instrument(span).await
    }

    async fn finalize_connections(&mut self) -> Result<()> {
        let pending: Vec<_> = self
            .connections
            .iter_mut()
            .filter_map(|c| c.started.take())
            .collect();
        let all_started = futures::future::join_all(pending);

        let results = match self.config.finalize_timeout {
            Some(limit) => tokio::time::timeout(limit, all_started)
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => all_started.await,
        };
        if results.iter().any(|r| r.is_err()) {
            return Err(Error::Task {
                name: self.config.name.clone(),
                reason: "connection task ended before starting".to_string(),
            });
        }

        self.finalized = true;
        tracing::info!(
            graph = %self.config.name,
            elements = self.elements.len(),
            connections = self.connections.len(),
            "graph finalized"
        );
        self.events.send(GraphEvent::Finalized {
            connections: self.connections.len(),
        });
        Ok(())
    }

    /// Whether [`finalize`](Self::finalize) succeeded.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop every connection, then close every element in registration
    /// order.
    ///
    /// All elements are closed even if some fail; the first failure is
    /// returned. Calling this again has no effect.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let span = self.config.tracing.graph(&self.config.name);
        self.shutdown().instrument(span).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        self.cancel.cancel();

        let mut first_error = None;
        for connection in &mut self.connections {
            let Some(task) = connection.task.take() else {
                continue;
            };
            if let Err(e) = task.await {
                first_error.get_or_insert(Error::Task {
                    name: format!("{} -> {}", connection.source, connection.sink),
                    reason: e.to_string(),
                });
            }
        }

        for entry in &self.elements {
            let span = self.config.tracing.element(
                &self.config.name,
                &entry.name,
                &entry.role.to_string(),
            );
            if let Err(e) = entry.stage.close().instrument(span).await {
                tracing::warn!(element = %entry.name, error = %e, "element close failed");
                self.events.send_error(e.to_string(), Some(entry.name.clone()));
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(graph = %self.config.name, "graph closed");
        self.events.send(GraphEvent::Closed);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if !self.closed {
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.config.name)
            .field("elements", &self.element_names())
            .field("connections", &self.connections.len())
            .field("finalized", &self.finalized)
            .field("closed", &self.closed)
            .finish()
    }
}
