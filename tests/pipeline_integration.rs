//! End-to-end pipeline tests.
//!
//! These tests wire real graphs out of the built-in elements and a job
//! transformer, then check ordering, pad routing and that pooled payloads
//! all find their way back to the pool.

use async_trait::async_trait;
use flowgraph::element::{ExpectedPads, Job, JobContext, JobQueue, JobTransformer, Sink, Source};
use flowgraph::elements::{BufferSink, BufferSource};
use flowgraph::item::FlowItem;
use flowgraph::memory::{BufferPool, PooledBuffer};
use flowgraph::pipeline::{Graph, GraphConfig, GraphEvent};
use flowgraph::reference::Reference;
use flowgraph::{Error, Result};
use std::collections::BTreeMap;

// ============================================================================
// Helpers
// ============================================================================

fn encode(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

fn decode(buf: &PooledBuffer) -> u64 {
    let data = buf.data();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[..8]);
    u64::from_le_bytes(raw)
}

/// Doubles the number carried in each pooled buffer.
struct Doubler {
    pool: BufferPool,
    queue: JobQueue<FlowItem<PooledBuffer, &'static str>>,
}

impl Doubler {
    fn new(pool: &BufferPool) -> Self {
        Self {
            pool: pool.clone(),
            queue: JobQueue::new(16),
        }
    }
}

#[async_trait]
impl Job for Doubler {
    type In = PooledBuffer;
    type InMeta = &'static str;
    type Out = PooledBuffer;
    type OutMeta = &'static str;

    fn output_metadata(&self, _input: &&'static str) -> &'static str {
        "doubled"
    }

    async fn submit(&self, item: FlowItem<PooledBuffer, &'static str>) -> Result<()> {
        self.queue.push(item).await
    }

    async fn run(&self, cx: JobContext<PooledBuffer, &'static str>) -> Result<()> {
        while let Some(item) = self.queue.next().await {
            let (pad, _, input) = item.into_parts();
            let doubled = decode(&input) * 2;
            input.close();

            let output = self.pool.loan(&encode(doubled))?;
            match cx.item(pad, output) {
                Some(out) => cx.publish(out).await?,
                None => return Err(Error::contract_violation(pad, "output pad missing")),
            }
        }
        Ok(())
    }

    async fn finish_input(&self) {
        self.queue.finish();
    }

    async fn abandon_input(&self) {
        self.queue.close();
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Linear Pipelines
// ============================================================================

/// Source -> doubling job -> sink, with pooled payloads end to end.
#[tokio::test]
async fn test_doubling_pipeline_preserves_order_and_releases_buffers() {
    init_tracing();
    let pool = BufferPool::new(8, 256);

    let mut graph = Graph::new(GraphConfig::new("doubling"));
    let source = graph
        .add_source("numbers", BufferSource::new([(0, "number")]))
        .unwrap();
    let doubler = graph
        .add_transformer(
            "doubler",
            JobTransformer::new("doubler", Doubler::new(&pool), ExpectedPads::default()),
        )
        .unwrap();
    let sink = graph
        .add_sink("collect", BufferSink::<PooledBuffer, &'static str>::new())
        .unwrap();

    graph.connect(&source, &doubler).unwrap();
    graph.connect(&doubler, &sink).unwrap();
    graph.finalize().await.unwrap();
    assert!(doubler.is_running());
    assert_eq!(doubler.output_metadata().get(&0), Some(&"doubled"));

    for n in 0..=100u64 {
        let buf = pool.loan(&encode(n)).unwrap();
        source.submit(0, buf).await.unwrap();
    }

    let received = {
        sink.wait_for(0, 101).await;
        sink.take(0)
    };
    let values: Vec<u64> = received.iter().map(|item| decode(item.value())).collect();
    assert_eq!(values, (0..=100).map(|n| n * 2).collect::<Vec<_>>());
    assert!(received.iter().all(|item| *item.metadata() == "doubled"));
    for item in received {
        item.close();
    }

    graph.close().await.unwrap();
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.loans(), pool.releases());
    assert_eq!(pool.loans(), 202);
}

/// Items still held by a sink are released when the graph closes.
#[tokio::test]
async fn test_close_releases_items_held_by_sinks() {
    let pool = BufferPool::new(8, 16);

    let mut graph = Graph::new(GraphConfig::new("held"));
    let source = graph
        .add_source("numbers", BufferSource::new([(0, ())]))
        .unwrap();
    let sink = graph
        .add_sink("hold", BufferSink::<PooledBuffer, ()>::new())
        .unwrap();
    graph.connect(&source, &sink).unwrap();
    graph.finalize().await.unwrap();

    for n in 0..10u64 {
        source.submit(0, pool.loan(&encode(n)).unwrap()).await.unwrap();
    }
    assert_eq!(sink.count(0), 10);
    assert_eq!(pool.outstanding(), 10);

    graph.close().await.unwrap();
    assert_eq!(pool.outstanding(), 0);
}

// ============================================================================
// Pad Routing
// ============================================================================

/// A selector can move a source pad onto a different sink pad.
#[tokio::test]
async fn test_pad_remap() {
    let mut graph = Graph::new(GraphConfig::new("remap"));
    let source = graph
        .add_source("source", BufferSource::new([(0, "left")]))
        .unwrap();
    let sink = graph
        .add_sink("sink", BufferSink::<u64, &'static str>::new())
        .unwrap();

    graph
        .connect_with(&source, &sink, |_, _, pad, _| (pad == 0).then_some(1))
        .unwrap();
    graph.finalize().await.unwrap();

    assert_eq!(sink.configured_metadata(1), Some("left"));
    assert_eq!(sink.configured_metadata(0), None);

    for n in 0..5 {
        source.submit(0, n).await.unwrap();
    }
    assert_eq!(sink.values(1), vec![0, 1, 2, 3, 4]);
    assert_eq!(sink.count(0), 0);

    let connections = graph.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].2.get(&0), Some(&1));

    graph.close().await.unwrap();
}

/// Pads the selector skips are never delivered to the sink.
#[tokio::test]
async fn test_unselected_pads_are_dropped() {
    let mut graph = Graph::new(GraphConfig::new("partial"));
    let source = graph
        .add_source("source", BufferSource::new([(0, 'a'), (1, 'b')]))
        .unwrap();
    let sink = graph
        .add_sink("sink", BufferSink::<u32, char>::new())
        .unwrap();

    graph
        .connect_with(&source, &sink, |_, _, pad, _| (pad == 1).then_some(pad))
        .unwrap();
    graph.finalize().await.unwrap();

    source.submit(0, 10).await.unwrap();
    source.submit(1, 11).await.unwrap();
    source.submit(0, 12).await.unwrap();

    assert_eq!(sink.received(), BTreeMap::from([(1, 1)]));
    assert_eq!(sink.values(1), vec![11]);
    graph.close().await.unwrap();
}

/// Two sources feed a job that waits for both of its input pads.
#[tokio::test]
async fn test_job_waits_for_every_input_pad() {
    let pool = BufferPool::new(8, 64);

    let mut graph = Graph::new(GraphConfig::new("merge"));
    let left = graph
        .add_source("left", BufferSource::new([(0, "l")]))
        .unwrap();
    let right = graph
        .add_source("right", BufferSource::new([(0, "r")]))
        .unwrap();
    let doubler = graph
        .add_transformer(
            "doubler",
            JobTransformer::new("doubler", Doubler::new(&pool), ExpectedPads::only([0, 1])),
        )
        .unwrap();
    let sink = graph
        .add_sink("sink", BufferSink::<PooledBuffer, &'static str>::new())
        .unwrap();

    graph.connect(&left, &doubler).unwrap();
    assert!(!doubler.is_running());
    graph
        .connect_with(&right, &doubler, |_, _, _, _| Some(1))
        .unwrap();
    assert!(doubler.is_running());
    graph.connect(&doubler, &sink).unwrap();
    graph.finalize().await.unwrap();

    left.submit(0, pool.loan(&encode(1)).unwrap()).await.unwrap();
    right.submit(0, pool.loan(&encode(5)).unwrap()).await.unwrap();
    sink.wait_for(0, 1).await;
    sink.wait_for(1, 1).await;

    let on_left: Vec<u64> = sink.take(0).iter().map(|i| decode(i.value())).collect();
    let on_right: Vec<u64> = sink.take(1).iter().map(|i| decode(i.value())).collect();
    assert_eq!(on_left, vec![2]);
    assert_eq!(on_right, vec![10]);

    graph.close().await.unwrap();
    assert_eq!(pool.outstanding(), 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

/// The event stream reports wiring and shutdown in order.
#[tokio::test]
async fn test_event_stream_reports_lifecycle() {
    let mut graph = Graph::new(GraphConfig::new("events"));
    let mut events = graph.subscribe_events();

    let source = graph
        .add_source("source", BufferSource::new([(0, ())]))
        .unwrap();
    let sink = graph.add_sink("sink", BufferSink::<u8, ()>::new()).unwrap();
    graph.connect(&source, &sink).unwrap();
    graph.finalize().await.unwrap();
    graph.close().await.unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(GraphEvent::ElementAdded { .. })));
    assert!(seen.iter().any(|e| matches!(e, GraphEvent::Finalized { connections: 1 })));
    assert_eq!(seen.last(), Some(&GraphEvent::Closed));
}

/// Publishing after the graph closed fails instead of silently dropping.
#[tokio::test]
async fn test_submit_after_close_fails() {
    let mut graph = Graph::new(GraphConfig::new("closed"));
    let source = graph
        .add_source("source", BufferSource::new([(0, ())]))
        .unwrap();
    let sink = graph.add_sink("sink", BufferSink::<u8, ()>::new()).unwrap();
    graph.connect(&source, &sink).unwrap();
    graph.finalize().await.unwrap();
    graph.close().await.unwrap();

    assert!(matches!(source.submit(0, 1).await, Err(Error::Closed)));
    assert!(source.stream().is_closed());
}
