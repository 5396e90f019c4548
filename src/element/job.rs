//! Transformers driven by a background processing task.
//!
//! A [`JobTransformer`] collects input pad configurations until every
//! expected pad is configured, then spawns the [`Job`]'s processing task.
//! Items accepted on the input side are handed to the job, which typically
//! queues them (see [`JobQueue`]) for its task to consume.
//!
//! Closing the transformer tells the job that no more input will arrive and
//! then waits for the task to drain. Close never cancels the task; only
//! [`JobTransformer::abort`] does.

use super::base::SourceBase;
use super::pad::PadMetadata;
use super::traits::{Metadata, Sink, Source, Stage};
use crate::error::{Error, Result};
use crate::item::{FlowItem, PadId};
use crate::reference::Reference;
use crate::stream::CloningStream;
use crate::sync::LockContext;
use async_trait::async_trait;
use kanal::{AsyncReceiver, AsyncSender, bounded_async};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The processing logic of a [`JobTransformer`].
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Input value type.
    type In: Reference;
    /// Input pad metadata.
    type InMeta: Metadata;
    /// Output value type.
    type Out: Reference;
    /// Output pad metadata.
    type OutMeta: Metadata;

    /// Derive an output pad's metadata from the metadata of the input pad
    /// with the same id.
    fn output_metadata(&self, input: &Self::InMeta) -> Self::OutMeta;

    /// Take one input item. Called only after the task was started.
    async fn submit(&self, item: FlowItem<Self::In, Self::InMeta>) -> Result<()>;

    /// The processing task. Runs until the job decides it is done, usually
    /// when its input has ended.
    async fn run(&self, cx: JobContext<Self::Out, Self::OutMeta>) -> Result<()>;

    /// No more input will be submitted. The job must let [`run`](Self::run)
    /// finish after draining what it already holds. Must not wait on `run`.
    async fn finish_input(&self);

    /// [`run`](Self::run) has returned, so input it did not consume never
    /// will be. Jobs that queue input close the queue here (see
    /// [`JobQueue::close`]). Submits made after this fail with
    /// [`Error::Closed`].
    async fn abandon_input(&self) {}
}

/// What the processing task gets to work with.
pub struct JobContext<T: Reference, P: Metadata> {
    output: Arc<SourceBase<T, P>>,
    cancel: CancellationToken,
}

impl<T: Reference, P: Metadata> JobContext<T, P> {
    /// Publish an output item and close this handle to it.
    pub async fn publish(&self, item: FlowItem<T, P>) -> Result<()> {
        self.output.publish(item).await
    }

    /// Build an output item for `pad` carrying that pad's metadata.
    pub fn item(&self, pad: PadId, value: T) -> Option<FlowItem<T, P>> {
        self.output.item(pad, value)
    }

    /// Metadata of one output pad.
    pub fn output_metadata(&self, pad: PadId) -> Option<P> {
        self.output.metadata().get(pad)
    }

    /// Whether [`JobTransformer::abort`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when [`JobTransformer::abort`] is called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Which input pads a [`JobTransformer`] waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedPads {
    /// Exactly these pads; the task starts when all are configured.
    Only(BTreeSet<PadId>),
    /// Any pad; the task starts on the first configuration.
    Any,
}

impl ExpectedPads {
    /// Expect exactly `pads`.
    pub fn only(pads: impl IntoIterator<Item = PadId>) -> Self {
        ExpectedPads::Only(pads.into_iter().collect())
    }

    fn allows(&self, pad: PadId) -> bool {
        match self {
            ExpectedPads::Only(pads) => pads.contains(&pad),
            ExpectedPads::Any => true,
        }
    }

    fn satisfied_by(&self, configured: &[PadId]) -> bool {
        match self {
            ExpectedPads::Only(pads) => pads.iter().all(|p| configured.contains(p)),
            ExpectedPads::Any => !configured.is_empty(),
        }
    }
}

impl Default for ExpectedPads {
    /// A single input pad, 0.
    fn default() -> Self {
        ExpectedPads::only([0])
    }
}

/// A [`Transformer`](super::Transformer) whose output is produced by a
/// background [`Job`] task.
///
/// # Example
///
/// ```rust
/// use flowgraph::element::{ExpectedPads, Job, JobContext, JobQueue, JobTransformer, Sink, Stage};
/// use flowgraph::item::FlowItem;
/// use flowgraph::sync::LockContext;
/// use flowgraph::Result;
///
/// struct Doubler {
///     queue: JobQueue<FlowItem<u64, ()>>,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for Doubler {
///     type In = u64;
///     type InMeta = ();
///     type Out = u64;
///     type OutMeta = ();
///
///     fn output_metadata(&self, _input: &()) {}
///
///     async fn submit(&self, item: FlowItem<u64, ()>) -> Result<()> {
///         self.queue.push(item).await
///     }
///
///     async fn run(&self, cx: JobContext<u64, ()>) -> Result<()> {
///         while let Some(item) = self.queue.next().await {
///             let (pad, meta, value) = item.into_parts();
///             cx.publish(FlowItem::new(pad, meta, value * 2)).await?;
///         }
///         Ok(())
///     }
///
///     async fn finish_input(&self) {
///         self.queue.finish();
///     }
///
///     async fn abandon_input(&self) {
///         self.queue.close();
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let doubler = JobTransformer::new(
///     "doubler",
///     Doubler { queue: JobQueue::new(4) },
///     ExpectedPads::default(),
/// );
/// doubler.configure(0, ())?;
/// assert!(doubler.is_running());
/// doubler.accept(&LockContext::new(), FlowItem::new(0, (), 21)).await?;
/// doubler.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct JobTransformer<J: Job> {
    name: String,
    job: Arc<J>,
    expected: ExpectedPads,
    input: PadMetadata<J::InMeta>,
    output: Arc<SourceBase<J::Out, J::OutMeta>>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    started: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl<J: Job> JobTransformer<J> {
    /// Create a transformer around `job`, waiting for `expected` input pads.
    pub fn new(name: impl Into<String>, job: J, expected: ExpectedPads) -> Self {
        Self {
            name: name.into(),
            job: Arc::new(job),
            expected,
            input: PadMetadata::inputs(),
            output: Arc::new(SourceBase::new()),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The job.
    pub fn job(&self) -> &J {
        &self.job
    }

    /// Whether the processing task has been spawned and not ended yet.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.done.is_cancelled()
    }

    /// Whether the processing task has ended.
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Fire the cancellation token handed to the processing task.
    ///
    /// The task decides how to react. [`close`](Stage::close) still joins it.
    pub fn abort(&self) {
        tracing::debug!(element = %self.name, "aborting job");
        self.cancel.cancel();
    }

    fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.is_some() || self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::Task {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        let job = Arc::clone(&self.job);
        let cx = JobContext {
            output: Arc::clone(&self.output),
            cancel: self.cancel.clone(),
        };
        let name = self.name.clone();
        let done = self.done.clone();
        *task = Some(runtime.spawn(async move {
            tracing::debug!(element = %name, "job started");
            let result = job.run(cx).await;
            match &result {
                Ok(()) => tracing::debug!(element = %name, "job finished"),
                Err(e) => tracing::warn!(element = %name, error = %e, "job failed"),
            }
            done.cancel();
            job.abandon_input().await;
            result
        }));
        self.started.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl<J: Job> Stage for JobTransformer<J> {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.job.finish_input().await;

        let task = self.task.lock().take();
        let result = match task {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Task {
                    name: self.name.clone(),
                    reason: e.to_string(),
                }),
            },
            None => Ok(()),
        };

        self.output.close();
        tracing::debug!(element = %self.name, "job transformer closed");
        result
    }
}

#[async_trait]
impl<J: Job> Sink<J::In, J::InMeta> for JobTransformer<J> {
    fn input_metadata(&self) -> BTreeMap<PadId, Option<J::InMeta>> {
        self.input
            .snapshot()
            .into_iter()
            .map(|(pad, meta)| (pad, Some(meta)))
            .collect()
    }

    fn configured_metadata(&self, pad: PadId) -> Option<J::InMeta> {
        self.input.get(pad)
    }

    fn configure(&self, pad: PadId, metadata: J::InMeta) -> Result<()> {
        if !self.expected.allows(pad) {
            return Err(Error::configuration(pad, "pad not allowed"));
        }
        let output = self.job.output_metadata(&metadata);
        self.input.insert_new(pad, metadata)?;
        self.output.set_output_metadata(pad, output);
        tracing::debug!(element = %self.name, pad, "input pad configured");

        if self.expected.satisfied_by(&self.input.pads()) {
            self.start()?;
        }
        Ok(())
    }

    async fn submit(&self, _cx: &LockContext, item: FlowItem<J::In, J::InMeta>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.done.is_cancelled() {
            item.close();
            return Err(Error::Closed);
        }
        // A submit stuck on a full queue is released when the task ends; the
        // item is dropped with the submit future.
        tokio::select! {
            result = self.job.submit(item) => result,
            _ = self.done.cancelled() => Err(Error::Closed),
        }
    }
}

impl<J: Job> Source<J::Out, J::OutMeta> for JobTransformer<J> {
    fn output_metadata(&self) -> BTreeMap<PadId, J::OutMeta> {
        self.output.output_metadata()
    }

    fn stream(&self) -> &CloningStream<FlowItem<J::Out, J::OutMeta>> {
        self.output.stream()
    }
}

/// Bounded hand-off queue between a job's `submit` and its task.
///
/// `push` waits while the queue is full, so a slow task slows down the
/// publisher feeding the transformer. [`finish`](Self::finish) ends the
/// input without waiting; [`close`](Self::close) is for a consumer that
/// stopped and releases whatever is still queued.
pub struct JobQueue<T> {
    tx: Mutex<Option<AsyncSender<T>>>,
    rx: AsyncReceiver<T>,
}

impl<T: Reference> JobQueue<T> {
    /// Create a queue holding up to `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded_async(capacity);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    /// Enqueue an item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`finish`](Self::finish) or
    /// [`close`](Self::close). The item is closed when the queue was already
    /// finished, and dropped when a close interrupts a waiting push.
    pub async fn push(&self, item: T) -> Result<()> {
        let Some(tx) = self.tx.lock().clone() else {
            item.close();
            return Err(Error::Closed);
        };
        tx.send(item).await.map_err(|_| Error::Closed)
    }

    /// Next item, or `None` once the queue was finished and drained, or
    /// closed.
    pub async fn next(&self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    /// Mark the end of input. Items already queued, and items of pushes
    /// already waiting, are still returned by [`next`](Self::next).
    pub fn finish(&self) {
        self.tx.lock().take();
    }

    /// Stop the queue for good: close every queued item and fail pending and
    /// future pushes.
    pub fn close(&self) {
        self.finish();
        let mut released = 0usize;
        while let Ok(Some(item)) = self.rx.try_recv() {
            item.close();
            released += 1;
        }
        let _ = self.rx.close();
        if released > 0 {
            tracing::debug!(released, "job queue closed with pending items");
        }
    }

    /// Whether [`finish`](Self::finish) or [`close`](Self::close) was called.
    pub fn is_finished(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
