//! Cloning broadcast stream.
//!
//! A [`CloningStream`] multicasts every published item to all subscribers
//! registered at the moment of publishing. Each subscriber receives its own
//! handle, made with [`Reference::try_clone`], and owns it from then on.
//!
//! # Semantics
//!
//! - Publishes are serialized by a [`ReentrantMutex`]; a publish made from
//!   inside a delivery of the same stream (same [`LockContext`]) re-enters.
//! - `publish` returns only after every delivery of the item finished, so a
//!   slow subscriber stalls the producer. This is the only backpressure.
//! - Nothing is buffered. An item published while nobody is subscribed is
//!   dropped without being cloned, and a subscriber only sees items whose
//!   publish started after its registration completed.
//! - Closing the stream resolves every pending subscription.
//!
//! ```text
//!              ┌──────────────┐  clone 1   ┌──────────────┐
//!  publish ───►│ CloningStream├───────────►│ subscriber 1 │
//!              │  (snapshot)  │  clone 2   ├──────────────┤
//!              │              ├───────────►│ subscriber 2 │
//!              └──────────────┘            └──────────────┘
//!                 waits for both deliveries before returning
//! ```

use crate::error::{Error, Result};
use crate::reference::Reference;
use crate::sync::{LockContext, ReentrantMutex};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Receives the items of a [`CloningStream`].
#[async_trait]
pub trait Subscriber<T: Reference>: Send + Sync + 'static {
    /// Handle one item.
    ///
    /// The subscriber owns `item` and must close it. `cx` is the lock context
    /// of the publishing chain; pass it on when publishing from here into a
    /// stream that may already be locked by this chain.
    async fn deliver(&self, cx: &LockContext, item: T) -> Result<()>;
}

/// A [`Subscriber`] built from an async closure.
pub struct FnSubscriber<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnSubscriber<F, Fut> {
    /// Wrap a closure called once per delivered item.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Subscriber<T> for FnSubscriber<F, Fut>
where
    T: Reference,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn deliver(&self, _cx: &LockContext, item: T) -> Result<()> {
        (self.f)(item).await
    }
}

/// Snapshot of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Calls to `publish`.
    pub published: u64,
    /// Successful deliveries (one per subscriber per item).
    pub delivered: u64,
    /// Publishes that found no subscriber.
    pub dropped: u64,
    /// Failed deliveries or clones.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

type SubscriberMap<T> = BTreeMap<u64, Arc<dyn Subscriber<T>>>;

struct Shared<T: Reference> {
    next_id: AtomicU64,
    subscribers: RwLock<SubscriberMap<T>>,
    finished: CancellationToken,
    publish_lock: ReentrantMutex,
    counters: Counters,
}

impl<T: Reference> Shared<T> {
    fn new(finished: CancellationToken) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            subscribers: RwLock::new(BTreeMap::new()),
            finished,
            publish_lock: ReentrantMutex::new(),
            counters: Counters::default(),
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Subscriber<T>>> {
        if self.finished.is_cancelled() {
            return Vec::new();
        }
        self.subscribers.read().values().cloned().collect()
    }

    fn register(self: &Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, subscriber);
        // A close racing with the insert must not leave the entry behind.
        if self.finished.is_cancelled() {
            self.subscribers.write().remove(&id);
        }
        Subscription {
            shared: Arc::clone(self),
            id,
        }
    }

    async fn publish_in(&self, cx: &LockContext, item: &T) -> Result<()> {
        self.publish_lock
            .with_reentrant_lock(cx, |cx| async move {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                let snapshot = self.snapshot();
                if snapshot.is_empty() {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("no subscribers, item dropped");
                    return Ok(());
                }

                let mut clones = Vec::with_capacity(snapshot.len());
                for _ in &snapshot {
                    match item.try_clone() {
                        Ok(clone) => clones.push(clone),
                        Err(e) => {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            clones.into_iter().for_each(Reference::close);
                            return Err(e);
                        }
                    }
                }

                tracing::trace!(subscribers = snapshot.len(), "publishing item");
                let mut deliveries: FuturesUnordered<_> = snapshot
                    .iter()
                    .zip(clones)
                    .map(|(subscriber, clone)| subscriber.deliver(&cx, clone))
                    .collect();

                let mut first_error = None;
                while let Some(result) = deliveries.next().await {
                    match result {
                        Ok(()) => {
                            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            first_error.get_or_insert(e);
                        }
                    }
                }

                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
            .await
    }

    fn finish(&self) {
        self.finished.cancel();
        self.subscribers.write().clear();
    }
}

/// Registration of a [`Subscriber`] on a [`CloningStream`].
///
/// The subscriber stays registered until this value is dropped or the stream
/// closes.
pub struct Subscription<T: Reference> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T: Reference> Subscription<T> {
    /// Identifier of this subscription within its stream.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the stream is closed.
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }

    /// Whether the subscriber is still in the stream's active set.
    pub fn is_active(&self) -> bool {
        !self.shared.finished.is_cancelled() && self.shared.subscribers.read().contains_key(&self.id)
    }
}

impl<T: Reference> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.subscribers.write().remove(&self.id);
    }
}

impl<T: Reference> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("closed", &self.shared.finished.is_cancelled())
            .finish()
    }
}

/// Republishes upstream items into a wrapping stream.
struct Republish<T: Reference> {
    target: Arc<Shared<T>>,
}

#[async_trait]
impl<T: Reference> Subscriber<T> for Republish<T> {
    async fn deliver(&self, cx: &LockContext, item: T) -> Result<()> {
        let result = self.target.publish_in(cx, &item).await;
        item.close();
        result
    }
}

/// Multicast stream that hands every subscriber its own clone of each item.
///
/// # Example
///
/// ```rust
/// use flowgraph::stream::{CloningStream, FnSubscriber};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// # #[tokio::main]
/// # async fn main() {
/// let stream = CloningStream::<u64>::new();
/// let total = Arc::new(AtomicU64::new(0));
///
/// let sum = total.clone();
/// let subscription = stream.register(FnSubscriber::new(move |v: u64| {
///     let sum = sum.clone();
///     async move {
///         sum.fetch_add(v, Ordering::SeqCst);
///         Ok(())
///     }
/// }));
///
/// stream.publish(&20).await.unwrap();
/// stream.publish(&22).await.unwrap();
/// stream.close();
/// subscription.closed().await;
/// assert_eq!(total.load(Ordering::SeqCst), 42);
/// # }
/// ```
pub struct CloningStream<T: Reference> {
    shared: Arc<Shared<T>>,
    upstream: Mutex<Option<Subscription<T>>>,
}

impl<T: Reference> CloningStream<T> {
    /// Create a stream fed only by [`publish`](Self::publish).
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(CancellationToken::new())),
            upstream: Mutex::new(None),
        }
    }

    /// Create a stream that republishes everything `upstream` publishes.
    ///
    /// The upstream registration is complete when this returns. Closing the
    /// wrapper unregisters it from upstream; closing upstream closes the
    /// wrapper. Items can still be published into the wrapper directly.
    pub fn wrap(upstream: &CloningStream<T>) -> Self {
        let shared = Arc::new(Shared::new(upstream.shared.finished.child_token()));
        let subscription = upstream.shared.register(Arc::new(Republish {
            target: Arc::clone(&shared),
        }));
        Self {
            shared,
            upstream: Mutex::new(Some(subscription)),
        }
    }

    /// Publish an item to every current subscriber.
    ///
    /// Each subscriber gets its own clone; the caller keeps `item` and remains
    /// responsible for closing it. Returns once all deliveries finished.
    ///
    /// # Errors
    ///
    /// Fails when cloning fails (no subscriber receives anything) or when any
    /// delivery fails (deliveries that succeeded stay delivered).
    pub async fn publish(&self, item: &T) -> Result<()> {
        self.publish_in(&LockContext::new(), item).await
    }

    /// [`publish`](Self::publish) on behalf of a call chain that may already
    /// hold this stream's lock.
    pub async fn publish_in(&self, cx: &LockContext, item: &T) -> Result<()> {
        self.shared.publish_in(cx, item).await
    }

    /// Register a subscriber without waiting.
    ///
    /// The very next publish that starts after this returns will reach it.
    pub fn register<S: Subscriber<T>>(&self, subscriber: S) -> Subscription<T> {
        self.register_arc(Arc::new(subscriber))
    }

    /// [`register`](Self::register) for an already shared subscriber.
    pub fn register_arc(&self, subscriber: Arc<dyn Subscriber<T>>) -> Subscription<T> {
        let subscription = self.shared.register(subscriber);
        tracing::trace!(id = subscription.id, "subscriber registered");
        subscription
    }

    /// Register a subscriber and wait until the stream is closed.
    ///
    /// Dropping the returned future removes the subscriber immediately.
    pub async fn subscribe<S: Subscriber<T>>(&self, subscriber: S) {
        let subscription = self.register(subscriber);
        subscription.closed().await;
    }

    /// Call `f` for every item until the stream is closed.
    pub async fn collect<F, Fut>(&self, f: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(FnSubscriber::new(f)).await;
    }

    /// Close the stream.
    ///
    /// Resolves all pending subscriptions and unregisters every subscriber.
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        if let Some(upstream) = self.upstream.lock().take() {
            drop(upstream);
        }
        if !self.shared.finished.is_cancelled() {
            tracing::debug!(
                subscribers = self.subscriber_count(),
                "closing cloning stream"
            );
        }
        self.shared.finish();
    }

    /// Whether the stream has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Wait until the stream is closed.
    pub async fn closed(&self) {
        self.shared.finished.cancelled().await;
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.snapshot().len()
    }

    /// Counters since creation.
    pub fn stats(&self) -> StreamStats {
        let c = &self.shared.counters;
        StreamStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

impl<T: Reference> Default for CloningStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Reference> std::fmt::Debug for CloningStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloningStream")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .field("wrapping", &self.upstream.lock().is_some())
            .finish()
    }
}

impl<T: Reference> Drop for CloningStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reject publishing into a stream after the fact.
///
/// Used by stages whose output must not outlive their close.
pub(crate) fn ensure_open<T: Reference>(stream: &CloningStream<T>) -> Result<()> {
    if stream.is_closed() {
        Err(Error::Closed)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::FlowItem;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Reference type that counts live handles and releases.
    struct Counted {
        value: u64,
        live: Arc<AtomicUsize>,
    }

    impl Counted {
        fn new(value: u64, live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                value,
                live: live.clone(),
            }
        }
    }

    impl Reference for Counted {
        fn try_clone(&self) -> Result<Self> {
            Ok(Counted::new(self.value, &self.live))
        }

        fn close(self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Clones succeed `budget` times, then fail.
    struct Limited {
        budget: Arc<AtomicUsize>,
        live: Arc<AtomicUsize>,
    }

    impl Reference for Limited {
        fn try_clone(&self) -> Result<Self> {
            if self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_err()
            {
                return Err(Error::Released);
            }
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Limited {
                budget: self.budget.clone(),
                live: self.live.clone(),
            })
        }

        fn close(self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn recorder(seen: &Arc<Mutex<Vec<u64>>>) -> impl Subscriber<Counted> {
        let seen = seen.clone();
        FnSubscriber::new(move |item: Counted| {
            let seen = seen.clone();
            async move {
                seen.lock().push(item.value);
                item.close();
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_makes_no_clone() {
        let live = Arc::new(AtomicUsize::new(0));
        let stream = CloningStream::new();
        let item = Counted::new(1, &live);

        stream.publish(&item).await.unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(stream.stats().dropped, 1);
        item.close();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_own_clone() {
        let live = Arc::new(AtomicUsize::new(0));
        let stream = CloningStream::new();
        let held: Arc<Mutex<Vec<Counted>>> = Arc::new(Mutex::new(Vec::new()));

        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let held = held.clone();
            subscriptions.push(stream.register(FnSubscriber::new(move |item: Counted| {
                let held = held.clone();
                async move {
                    held.lock().push(item);
                    Ok(())
                }
            })));
        }

        let item = Counted::new(7, &live);
        stream.publish(&item).await.unwrap();
        item.close();
        assert_eq!(live.load(Ordering::SeqCst), 3);

        let mut clones = std::mem::take(&mut *held.lock());
        let first = clones.pop().unwrap();
        first.close();
        assert_eq!(live.load(Ordering::SeqCst), 2);
        for clone in clones {
            assert_eq!(clone.value, 7);
            clone.close();
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(stream.stats().delivered, 3);
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_nothing_earlier() {
        let live = Arc::new(AtomicUsize::new(0));
        let stream = CloningStream::new();
        let early = Arc::new(Mutex::new(Vec::new()));
        let late = Arc::new(Mutex::new(Vec::new()));

        let _early = stream.register(recorder(&early));
        let first = Counted::new(1, &live);
        stream.publish(&first).await.unwrap();
        first.close();

        let _late = stream.register(recorder(&late));
        let second = Counted::new(2, &live);
        stream.publish(&second).await.unwrap();
        second.close();

        assert_eq!(*early.lock(), vec![1, 2]);
        assert_eq!(*late.lock(), vec![2]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_waits_for_slowest_subscriber() {
        let stream = CloningStream::<u64>::new();
        let _fast = stream.register(FnSubscriber::new(|_: u64| async { Ok(()) }));
        let _slow = stream.register(FnSubscriber::new(|_: u64| async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(())
        }));

        let start = Instant::now();
        stream.publish(&1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_close_resolves_subscribe() {
        let stream = Arc::new(CloningStream::<u64>::new());
        let collector = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream.collect(|_| async { Ok(()) }).await;
            })
        };
        while stream.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        stream.close();
        stream.close();
        collector.await.unwrap();
        assert_eq!(stream.subscriber_count(), 0);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_cancelled_subscription_is_removed() {
        let stream = Arc::new(CloningStream::<u64>::new());
        let task = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.collect(|_| async { Ok(()) }).await })
        };
        while stream.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(stream.subscriber_count(), 0);
        assert!(!stream.is_closed());
    }

    #[tokio::test]
    async fn test_delivery_failure_fails_publish_but_keeps_others() {
        let live = Arc::new(AtomicUsize::new(0));
        let stream = CloningStream::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _ok = stream.register(recorder(&seen));
        let _failing = stream.register(FnSubscriber::new(|item: Counted| async move {
            item.close();
            Err(Error::Element("refused".into()))
        }));

        let item = Counted::new(5, &live);
        let result = stream.publish(&item).await;
        item.close();

        assert!(matches!(result, Err(Error::Element(_))));
        assert_eq!(*seen.lock(), vec![5]);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(stream.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_clone_failure_closes_partial_clones() {
        let live = Arc::new(AtomicUsize::new(1));
        let delivered = Arc::new(AtomicUsize::new(0));
        let stream = CloningStream::new();

        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            let delivered = delivered.clone();
            subscriptions.push(stream.register(FnSubscriber::new(move |item: Limited| {
                let delivered = delivered.clone();
                async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    item.close();
                    Ok(())
                }
            })));
        }

        let item = Limited {
            budget: Arc::new(AtomicUsize::new(2)),
            live: live.clone(),
        };
        assert!(matches!(stream.publish(&item).await, Err(Error::Released)));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        item.close();
    }

    #[tokio::test]
    async fn test_reentrant_publish_from_delivery() {
        let stream: Arc<CloningStream<FlowItem<u64, ()>>> = Arc::new(CloningStream::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct Echo {
            stream: std::sync::Weak<CloningStream<FlowItem<u64, ()>>>,
            seen: Arc<Mutex<Vec<(u32, u64)>>>,
        }

        #[async_trait]
        impl Subscriber<FlowItem<u64, ()>> for Echo {
            async fn deliver(&self, cx: &LockContext, item: FlowItem<u64, ()>) -> Result<()> {
                self.seen.lock().push((item.pad(), *item.value()));
                let result = match self.stream.upgrade() {
                    Some(stream) if item.pad() == 0 => {
                        let echo = FlowItem::new(1, (), *item.value() + 100);
                        stream.publish_in(cx, &echo).await
                    }
                    _ => Ok(()),
                };
                item.close();
                result
            }
        }

        let _echo = stream.register(Echo {
            stream: Arc::downgrade(&stream),
            seen: seen.clone(),
        });

        let published = tokio::time::timeout(
            Duration::from_secs(5),
            stream.publish(&FlowItem::new(0, (), 1)),
        )
        .await;
        assert!(published.expect("reentrant publish deadlocked").is_ok());
        assert_eq!(*seen.lock(), vec![(0, 1), (1, 101)]);
    }

    #[tokio::test]
    async fn test_wrapped_stream_republishes() {
        let live = Arc::new(AtomicUsize::new(0));
        let upstream = CloningStream::new();
        let wrapper = CloningStream::wrap(&upstream);
        assert_eq!(upstream.subscriber_count(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = wrapper.register(recorder(&seen));

        for v in 0..3 {
            let item = Counted::new(v, &live);
            upstream.publish(&item).await.unwrap();
            item.close();
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(live.load(Ordering::SeqCst), 0);

        wrapper.close();
        assert_eq!(upstream.subscriber_count(), 0);
        assert!(!upstream.is_closed());
    }

    #[tokio::test]
    async fn test_upstream_close_finishes_wrapper() {
        let upstream = CloningStream::<u64>::new();
        let wrapper = CloningStream::wrap(&upstream);
        let sub = wrapper.register(FnSubscriber::new(|_: u64| async { Ok(()) }));

        upstream.close();
        tokio::time::timeout(Duration::from_secs(5), sub.closed())
            .await
            .expect("wrapper did not finish");
        assert!(wrapper.is_closed());
    }

    #[tokio::test]
    async fn test_register_after_close_is_inert() {
        let stream = CloningStream::<u64>::new();
        stream.close();
        let sub = stream.register(FnSubscriber::new(|_: u64| async { Ok(()) }));
        assert!(!sub.is_active());
        sub.closed().await;
        assert!(ensure_open(&stream).is_err());
    }

    #[tokio::test]
    async fn test_close_through_shared_pointer() {
        let stream = Arc::new(CloningStream::<u64>::new());
        let keep = stream.clone();
        let sub = keep.register(FnSubscriber::new(|_: u64| async { Ok(()) }));

        stream.close();
        assert!(keep.is_closed());
        assert!(!sub.is_active());
        assert_eq!(Arc::strong_count(&keep), 2);
    }
}
