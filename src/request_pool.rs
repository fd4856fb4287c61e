//! Prioritized, deduplicating dispatch of image loads.
//!
//! Requests are keyed by `(image id, request type)`. A second request for a
//! key that is already queued or running subscribes to the same outcome
//! instead of fetching again:
//!
//! ```text
//! volume A frame 3 ─┐
//!                   ├──► RequestPool ──► one ImageLoader::load ──┐
//! thumbnail strip  ─┘        ▲                                   │
//!                            └──────── shared outcome ◄──────────┘
//! ```
//!
//! Queued requests are dispatched by descending priority, FIFO within a
//! priority, subject to a concurrency limit per request type. Cancelling the
//! last subscriber of a request removes it from the queue or aborts the
//! running load.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use web_time::Instant;

use crate::ImageId;
use crate::config::RequestPoolConfig;
use crate::enums::RequestType;
use crate::loader::{DecodedImage, ImageLoader, LoadError, LoadOptions};
use crate::volume::FrameTarget;

/// What every subscriber of a request eventually receives.
pub type LoadOutcome = Result<Arc<DecodedImage>, LoadError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub image_id: ImageId,
    pub request_type: RequestType,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestPoolStats {
    /// Calls to [`RequestPool::request`].
    pub requested: u64,
    /// Requests attached to an outcome already queued or in flight.
    pub coalesced: u64,
    /// Loads actually handed to the loader.
    pub dispatched: u64,
    pub completed: u64,
    /// Requests dropped because their last subscriber cancelled.
    pub cancelled: u64,
    pub failed: u64,
    /// Requests refused because the id failed permanently recently.
    pub suppressed: u64,
}

impl RequestPoolStats {
    pub fn coalescing_ratio(&self) -> f64 {
        if self.requested == 0 {
            0.0
        } else {
            self.coalesced as f64 / self.requested as f64
        }
    }
}

enum EntryState {
    Queued { priority: i32 },
    Running,
}

struct Entry {
    /// Submission order, also identifies this entry against later ones for
    /// the same key.
    seq: u64,
    state: EntryState,
    request_type: RequestType,
    target: Option<FrameTarget>,
    subscribers: usize,
    sender: broadcast::Sender<LoadOutcome>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<RequestKey, Entry>,
    /// Queued keys ordered by (highest priority, earliest submission).
    queue: BTreeMap<(Reverse<i32>, u64), RequestKey>,
    running: HashMap<RequestType, usize>,
    failures: HashMap<ImageId, Instant>,
    next_seq: u64,
    stats: RequestPoolStats,
}

struct PoolInner {
    loader: Arc<dyn ImageLoader>,
    config: RequestPoolConfig,
    state: Mutex<PoolState>,
}

/// Shared dispatcher of image loads. Cloning yields another handle to the
/// same pool.
///
/// Dispatch spawns onto the current Tokio runtime, so requests must be made
/// from within one.
#[derive(Clone)]
pub struct RequestPool {
    inner: Arc<PoolInner>,
}

struct Dispatch {
    key: RequestKey,
    seq: u64,
    options: LoadOptions,
}

impl RequestPool {
    pub fn new(loader: Arc<dyn ImageLoader>, config: RequestPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                loader,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn config(&self) -> &RequestPoolConfig {
        &self.inner.config
    }

    /// Request `image_id`, optionally offering `target` as the destination
    /// of the decoded pixels.
    ///
    /// If a request for the same id and type is already queued or running,
    /// the returned handle shares its outcome; a higher `priority` moves the
    /// queued request up.
    pub fn request(
        &self,
        image_id: impl Into<ImageId>,
        request_type: RequestType,
        priority: i32,
        target: Option<FrameTarget>,
    ) -> RequestHandle {
        let key = RequestKey {
            image_id: image_id.into(),
            request_type,
        };

        let handle = {
            let mut state = self.inner.state.lock();
            state.stats.requested += 1;

            if let Some(failed_at) = state.failures.get(&key.image_id).copied() {
                if failed_at.elapsed() < self.inner.config.failure_cooldown {
                    state.stats.suppressed += 1;
                    debug!(
                        image_id = %key.image_id,
                        "Refusing request for recently failed image"
                    );
                    return RequestHandle::resolved(
                        self.clone(),
                        key,
                        Err(LoadError::permanent("image failed recently")),
                    );
                }
                state.failures.remove(&key.image_id);
            }

            if let Some(entry) = state.entries.get_mut(&key) {
                entry.subscribers += 1;
                let receiver = entry.sender.subscribe();
                let seq = entry.seq;
                let raise = match entry.state {
                    EntryState::Queued { priority: queued } if priority > queued => {
                        Some(queued)
                    }
                    _ => None,
                };
                let subscribers = entry.subscribers;
                state.stats.coalesced += 1;
                if let Some(queued) = raise {
                    Self::move_in_queue(&mut state, &key, seq, queued, priority);
                }
                debug!(
                    image_id = %key.image_id,
                    %request_type,
                    subscribers,
                    "Coalesced request with pending load"
                );
                RequestHandle::new(self.clone(), key, seq, receiver)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let (sender, receiver) = broadcast::channel(1);
                state.entries.insert(
                    key.clone(),
                    Entry {
                        seq,
                        state: EntryState::Queued { priority },
                        request_type,
                        target,
                        subscribers: 1,
                        sender,
                        cancel: CancellationToken::new(),
                    },
                );
                state.queue.insert((Reverse(priority), seq), key.clone());
                trace!(image_id = %key.image_id, %request_type, priority, "Queued request");
                RequestHandle::new(self.clone(), key, seq, receiver)
            }
        };

        self.pump();
        handle
    }

    /// Change the priority of a request that has not started yet. Its FIFO
    /// position among equal priorities is kept.
    pub fn reprioritize(&self, image_id: &str, request_type: RequestType, priority: i32) -> bool {
        let key = RequestKey {
            image_id: image_id.to_owned(),
            request_type,
        };
        let mut state = self.inner.state.lock();
        let (seq, old) = match state.entries.get(&key) {
            Some(Entry {
                seq,
                state: EntryState::Queued { priority: old },
                ..
            }) => (*seq, *old),
            _ => return false,
        };
        Self::move_in_queue(&mut state, &key, seq, old, priority);
        true
    }

    fn move_in_queue(state: &mut PoolState, key: &RequestKey, seq: u64, old: i32, new: i32) {
        state.queue.remove(&(Reverse(old), seq));
        state.queue.insert((Reverse(new), seq), key.clone());
        if let Some(entry) = state.entries.get_mut(key) {
            entry.state = EntryState::Queued { priority: new };
        }
    }

    /// Start as many queued requests as the per-type limits allow.
    fn pump(&self) {
        let dispatches = {
            let mut state = self.inner.state.lock();
            let mut dispatches = Vec::new();
            loop {
                let next = state
                    .queue
                    .iter()
                    .find(|(_, key)| {
                        let running = state.running.get(&key.request_type).copied().unwrap_or(0);
                        running < self.inner.config.max_concurrent(key.request_type)
                    })
                    .map(|(slot, key)| (*slot, key.clone()));
                let Some((slot, key)) = next else {
                    break;
                };
                state.queue.remove(&slot);

                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                entry.state = EntryState::Running;
                let dispatch = Dispatch {
                    seq: entry.seq,
                    options: LoadOptions {
                        request_type: entry.request_type,
                        priority: slot.0.0,
                        target: entry.target.clone(),
                        cancel: entry.cancel.clone(),
                    },
                    key,
                };
                *state.running.entry(dispatch.key.request_type).or_insert(0) += 1;
                state.stats.dispatched += 1;
                dispatches.push(dispatch);
            }
            dispatches
        };

        for dispatch in dispatches {
            self.spawn(dispatch);
        }
    }

    fn spawn(&self, dispatch: Dispatch) {
        let pool = self.clone();
        let Dispatch { key, seq, options } = dispatch;
        debug!(
            image_id = %key.image_id,
            request_type = %key.request_type,
            priority = options.priority,
            "Dispatching load"
        );
        let cancel = options.cancel.clone();
        let load = self.inner.loader.load(&key.image_id, options);
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LoadError::Cancelled),
                result = load => result,
            };
            trace!(
                image_id = %key.image_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Load finished"
            );
            pool.finish(key, seq, result.map(Arc::new));
        });
    }

    fn finish(&self, key: RequestKey, seq: u64, outcome: LoadOutcome) {
        let sender = {
            let mut state = self.inner.state.lock();
            if let Some(running) = state.running.get_mut(&key.request_type) {
                *running = running.saturating_sub(1);
            }
            match &outcome {
                Ok(_) => state.stats.completed += 1,
                Err(LoadError::Permanent { reason }) => {
                    warn!(image_id = %key.image_id, reason = %reason, "Permanent load failure");
                    state.stats.failed += 1;
                    state.failures.insert(key.image_id.clone(), Instant::now());
                }
                Err(LoadError::Transient { reason }) => {
                    debug!(image_id = %key.image_id, reason = %reason, "Transient load failure");
                    state.stats.failed += 1;
                }
                Err(LoadError::Cancelled) => {}
            }
            // An orphaned load may finish after a new request for the same key.
            let current = state.entries.get(&key).is_some_and(|entry| entry.seq == seq);
            if current {
                state.entries.remove(&key).map(|entry| entry.sender)
            } else {
                None
            }
        };

        if let Some(sender) = sender {
            // Subscribers that cancelled have dropped their receivers.
            let _ = sender.send(outcome);
        }
        self.pump();
    }

    fn unsubscribe(&self, key: &RequestKey, seq: u64) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.seq != seq {
            return;
        }
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            debug!(
                image_id = %key.image_id,
                subscribers = entry.subscribers,
                "Subscriber left, load continues"
            );
            return;
        }

        let Some(entry) = state.entries.remove(key) else {
            return;
        };
        state.stats.cancelled += 1;
        match entry.state {
            EntryState::Queued { priority } => {
                state.queue.remove(&(Reverse(priority), entry.seq));
                debug!(image_id = %key.image_id, "Cancelled queued request");
            }
            EntryState::Running => {
                entry.cancel.cancel();
                debug!(image_id = %key.image_id, "Aborted running load");
            }
        }
    }

    /// Number of requests waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Number of loads currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().running.values().sum()
    }

    /// Whether `image_id` is refused because of a recent permanent failure.
    pub fn is_suppressed(&self, image_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .failures
            .get(image_id)
            .is_some_and(|at| at.elapsed() < self.inner.config.failure_cooldown)
    }

    /// Forget recorded permanent failures so their ids may be requested again.
    pub fn clear_failures(&self) {
        self.inner.state.lock().failures.clear();
    }

    pub fn stats(&self) -> RequestPoolStats {
        self.inner.state.lock().stats
    }
}

/// Cancels one subscriber of a request. Clones cancel the same subscriber.
#[derive(Clone)]
pub struct Subscription {
    pool: RequestPool,
    key: RequestKey,
    seq: u64,
    active: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Subscription {
    /// Stop waiting for the result. Idempotent.
    ///
    /// If this was the last subscriber the request is dropped from the queue
    /// or its running load is aborted.
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.token.cancel();
            self.pool.unsubscribe(&self.key, self.seq);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        !self.active.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }
}

/// Pending result of [`RequestPool::request`].
pub struct RequestHandle {
    receiver: broadcast::Receiver<LoadOutcome>,
    subscription: Subscription,
}

impl RequestHandle {
    fn new(
        pool: RequestPool,
        key: RequestKey,
        seq: u64,
        receiver: broadcast::Receiver<LoadOutcome>,
    ) -> Self {
        Self {
            receiver,
            subscription: Subscription {
                pool,
                key,
                seq,
                active: Arc::new(AtomicBool::new(true)),
                token: CancellationToken::new(),
            },
        }
    }

    /// Handle whose outcome is already known.
    fn resolved(pool: RequestPool, key: RequestKey, outcome: LoadOutcome) -> Self {
        let (sender, receiver) = broadcast::channel(1);
        let _ = sender.send(outcome);
        Self::new(pool, key, u64::MAX, receiver)
    }

    pub fn key(&self) -> &RequestKey {
        &self.subscription.key
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription.clone()
    }

    pub fn cancel(&self) {
        self.subscription.cancel();
    }

    /// Wait for the outcome. Resolves with [`LoadError::Cancelled`] once this
    /// handle is cancelled or the request is dropped.
    pub async fn wait(mut self) -> LoadOutcome {
        let token = self.subscription.token.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(LoadError::Cancelled),
            received = self.receiver.recv() => received.unwrap_or(Err(LoadError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{ElementType, ImageQualityStatus};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Reply = oneshot::Sender<Result<DecodedImage, LoadError>>;

    /// Loader whose loads stay pending until the test completes them.
    #[derive(Default)]
    struct GatedLoader {
        pending: Mutex<HashMap<String, (Reply, CancellationToken)>>,
        started: Mutex<Vec<String>>,
    }

    impl GatedLoader {
        fn calls(&self) -> usize {
            self.started.lock().len()
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().clone()
        }

        fn token(&self, id: &str) -> Option<CancellationToken> {
            self.pending.lock().get(id).map(|(_, token)| token.clone())
        }

        async fn wait_started(&self, id: &str) {
            for _ in 0..1000 {
                if self.pending.lock().contains_key(id) {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("load for {id} never started");
        }

        fn complete(&self, id: &str, result: Result<DecodedImage, LoadError>) {
            let (reply, _) = self.pending.lock().remove(id).expect("pending load");
            let _ = reply.send(result);
        }
    }

    impl ImageLoader for GatedLoader {
        fn load(
            &self,
            image_id: &str,
            options: LoadOptions,
        ) -> BoxFuture<'static, Result<DecodedImage, LoadError>> {
            let (reply, receiver) = oneshot::channel();
            self.started.lock().push(image_id.to_owned());
            self.pending
                .lock()
                .insert(image_id.to_owned(), (reply, options.cancel));
            async move { receiver.await.unwrap_or(Err(LoadError::Cancelled)) }.boxed()
        }
    }

    fn image(id: &str) -> Result<DecodedImage, LoadError> {
        Ok(DecodedImage::owned(
            id,
            1,
            2,
            ElementType::Uint8,
            ImageQualityStatus::FullResolution,
            vec![1, 2],
        ))
    }

    fn pool(loader: &Arc<GatedLoader>, config: RequestPoolConfig) -> RequestPool {
        RequestPool::new(loader.clone(), config)
    }

    #[tokio::test]
    async fn test_duplicate_requests_share_one_load() {
        let loader = Arc::new(GatedLoader::default());
        let pool = pool(&loader, RequestPoolConfig::default());

        let first = pool.request("x", RequestType::Interaction, 0, None);
        let second = pool.request("x", RequestType::Interaction, 0, None);
        loader.wait_started("x").await;
        loader.complete("x", image("x"));

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.calls(), 1);
        assert_eq!(pool.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_different_request_types_are_not_coalesced() {
        let loader = Arc::new(GatedLoader::default());
        let pool = pool(&loader, RequestPoolConfig::default());

        let _a = pool.request("x", RequestType::Interaction, 0, None);
        let _b = pool.request("x", RequestType::Prefetch, 0, None);
        tokio::task::yield_now().await;
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_with_remaining_subscriber_keeps_load() {
        let loader = Arc::new(GatedLoader::default());
        let pool = pool(&loader, RequestPoolConfig::default());

        let first = pool.request("x", RequestType::Interaction, 0, None);
        let second = pool.request("x", RequestType::Interaction, 0, None);
        loader.wait_started("x").await;

        first.cancel();
        assert!(!loader.token("x").unwrap().is_cancelled());
        assert_eq!(first.wait().await.unwrap_err(), LoadError::Cancelled);

        loader.complete("x", image("x"));
        assert!(second.wait().await.is_ok());
        assert_eq!(pool.stats().cancelled, 0);
    }

    #[tokio::test]
    async fn test_cancel_last_subscriber_aborts_load() {
        let loader = Arc::new(GatedLoader::default());
        let pool = pool(&loader, RequestPoolConfig::default());

        let handle = pool.request("x", RequestType::Interaction, 0, None);
        loader.wait_started("x").await;
        let subscription = handle.subscription();
        subscription.cancel();
        subscription.cancel();

        assert!(loader.token("x").unwrap().is_cancelled());
        assert_eq!(handle.wait().await.unwrap_err(), LoadError::Cancelled);
        assert_eq!(pool.stats().cancelled, 1);

        for _ in 0..100 {
            if pool.in_flight() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_order_by_priority_then_fifo() {
        let loader = Arc::new(GatedLoader::default());
        let config = RequestPoolConfig::default().with_max_concurrent(RequestType::Interaction, 1);
        let pool = pool(&loader, config);

        let blocker = pool.request("blocker", RequestType::Interaction, 100, None);
        let low = pool.request("low", RequestType::Interaction, 1, None);
        let high_a = pool.request("high-a", RequestType::Interaction, 5, None);
        let high_b = pool.request("high-b", RequestType::Interaction, 5, None);
        loader.wait_started("blocker").await;
        assert_eq!(pool.queued(), 3);

        loader.complete("blocker", image("blocker"));
        blocker.wait().await.unwrap();
        loader.wait_started("high-a").await;
        loader.complete("high-a", image("high-a"));
        high_a.wait().await.unwrap();
        loader.wait_started("high-b").await;
        loader.complete("high-b", image("high-b"));
        high_b.wait().await.unwrap();
        loader.wait_started("low").await;
        loader.complete("low", image("low"));
        low.wait().await.unwrap();

        assert_eq!(loader.started(), vec!["blocker", "high-a", "high-b", "low"]);
    }

    #[tokio::test]
    async fn test_reprioritize_queued_request() {
        let loader = Arc::new(GatedLoader::default());
        let config = RequestPoolConfig::default().with_max_concurrent(RequestType::Prefetch, 1);
        let pool = pool(&loader, config);

        let _blocker = pool.request("blocker", RequestType::Prefetch, 0, None);
        let _a = pool.request("a", RequestType::Prefetch, 0, None);
        let _b = pool.request("b", RequestType::Prefetch, 0, None);
        loader.wait_started("blocker").await;

        assert!(pool.reprioritize("b", RequestType::Prefetch, 10));
        assert!(!pool.reprioritize("blocker", RequestType::Prefetch, 10));

        loader.complete("blocker", image("blocker"));
        loader.wait_started("b").await;
        assert_eq!(loader.started(), vec!["blocker", "b"]);
    }

    #[tokio::test]
    async fn test_duplicate_with_higher_priority_moves_up() {
        let loader = Arc::new(GatedLoader::default());
        let config = RequestPoolConfig::default().with_max_concurrent(RequestType::Prefetch, 1);
        let pool = pool(&loader, config);

        let _blocker = pool.request("blocker", RequestType::Prefetch, 0, None);
        let _a = pool.request("a", RequestType::Prefetch, 1, None);
        let _b = pool.request("b", RequestType::Prefetch, 0, None);
        let _b_again = pool.request("b", RequestType::Prefetch, 9, None);
        loader.wait_started("blocker").await;

        loader.complete("blocker", image("blocker"));
        loader.wait_started("b").await;
        assert_eq!(loader.started(), vec!["blocker", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_request_never_dispatches() {
        let loader = Arc::new(GatedLoader::default());
        let config = RequestPoolConfig::default().with_max_concurrent(RequestType::Thumbnail, 1);
        let pool = pool(&loader, config);

        let _blocker = pool.request("blocker", RequestType::Thumbnail, 0, None);
        let queued = pool.request("queued", RequestType::Thumbnail, 0, None);
        loader.wait_started("blocker").await;
        queued.cancel();
        assert_eq!(pool.queued(), 0);

        loader.complete("blocker", image("blocker"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(loader.started(), vec!["blocker"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_suppressed_during_cooldown() {
        let loader = Arc::new(GatedLoader::default());
        let config = RequestPoolConfig::default().with_failure_cooldown(Duration::from_secs(60));
        let pool = pool(&loader, config);

        let handle = pool.request("bad", RequestType::Interaction, 0, None);
        loader.wait_started("bad").await;
        loader.complete("bad", Err(LoadError::permanent("404")));
        assert!(handle.wait().await.unwrap_err().is_permanent());
        assert!(pool.is_suppressed("bad"));

        let again = pool.request("bad", RequestType::Prefetch, 0, None);
        assert!(again.wait().await.unwrap_err().is_permanent());
        assert_eq!(loader.calls(), 1);
        assert_eq!(pool.stats().suppressed, 1);

        pool.clear_failures();
        let _retry = pool.request("bad", RequestType::Interaction, 0, None);
        loader.wait_started("bad").await;
        assert_eq!(loader.calls(), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_suppressed() {
        let loader = Arc::new(GatedLoader::default());
        let pool = pool(&loader, RequestPoolConfig::default());

        let handle = pool.request("flaky", RequestType::Interaction, 0, None);
        loader.wait_started("flaky").await;
        loader.complete("flaky", Err(LoadError::transient("timeout")));
        assert_eq!(
            handle.wait().await.unwrap_err(),
            LoadError::transient("timeout")
        );
        assert!(!pool.is_suppressed("flaky"));
    }
}
