//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Change watchers
//!
//! The registry pushes every [`ChangeEvent`] into an unbounded queue while it
//! still holds its table lock, so queue order equals version order. A single
//! dispatcher drains that queue and hands each event to the queue of a worker
//! owned by the event's service. Workers call listeners one at a time, so
//! delivery is serial within a service and parallel across services. Neither
//! mutations nor the dispatcher ever wait on a listener; a slow service only
//! grows its own backlog. A worker is retired with the last watcher of its
//! service.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::types::ChangeEvent;
use crate::GatewayResult;

/// Receives change events for one service
///
/// Delivery is at-least-once; implementations must be idempotent.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

/// Adapter turning a plain closure into a [`ChangeListener`]
pub struct FnListener<F>(pub F);

#[async_trait]
impl<F> ChangeListener for FnListener<F>
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Handle identifying one subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watcher {
    pub service_name: String,
    pub subscriber_id: String,
}

struct Subscription {
    listener: Arc<dyn ChangeListener>,
    last_seen_version: AtomicU64,
}

type Subscribers = HashMap<String, BTreeMap<String, Arc<Subscription>>>;

struct Worker {
    queue: mpsc::UnboundedSender<ChangeEvent>,
    backlog: Arc<AtomicUsize>,
}

struct WatchInner {
    subscribers: RwLock<Subscribers>,
    workers: Mutex<HashMap<String, Worker>>,
    /// Backlog per service above which a warning is logged
    backlog_warning: usize,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Set of watchers with their dispatch workers
#[derive(Clone)]
pub struct WatcherSet {
    inner: Arc<WatchInner>,
}

impl WatcherSet {
    /// `backlog_warning` is the number of undelivered events of one service
    /// at which a warning is logged
    pub fn new(backlog_warning: usize, cancel: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                subscribers: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                backlog_warning: backlog_warning.max(1),
                cancel,
                tracker,
            }),
        }
    }

    /// Add a watcher. Events with a version at or below `current_version`
    /// are not delivered to it.
    pub fn subscribe_as(
        &self,
        service_name: &str,
        subscriber_id: &str,
        listener: Arc<dyn ChangeListener>,
        current_version: u64,
    ) -> GatewayResult<Watcher> {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let service = subscribers.entry(service_name.to_string()).or_default();
        if service.contains_key(subscriber_id) {
            return Err(GatewayError::Duplicate(format!(
                "subscriber {subscriber_id} already watches {service_name}"
            )));
        }
        service.insert(
            subscriber_id.to_string(),
            Arc::new(Subscription {
                listener,
                last_seen_version: AtomicU64::new(current_version),
            }),
        );
        debug!("Subscriber {} now watching {}", subscriber_id, service_name);
        Ok(Watcher {
            service_name: service_name.to_string(),
            subscriber_id: subscriber_id.to_string(),
        })
    }

    /// Remove a watcher; returns whether it existed
    pub fn unsubscribe(&self, watcher: &Watcher) -> bool {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(service) = subscribers.get_mut(&watcher.service_name) else {
            return false;
        };
        let removed = service.remove(&watcher.subscriber_id).is_some();
        if service.is_empty() {
            subscribers.remove(&watcher.service_name);
            // the worker drains what is queued, then stops
            self.inner
                .workers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&watcher.service_name);
            debug!("Last watcher of {} gone, worker retired", watcher.service_name);
        }
        removed
    }

    /// Services with a running dispatch worker
    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn watcher_count(&self, service_name: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_name)
            .map_or(0, BTreeMap::len)
    }

    /// Drain the registry's event queue until cancelled
    pub fn spawn_dispatcher(&self, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
        let set = self.clone();
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => set.route(event),
                        None => break,
                    },
                }
            }
            debug!("Watch dispatcher stopped");
        });
    }

    fn route(&self, event: ChangeEvent) {
        // lock order: subscribers, then workers
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if !subscribers.contains_key(&event.service_name) {
            return;
        }
        let mut workers = self.inner.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers
            .entry(event.service_name.clone())
            .or_insert_with(|| self.spawn_worker(&event.service_name));
        if worker.queue.is_closed() {
            *worker = self.spawn_worker(&event.service_name);
        }

        let backlog = worker.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        if backlog == self.inner.backlog_warning + 1 {
            warn!(
                "Watchers of {} are falling behind ({} events queued)",
                event.service_name, backlog
            );
        }
        if worker.queue.send(event).is_err() {
            worker.backlog.fetch_sub(1, Ordering::SeqCst);
            debug!("Watch worker closed, dropping event");
        }
    }

    fn spawn_worker(&self, service_name: &str) -> Worker {
        let (queue, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let backlog = Arc::new(AtomicUsize::new(0));

        let set = self.clone();
        let cancel = self.inner.cancel.clone();
        let pending = backlog.clone();
        let service = service_name.to_string();
        self.inner.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            set.deliver(&event).await;
                            pending.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => break,
                    },
                }
            }
            debug!("Watch worker for {} stopped", service);
        });
        Worker { queue, backlog }
    }

    /// Call every listener of the event's service, in subscriber id order
    async fn deliver(&self, event: &ChangeEvent) {
        let subscriptions: Vec<(String, Arc<Subscription>)> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner());
            match subscribers.get(&event.service_name) {
                Some(service) => service
                    .iter()
                    .map(|(id, s)| (id.clone(), s.clone()))
                    .collect(),
                None => return,
            }
        };

        for (subscriber_id, subscription) in subscriptions {
            if subscription.last_seen_version.load(Ordering::SeqCst) >= event.version {
                continue;
            }

            let call = AssertUnwindSafe(subscription.listener.on_change(event)).catch_unwind();
            match call.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Watcher {} for {} failed on version {}: {}",
                    subscriber_id, event.service_name, event.version, e
                ),
                Err(_) => error!(
                    "Watcher {} for {} panicked on version {}",
                    subscriber_id, event.service_name, event.version
                ),
            }
            subscription
                .last_seen_version
                .fetch_max(event.version, Ordering::SeqCst);
        }
    }

    /// Drop all watchers
    pub fn clear(&self) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeKind;
    use std::time::Duration;

    fn event(service: &str, version: u64) -> ChangeEvent {
        ChangeEvent {
            service_name: service.to_string(),
            version,
            kind: ChangeKind::Registered {
                instance_id: format!("{service}-{version}"),
            },
            instances: Vec::new(),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn ChangeListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Arc::new(FnListener(move |e: &ChangeEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(e.version);
            Ok(())
        }));
        (seen, listener)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        let (seen, listener) = recorder();
        set.subscribe_as("v", "w1", listener, 0).unwrap();

        for version in [1, 2, 2, 1, 3] {
            tx.send(event("v", version)).unwrap();
        }
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_subscriber_rejected() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (_, listener) = recorder();
        set.subscribe_as("v", "w1", listener.clone(), 0).unwrap();
        let err = set.subscribe_as("v", "w1", listener.clone(), 0).unwrap_err();
        assert!(matches!(err, GatewayError::Duplicate(_)));
        // same id on another service is fine
        set.subscribe_as("other", "w1", listener, 0).unwrap();
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        let failing: Arc<dyn ChangeListener> =
            Arc::new(FnListener(|_: &ChangeEvent| -> anyhow::Result<()> { Err(anyhow::anyhow!("listener broke")) }));
        let panicking: Arc<dyn ChangeListener> =
            Arc::new(FnListener(|_: &ChangeEvent| -> anyhow::Result<()> { panic!("boom") }));
        let (seen, listener) = recorder();

        set.subscribe_as("v", "a-failing", failing, 0).unwrap();
        set.subscribe_as("v", "b-panicking", panicking, 0).unwrap();
        set.subscribe_as("v", "c-recording", listener, 0).unwrap();

        tx.send(event("v", 1)).unwrap();
        tx.send(event("v", 2)).unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        let (seen, listener) = recorder();
        let watcher = set.subscribe_as("v", "w1", listener, 0).unwrap();
        tx.send(event("v", 1)).unwrap();
        settle().await;

        assert!(set.unsubscribe(&watcher));
        assert!(!set.unsubscribe(&watcher));
        tx.send(event("v", 2)).unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(set.watcher_count("v"), 0);
    }

    #[tokio::test]
    async fn test_initial_version_filters_history() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        let (seen, listener) = recorder();
        set.subscribe_as("v", "late", listener, 4).unwrap();
        tx.send(event("v", 4)).unwrap();
        tx.send(event("v", 5)).unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }

    struct SlowListener(Duration);

    #[async_trait]
    impl ChangeListener for SlowListener {
        async fn on_change(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_service_does_not_stall_others() {
        let set = WatcherSet::new(1, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        set.subscribe_as("a", "slow", Arc::new(SlowListener(Duration::from_secs(2))), 0)
            .unwrap();
        let (seen, listener) = recorder();
        set.subscribe_as("b", "fast", listener, 0).unwrap();

        for version in 1..=4 {
            tx.send(event("a", version)).unwrap();
        }
        tx.send(event("b", 1)).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_worker_retired_with_last_watcher() {
        let set = WatcherSet::new(8, CancellationToken::new(), TaskTracker::new());
        let (tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        let (first, listener) = recorder();
        let watcher = set.subscribe_as("v", "w1", listener, 0).unwrap();
        tx.send(event("v", 1)).unwrap();
        settle().await;
        assert_eq!(set.worker_count(), 1);

        set.unsubscribe(&watcher);
        assert_eq!(set.worker_count(), 0);
        // unwatched services get no worker
        tx.send(event("v", 2)).unwrap();
        settle().await;
        assert_eq!(set.worker_count(), 0);

        let (second, listener) = recorder();
        set.subscribe_as("v", "w2", listener, 2).unwrap();
        tx.send(event("v", 3)).unwrap();
        settle().await;
        assert_eq!(*first.lock().unwrap(), vec![1]);
        assert_eq!(*second.lock().unwrap(), vec![3]);
        assert_eq!(set.worker_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatcher() {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let set = WatcherSet::new(8, cancel.clone(), tracker.clone());
        let (_tx, rx) = mpsc::unbounded_channel();
        set.spawn_dispatcher(rx);

        cancel.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .unwrap();
    }
}
