//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service registry
//!
//! The registry owns the canonical instance table of the process. Only
//! [`ServiceRegistry::register`], [`ServiceRegistry::deregister`],
//! [`ServiceRegistry::update_health`] and [`ServiceRegistry::update_metadata`]
//! change it. Writes that involve the coordination store are serialized by a
//! mutation lock and reach the table only once the store has accepted them.
//!
//! Every change that alters what a consumer sees bumps a per-service version
//! and enqueues a [`ChangeEvent`] while the table lock is held.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::backends::{CoordinationStore, StoreHealthEntry};
use super::watch::{ChangeListener, Watcher, WatcherSet};
use crate::clock::SharedClock;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::types::{
    ChangeEvent, ChangeKind, DeregisterReason, HealthCheckDescriptor, HealthRecord, HealthStatus,
    ProbeSpec, ServiceInstance, ServiceView,
};
use crate::GatewayResult;

/// Capacity of the registry-wide event bus
const EVENT_BUS_CAPACITY: usize = 1024;

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Deadline for each coordination store call
    pub store_timeout: Duration,

    /// Critical window before automatic removal
    pub deregister_after: Duration,

    /// Cadence of the reconcile loop
    pub reconcile_interval: Duration,

    /// Per-service watch backlog that triggers a warning
    pub watch_buffer: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
            watch_buffer: 64,
        }
    }
}

impl From<&GatewayConfig> for RegistrySettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            store_timeout: config.registry.store_timeout,
            deregister_after: config.registry.deregister_after,
            reconcile_interval: config.registry.reconcile_interval,
            watch_buffer: config.discovery.watch_buffer,
        }
    }
}

#[derive(Default)]
struct Table {
    instances: BTreeMap<String, ServiceView>,
    versions: HashMap<String, u64>,
    /// Instances registered through this process, as opposed to imported from the store
    owned: HashSet<String>,
}

impl Table {
    fn bump(&mut self, service_name: &str) -> u64 {
        let version = self.versions.entry(service_name.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    fn version(&self, service_name: &str) -> u64 {
        self.versions.get(service_name).copied().unwrap_or(0)
    }

    fn service(&self, service_name: &str) -> Vec<ServiceView> {
        let mut views: Vec<ServiceView> = self
            .instances
            .values()
            .filter(|v| v.service_name == service_name)
            .cloned()
            .collect();
        views.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        views
    }
}

struct CriticalTimer {
    generation: u64,
    token: CancellationToken,
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    clock: SharedClock,
    settings: RegistrySettings,
    table: RwLock<Table>,
    mutation: Mutex<()>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    bus: broadcast::Sender<ChangeEvent>,
    watchers: WatcherSet,
    pending_deregistrations: StdMutex<BTreeSet<String>>,
    timers: StdMutex<HashMap<String, CriticalTimer>>,
    timer_generation: std::sync::atomic::AtomicU64,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Service registry. Cloning is cheap and every clone shares state.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<Inner>,
}

/// Check identifiers and descriptor of an instance before registration
pub fn validate_instance(instance: &ServiceInstance) -> GatewayResult<()> {
    validate_name("instance_id", &instance.instance_id)?;
    validate_name("service_name", &instance.service_name)?;
    validate_descriptor(&instance.health_check)
}

fn validate_name(field: &str, value: &str) -> GatewayResult<()> {
    if value.is_empty() {
        return Err(GatewayError::InvalidInput(format!("{field} is required")));
    }
    if value.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(GatewayError::InvalidInput(format!(
            "{field} must not contain whitespace or '/': {value:?}"
        )));
    }
    Ok(())
}

fn validate_descriptor(descriptor: &HealthCheckDescriptor) -> GatewayResult<()> {
    if descriptor.probes.is_empty() {
        return Err(GatewayError::InvalidInput(
            "health_check must list at least one probe".to_string(),
        ));
    }
    for probe in &descriptor.probes {
        match probe {
            ProbeSpec::Http { path } | ProbeSpec::ResponseTime { path, .. } if !path.starts_with('/') => {
                return Err(GatewayError::InvalidInput(format!(
                    "probe path must start with '/': {path}"
                )));
            }
            ProbeSpec::Custom { name } if name.trim().is_empty() => {
                return Err(GatewayError::InvalidInput(
                    "custom probe requires a name".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

impl ServiceRegistry {
    /// Create a registry and start its watch dispatcher.
    ///
    /// Background work is tied to `cancel` and tracked by `tracker`.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: SharedClock,
        settings: RegistrySettings,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let watchers = WatcherSet::new(settings.watch_buffer, cancel.clone(), tracker.clone());
        watchers.spawn_dispatcher(rx);

        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                settings,
                table: RwLock::new(Table::default()),
                mutation: Mutex::new(()),
                events,
                bus,
                watchers,
                pending_deregistrations: StdMutex::new(BTreeSet::new()),
                timers: StdMutex::new(HashMap::new()),
                timer_generation: std::sync::atomic::AtomicU64::new(0),
                cancel,
                tracker,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    async fn store_call<T, F>(&self, operation: &str, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(self.inner.settings.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::StoreUnavailable(format!(
                "{} {} timed out after {:?}",
                self.inner.store.name(),
                operation,
                self.inner.settings.store_timeout
            ))),
        }
    }

    /// Queue an event for watchers and the event bus. Call with the table write lock held.
    fn emit(&self, table: &Table, service_name: &str, version: u64, kind: ChangeKind) {
        let event = ChangeEvent {
            service_name: service_name.to_string(),
            version,
            kind,
            instances: table.service(service_name),
        };
        debug!(
            service = %event.service_name,
            version = event.version,
            "Registry change: {:?}",
            event.kind
        );
        // no receivers is fine
        let _ = self.inner.bus.send(event.clone());
        if self.inner.events.send(event).is_err() {
            debug!("Watch dispatcher gone, change event dropped");
        }
    }

    /// Register or replace an instance.
    ///
    /// The store is written first; on failure the local table is untouched.
    pub async fn register(&self, instance: ServiceInstance) -> GatewayResult<ServiceView> {
        validate_instance(&instance)?;
        let _guard = self.inner.mutation.lock().await;

        let now = self.inner.clock.now();
        let instance = ServiceInstance {
            health: HealthRecord::unknown(),
            registered_at: now,
            last_seen_at: now,
            ..instance
        };

        self.store_call("register", self.inner.store.register(&instance))
            .await
            .map_err(|e| {
                warn!("Registration of {} rejected: {}", instance.instance_id, e);
                e
            })?;

        let view = ServiceView::new(instance);
        let id = view.instance_id.clone();
        let service = view.service_name.clone();

        let mut table = self.inner.table.write().await;
        let previous = table.instances.insert(id.clone(), view.clone());
        table.owned.insert(id.clone());
        self.cancel_critical_timer(&id);
        self.pending().remove(&id);

        if let Some(previous) = previous.filter(|p| p.service_name != service) {
            let version = table.bump(&previous.service_name);
            self.emit(
                &table,
                &previous.service_name,
                version,
                ChangeKind::Deregistered {
                    instance_id: id.clone(),
                    reason: DeregisterReason::Moved,
                },
            );
        }
        let version = table.bump(&service);
        self.emit(&table, &service, version, ChangeKind::Registered { instance_id: id.clone() });
        drop(table);

        info!(
            "Registered instance {} of {} at {} (version {})",
            id, service, view.endpoint, version
        );
        Ok(view)
    }

    /// Remove an instance. Succeeds when the instance is absent.
    ///
    /// When the store cannot be reached the local entry is still removed, the
    /// store call is queued for the reconcile loop, and `StoreUnavailable`
    /// is returned.
    pub async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        self.deregister_with_reason(instance_id, DeregisterReason::Requested)
            .await
    }

    async fn deregister_with_reason(
        &self,
        instance_id: &str,
        reason: DeregisterReason,
    ) -> GatewayResult<()> {
        let _guard = self.inner.mutation.lock().await;
        self.deregister_locked(instance_id, reason).await
    }

    /// Caller holds the mutation lock
    async fn deregister_locked(
        &self,
        instance_id: &str,
        reason: DeregisterReason,
    ) -> GatewayResult<()> {
        let store_result = self
            .store_call("deregister", self.inner.store.deregister(instance_id))
            .await;

        let removed = {
            let mut table = self.inner.table.write().await;
            let removed = table.instances.remove(instance_id);
            table.owned.remove(instance_id);
            self.cancel_critical_timer(instance_id);
            if let Some(view) = &removed {
                let version = table.bump(&view.service_name);
                self.emit(
                    &table,
                    &view.service_name,
                    version,
                    ChangeKind::Deregistered {
                        instance_id: instance_id.to_string(),
                        reason,
                    },
                );
            }
            removed
        };

        if let Some(view) = &removed {
            info!(
                "Deregistered instance {} of {} ({:?})",
                instance_id, view.service_name, reason
            );
        }

        match store_result {
            Ok(()) => {
                self.pending().remove(instance_id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Store deregistration of {} failed, will retry: {}",
                    instance_id, e
                );
                self.pending().insert(instance_id.to_string());
                Err(e)
            }
        }
    }

    /// Record a probe run. Emits a change event only when the status changes.
    pub async fn update_health(&self, instance_id: &str, record: HealthRecord) -> GatewayResult<()> {
        self.apply_health(instance_id, record, None).await
    }

    /// Like [`ServiceRegistry::update_health`], but a result checked against a
    /// registration that has since been replaced is discarded
    pub async fn update_health_if_current(
        &self,
        checked: &ServiceView,
        record: HealthRecord,
    ) -> GatewayResult<()> {
        self.apply_health(&checked.instance_id, record, Some(checked))
            .await
    }

    async fn apply_health(
        &self,
        instance_id: &str,
        record: HealthRecord,
        checked: Option<&ServiceView>,
    ) -> GatewayResult<()> {
        let mut table = self.inner.table.write().await;
        let current = table
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("instance {instance_id}")))?;
        if let Some(checked) = checked {
            if checked.registered_at != current.registered_at || checked.endpoint != current.endpoint {
                debug!("Discarding stale probe result for {}", instance_id);
                return Ok(());
            }
        }

        let from = current.status();
        let to = record.status;
        let mut updated = current.to_instance();
        if to != HealthStatus::Critical {
            let seen = record.checked_at.unwrap_or_else(|| self.inner.clock.now());
            updated.last_seen_at = seen.max(updated.registered_at);
        }
        updated.health = record;
        let service = updated.service_name.clone();
        table.instances.insert(instance_id.to_string(), ServiceView::new(updated));

        // timers only change while the table lock is held
        if to == HealthStatus::Critical {
            self.start_critical_timer(instance_id);
        } else if from == HealthStatus::Critical {
            self.cancel_critical_timer(instance_id);
        }
        if from == to {
            return Ok(());
        }

        let version = table.bump(&service);
        self.emit(
            &table,
            &service,
            version,
            ChangeKind::StatusChanged {
                instance_id: instance_id.to_string(),
                from,
                to,
            },
        );
        drop(table);

        if to == HealthStatus::Critical {
            warn!("Instance {} of {} is critical", instance_id, service);
        } else {
            info!("Instance {} of {} is now {}", instance_id, service, to);
        }
        Ok(())
    }

    /// Replace an instance's metadata in the store and locally
    pub async fn update_metadata(
        &self,
        instance_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> GatewayResult<ServiceView> {
        let _guard = self.inner.mutation.lock().await;

        let current = self.get(instance_id).await?;
        let mut updated = current.to_instance();
        updated.metadata = metadata;

        self.store_call("register", self.inner.store.register(&updated))
            .await?;

        let mut table = self.inner.table.write().await;
        // health may have moved on while the store call was in flight
        if let Some(latest) = table.instances.get(instance_id) {
            updated.health = latest.health.clone();
            updated.last_seen_at = latest.last_seen_at;
        } else {
            return Err(GatewayError::NotFound(format!("instance {instance_id}")));
        }
        let view = ServiceView::new(updated);
        let service = view.service_name.clone();
        table.instances.insert(instance_id.to_string(), view.clone());
        let version = table.bump(&service);
        self.emit(
            &table,
            &service,
            version,
            ChangeKind::MetadataUpdated {
                instance_id: instance_id.to_string(),
            },
        );
        Ok(view)
    }

    pub async fn get(&self, instance_id: &str) -> GatewayResult<ServiceView> {
        self.inner
            .table
            .read()
            .await
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("instance {instance_id}")))
    }

    /// Instances ordered by `(service_name, instance_id)`
    pub async fn list(&self, service_name: Option<&str>) -> Vec<ServiceView> {
        let table = self.inner.table.read().await;
        let mut views: Vec<ServiceView> = table
            .instances
            .values()
            .filter(|v| service_name.map_or(true, |name| v.service_name == name))
            .cloned()
            .collect();
        views.sort_by(|a, b| {
            (a.service_name.as_str(), a.instance_id.as_str())
                .cmp(&(b.service_name.as_str(), b.instance_id.as_str()))
        });
        views
    }

    /// Passing instances of a service; empty for unknown services
    pub async fn list_healthy(&self, service_name: &str) -> Vec<ServiceView> {
        self.healthy_snapshot(service_name).await.1
    }

    /// Passing instances together with the service version they belong to
    pub async fn healthy_snapshot(&self, service_name: &str) -> (u64, Vec<ServiceView>) {
        let table = self.inner.table.read().await;
        let healthy = table
            .service(service_name)
            .into_iter()
            .filter(|v| v.is_passing())
            .collect();
        (table.version(service_name), healthy)
    }

    pub async fn version(&self, service_name: &str) -> u64 {
        self.inner.table.read().await.version(service_name)
    }

    /// Distinct service names, sorted
    pub async fn service_names(&self) -> Vec<String> {
        let table = self.inner.table.read().await;
        let names: BTreeSet<String> = table
            .instances
            .values()
            .map(|v| v.service_name.clone())
            .collect();
        names.into_iter().collect()
    }

    /// Watch a service under a generated subscriber id
    pub async fn subscribe(
        &self,
        service_name: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> GatewayResult<Watcher> {
        let subscriber_id = uuid::Uuid::new_v4().to_string();
        self.subscribe_as(service_name, &subscriber_id, listener).await
    }

    /// Watch a service; at most one watcher per `(service_name, subscriber_id)`
    pub async fn subscribe_as(
        &self,
        service_name: &str,
        subscriber_id: &str,
        listener: Arc<dyn ChangeListener>,
    ) -> GatewayResult<Watcher> {
        validate_name("service_name", service_name)?;
        let table = self.inner.table.read().await;
        // holding the read lock keeps the version from moving underneath us
        self.inner.watchers.subscribe_as(
            service_name,
            subscriber_id,
            listener,
            table.version(service_name),
        )
    }

    pub fn unsubscribe(&self, watcher: &Watcher) -> bool {
        self.inner.watchers.unsubscribe(watcher)
    }

    /// Every change event of every service, best effort
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.bus.subscribe()
    }

    /// Deregistrations waiting for the store
    pub fn pending_deregistrations(&self) -> Vec<String> {
        self.pending().iter().cloned().collect()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.inner
            .pending_deregistrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn start_critical_timer(&self, instance_id: &str) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.contains_key(instance_id) {
            return;
        }
        let generation = self
            .inner
            .timer_generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let token = self.inner.cancel.child_token();
        timers.insert(
            instance_id.to_string(),
            CriticalTimer {
                generation,
                token: token.clone(),
            },
        );
        drop(timers);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = instance_id.to_string();
        let window = self.inner.settings.deregister_after;
        debug!("Critical timer started for {} ({:?})", id, window);
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    if let Some(inner) = weak.upgrade() {
                        ServiceRegistry { inner }.expire_critical(&id, generation).await;
                    }
                }
            }
        });
    }

    fn cancel_critical_timer(&self, instance_id: &str) {
        let timer = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        if let Some(timer) = timer {
            timer.token.cancel();
            debug!("Critical timer cancelled for {}", instance_id);
        }
    }

    async fn expire_critical(&self, instance_id: &str, generation: u64) {
        let _guard = self.inner.mutation.lock().await;
        {
            // lock order: table, then timers
            let table = self.inner.table.read().await;
            let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
            match timers.get(instance_id) {
                Some(timer) if timer.generation == generation => {
                    timers.remove(instance_id);
                }
                _ => return,
            }
            match table.instances.get(instance_id) {
                Some(view) if view.status() == HealthStatus::Critical => {}
                _ => return,
            }
        }

        warn!(
            "Instance {} critical for longer than {:?}, deregistering",
            instance_id, self.inner.settings.deregister_after
        );
        if let Err(e) = self
            .deregister_locked(instance_id, DeregisterReason::CriticalTimeout)
            .await
        {
            error!("Automatic deregistration of {} incomplete: {}", instance_id, e);
        }
    }

    /// Retry queued deregistrations. Returns how many are still pending.
    pub async fn reconcile(&self) -> usize {
        let pending = self.pending_deregistrations();
        for instance_id in pending {
            // a re-registration may have superseded it
            if self.inner.table.read().await.instances.contains_key(&instance_id) {
                self.pending().remove(&instance_id);
                continue;
            }
            match self
                .store_call("deregister", self.inner.store.deregister(&instance_id))
                .await
            {
                Ok(()) => {
                    info!("Reconciled pending deregistration of {}", instance_id);
                    self.pending().remove(&instance_id);
                }
                Err(e) => debug!("Deregistration of {} still pending: {}", instance_id, e),
            }
        }
        self.pending().len()
    }

    /// Mirror the store's view of a service: import instances registered by
    /// other gateways and drop imported ones the store no longer knows.
    pub async fn sync_from_store(&self, service_name: &str) -> GatewayResult<()> {
        let entries = self
            .store_call("health query", self.inner.store.health_by_name(service_name))
            .await?;
        let _guard = self.inner.mutation.lock().await;
        let pending: HashSet<String> = self.pending().iter().cloned().collect();
        let remote: HashMap<&str, &StoreHealthEntry> = entries
            .iter()
            .filter(|e| !pending.contains(&e.instance_id))
            .map(|e| (e.instance_id.as_str(), e))
            .collect();

        let mut table = self.inner.table.write().await;
        let now = self.inner.clock.now();

        for entry in remote.values() {
            if table.instances.contains_key(&entry.instance_id) {
                continue;
            }
            let mut instance = ServiceInstance::new(
                entry.instance_id.clone(),
                entry.service_name.clone(),
                entry.endpoint.clone(),
            );
            instance.tags = entry.tags.clone();
            instance.metadata = entry.metadata.clone();
            instance.registered_at = now;
            instance.last_seen_at = now;
            if validate_instance(&instance).is_err() {
                debug!("Skipping store entry {} with unusable id", entry.instance_id);
                continue;
            }
            table
                .instances
                .insert(entry.instance_id.clone(), ServiceView::new(instance));
            let version = table.bump(service_name);
            info!("Imported instance {} of {} from store", entry.instance_id, service_name);
            self.emit(
                &table,
                service_name,
                version,
                ChangeKind::Registered {
                    instance_id: entry.instance_id.clone(),
                },
            );
        }

        let vanished: Vec<String> = table
            .service(service_name)
            .iter()
            .filter(|v| !table.owned.contains(&v.instance_id))
            .filter(|v| !remote.contains_key(v.instance_id.as_str()))
            .map(|v| v.instance_id.clone())
            .collect();
        for instance_id in vanished {
            table.instances.remove(&instance_id);
            self.cancel_critical_timer(&instance_id);
            let version = table.bump(service_name);
            info!("Instance {} of {} left the store", instance_id, service_name);
            self.emit(
                &table,
                service_name,
                version,
                ChangeKind::Deregistered {
                    instance_id,
                    reason: DeregisterReason::Requested,
                },
            );
        }
        Ok(())
    }

    /// Run [`ServiceRegistry::reconcile`] and a store sync of every known
    /// service every `reconcile_interval` until cancelled.
    pub fn spawn_reconciler(&self) {
        let registry = self.clone();
        let cancel = self.inner.cancel.clone();
        let period = self.inner.settings.reconcile_interval;
        self.inner.tracker.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        registry.reconcile().await;
                        for service in registry.service_names().await {
                            if let Err(e) = registry.sync_from_store(&service).await {
                                debug!("Store sync of {} skipped: {}", service, e);
                            }
                        }
                    }
                }
            }
            debug!("Registry reconciler stopped");
        });
    }

    /// Deregister everything this process registered, bounded by `grace`
    pub async fn deregister_owned(&self, grace: Duration) -> usize {
        let owned: Vec<String> = {
            let table = self.inner.table.read().await;
            table.owned.iter().cloned().collect()
        };
        let total = owned.len();
        let work = async {
            let mut done = 0;
            for instance_id in owned {
                match self
                    .deregister_with_reason(&instance_id, DeregisterReason::Shutdown)
                    .await
                {
                    Ok(()) => done += 1,
                    Err(e) => warn!("Shutdown deregistration of {} failed: {}", instance_id, e),
                }
            }
            done
        };
        match tokio::time::timeout(grace, work).await {
            Ok(done) => {
                info!("Deregistered {}/{} owned instances", done, total);
                done
            }
            Err(_) => {
                warn!("Shutdown deregistration exceeded grace period of {:?}", grace);
                0
            }
        }
    }

    /// Stop timers and drop watchers. Background tasks end with the shared cancellation token.
    pub fn close(&self) {
        let timers: Vec<CriticalTimer> = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, t)| t)
            .collect();
        for timer in timers {
            timer.token.cancel();
        }
        self.inner.watchers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::discovery::backends::MemoryStore;
    use crate::discovery::watch::FnListener;
    use crate::types::Endpoint;
    use async_trait::async_trait;
    use mockall::mock;

    mock! {
        Store {}

        #[async_trait]
        impl CoordinationStore for Store {
            fn name(&self) -> &'static str;
            async fn ping(&self) -> GatewayResult<()>;
            async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()>;
            async fn deregister(&self, instance_id: &str) -> GatewayResult<()>;
            async fn health_by_name(&self, service_name: &str) -> GatewayResult<Vec<StoreHealthEntry>>;
            async fn kv_get(&self, key: &str) -> GatewayResult<Option<String>>;
            async fn kv_put(&self, key: &str, value: &str) -> GatewayResult<()>;
            async fn kv_delete(&self, key: &str) -> GatewayResult<()>;
        }
    }

    fn settings() -> RegistrySettings {
        RegistrySettings {
            store_timeout: Duration::from_secs(1),
            deregister_after: Duration::from_secs(3),
            reconcile_interval: Duration::from_secs(10),
            watch_buffer: 16,
        }
    }

    fn registry_with(store: Arc<dyn CoordinationStore>) -> ServiceRegistry {
        ServiceRegistry::new(
            store,
            system_clock(),
            settings(),
            CancellationToken::new(),
            TaskTracker::new(),
        )
    }

    fn memory_registry() -> (ServiceRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (registry_with(store.clone()), store)
    }

    fn instance(id: &str, service: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(id, service, Endpoint::new("127.0.0.1", port))
    }

    fn record(status: HealthStatus) -> HealthRecord {
        HealthRecord::with_status(status, chrono::Utc::now())
    }

    fn recorder() -> (Arc<StdMutex<Vec<ChangeEvent>>>, Arc<dyn ChangeListener>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Arc::new(FnListener(move |e: &ChangeEvent| -> anyhow::Result<()> {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        }));
        (seen, listener)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_register_stamps_and_lists() {
        let (registry, store) = memory_registry();
        let mut input = instance("b", "users", 9002);
        input.health = record(HealthStatus::Passing);
        registry.register(input).await.unwrap();
        registry.register(instance("a", "users", 9001)).await.unwrap();
        registry.register(instance("z", "orders", 9003)).await.unwrap();

        let view = registry.get("b").await.unwrap();
        assert_eq!(view.status(), HealthStatus::Unknown);
        assert!(view.last_seen_at >= view.registered_at);
        assert!(store.is_registered("b"));

        let ids: Vec<_> = registry
            .list(None)
            .await
            .iter()
            .map(|v| v.instance_id.clone())
            .collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
        assert_eq!(registry.list(Some("users")).await.len(), 2);
        assert_eq!(registry.version("users").await, 2);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let (registry, _) = memory_registry();
        let err = registry.register(instance("", "users", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
        assert!(registry.register(instance("a b", "users", 1)).await.is_err());
        assert!(registry.register(instance("a", "us/ers", 1)).await.is_err());
        assert!(registry
            .register(instance("a", "users", 1).with_probes(vec![]))
            .await
            .is_err());
        assert!(registry.list(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_leaves_local_state_untouched() {
        let mut store = MockStore::new();
        store.expect_name().return_const("mock");
        store
            .expect_register()
            .returning(|_| Err(GatewayError::StoreUnavailable("down".into())));
        let registry = registry_with(Arc::new(store));

        let err = registry.register(instance("a", "users", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
        assert!(registry.get("a").await.is_err());
        assert_eq!(registry.version("users").await, 0);
    }

    #[tokio::test]
    async fn test_store_duplicate_is_propagated() {
        let mut store = MockStore::new();
        store.expect_name().return_const("mock");
        store
            .expect_register()
            .returning(|_| Err(GatewayError::Duplicate("taken".into())));
        let registry = registry_with(Arc::new(store));
        let err = registry.register(instance("a", "users", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_deregister_idempotent_and_round_trip() {
        let (registry, store) = memory_registry();
        registry.register(instance("a", "users", 1)).await.unwrap();
        registry.deregister("a").await.unwrap();
        registry.deregister("a").await.unwrap();
        assert!(registry.get("a").await.is_err());
        assert!(!store.is_registered("a"));

        let again = instance("a", "users", 2).with_tag("v2");
        registry.register(again).await.unwrap();
        let view = registry.get("a").await.unwrap();
        assert_eq!(view.endpoint.port, 2);
        assert!(view.tags.contains("v2"));
    }

    #[tokio::test]
    async fn test_deregister_with_store_down_queues_reconcile() {
        let (registry, store) = memory_registry();
        registry.register(instance("a", "users", 1)).await.unwrap();

        store.set_online(false);
        let err = registry.deregister("a").await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
        assert!(registry.get("a").await.is_err());
        assert_eq!(registry.pending_deregistrations(), vec!["a".to_string()]);

        assert_eq!(registry.reconcile().await, 1);
        store.set_online(true);
        assert_eq!(registry.reconcile().await, 0);
        assert!(!store.is_registered("a"));
    }

    #[tokio::test]
    async fn test_slow_store_times_out() {
        let mut store = MockStore::new();
        store.expect_name().return_const("mock");
        store.expect_register().returning(|_| Ok(()));
        let registry = ServiceRegistry::new(
            Arc::new(SlowStore(store)),
            system_clock(),
            RegistrySettings {
                store_timeout: Duration::from_millis(20),
                ..settings()
            },
            CancellationToken::new(),
            TaskTracker::new(),
        );
        let err = registry.register(instance("a", "users", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
    }

    struct SlowStore(MockStore);

    #[async_trait]
    impl CoordinationStore for SlowStore {
        fn name(&self) -> &'static str {
            self.0.name()
        }
        async fn ping(&self) -> GatewayResult<()> {
            self.0.ping().await
        }
        async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.0.register(instance).await
        }
        async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
            self.0.deregister(instance_id).await
        }
        async fn health_by_name(&self, service_name: &str) -> GatewayResult<Vec<StoreHealthEntry>> {
            self.0.health_by_name(service_name).await
        }
        async fn kv_get(&self, key: &str) -> GatewayResult<Option<String>> {
            self.0.kv_get(key).await
        }
        async fn kv_put(&self, key: &str, value: &str) -> GatewayResult<()> {
            self.0.kv_put(key, value).await
        }
        async fn kv_delete(&self, key: &str) -> GatewayResult<()> {
            self.0.kv_delete(key).await
        }
    }

    #[tokio::test]
    async fn test_update_health_transitions_only() {
        let (registry, _) = memory_registry();
        registry.register(instance("a", "users", 1)).await.unwrap();
        let (seen, listener) = recorder();
        registry.subscribe("users", listener).await.unwrap();

        registry.update_health("a", record(HealthStatus::Passing)).await.unwrap();
        registry.update_health("a", record(HealthStatus::Passing)).await.unwrap();
        registry.update_health("a", record(HealthStatus::Passing)).await.unwrap();
        settle().await;

        let events = seen.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].kind,
            ChangeKind::StatusChanged { from: HealthStatus::Unknown, to: HealthStatus::Passing, .. }
        ));
        assert_eq!(registry.list_healthy("users").await.len(), 1);

        let err = registry
            .update_health("missing", record(HealthStatus::Passing))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_result_for_replaced_registration_is_discarded() {
        let (registry, _) = memory_registry();
        let checked = registry.register(instance("a", "users", 1)).await.unwrap();
        registry.register(instance("a", "users", 2)).await.unwrap();

        registry
            .update_health_if_current(&checked, record(HealthStatus::Passing))
            .await
            .unwrap();
        let view = registry.get("a").await.unwrap();
        assert_eq!(view.endpoint.port, 2);
        assert_eq!(view.status(), HealthStatus::Unknown);

        let current = registry.get("a").await.unwrap();
        registry
            .update_health_if_current(&current, record(HealthStatus::Passing))
            .await
            .unwrap();
        assert_eq!(registry.get("a").await.unwrap().status(), HealthStatus::Passing);
    }

    #[tokio::test]
    async fn test_list_healthy_subset_of_list() {
        let (registry, _) = memory_registry();
        for (id, status) in [
            ("a", HealthStatus::Passing),
            ("b", HealthStatus::Warning),
            ("c", HealthStatus::Critical),
            ("d", HealthStatus::Passing),
        ] {
            registry.register(instance(id, "svc", 1)).await.unwrap();
            registry.update_health(id, record(status)).await.unwrap();
        }
        let all: Vec<_> = registry.list(Some("svc")).await;
        let healthy = registry.list_healthy("svc").await;
        assert_eq!(healthy.len(), 2);
        assert!(healthy.iter().all(|h| all.iter().any(|a| a.instance_id == h.instance_id)));
        assert!(registry.list_healthy("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_sees_increasing_versions() {
        let (registry, _) = memory_registry();
        let (seen, listener) = recorder();
        registry.subscribe_as("v", "sub-1", listener.clone()).await.unwrap();
        assert!(registry.subscribe_as("v", "sub-1", listener).await.is_err());

        registry.register(instance("v1", "v", 1)).await.unwrap();
        registry.deregister("v1").await.unwrap();
        settle().await;

        let events = seen.lock().unwrap().clone();
        let versions: Vec<u64> = events.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(events[0].instances.len(), 1);
        assert!(events[1].instances.is_empty());
    }

    #[tokio::test]
    async fn test_moving_instance_notifies_old_service() {
        let (registry, _) = memory_registry();
        let (old_seen, old_listener) = recorder();
        registry.register(instance("a", "old", 1)).await.unwrap();
        registry.subscribe("old", old_listener).await.unwrap();

        registry.register(instance("a", "new", 1)).await.unwrap();
        settle().await;

        assert!(registry.list(Some("old")).await.is_empty());
        assert_eq!(registry.list(Some("new")).await.len(), 1);
        let events = old_seen.lock().unwrap().clone();
        assert!(matches!(
            events[0].kind,
            ChangeKind::Deregistered { reason: DeregisterReason::Moved, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_instance_deregistered_after_window() {
        let (registry, store) = memory_registry();
        registry.register(instance("c", "img", 1)).await.unwrap();
        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.get("c").await.is_ok());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.get("c").await.is_err());
        assert!(!store.is_registered("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cancels_critical_timer() {
        let (registry, _) = memory_registry();
        registry.register(instance("c", "img", 1)).await.unwrap();
        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        registry.update_health("c", record(HealthStatus::Passing)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // critical again: a fresh window starts
        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.get("c").await.is_ok());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.get("c").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_does_not_block_next_window() {
        let (registry, _) = memory_registry();
        registry.register(instance("c", "img", 1)).await.unwrap();
        registry.update_health("c", record(HealthStatus::Passing)).await.unwrap();

        // armed for an instance that recovered before the window ended
        registry.start_critical_timer("c");
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(registry.get("c").await.is_ok());
        assert!(registry.inner.timers.lock().unwrap().is_empty());

        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(registry.get("c").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_critical_report_rearms_lost_timer() {
        let (registry, _) = memory_registry();
        registry.register(instance("c", "img", 1)).await.unwrap();
        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();
        registry.cancel_critical_timer("c");

        registry.update_health("c", record(HealthStatus::Critical)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(registry.get("c").await.is_err());
    }

    #[tokio::test]
    async fn test_update_metadata() {
        let (registry, _) = memory_registry();
        registry
            .register(instance("a", "users", 1).with_metadata("zone", "a"))
            .await
            .unwrap();
        registry.update_health("a", record(HealthStatus::Passing)).await.unwrap();
        let before = registry.version("users").await;

        let mut meta = BTreeMap::new();
        meta.insert("zone".to_string(), "b".to_string());
        let view = registry.update_metadata("a", meta).await.unwrap();
        assert_eq!(view.metadata.get("zone").map(String::as_str), Some("b"));
        assert_eq!(view.status(), HealthStatus::Passing);
        assert_eq!(registry.version("users").await, before + 1);

        assert!(registry.update_metadata("missing", BTreeMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_imports_and_drops_remote_instances() {
        let (registry, store) = memory_registry();
        registry.register(instance("local", "users", 1)).await.unwrap();
        // registered by another gateway
        store.register(&instance("remote", "users", 2)).await.unwrap();

        registry.sync_from_store("users").await.unwrap();
        assert_eq!(registry.list(Some("users")).await.len(), 2);

        store.deregister("remote").await.unwrap();
        registry.sync_from_store("users").await.unwrap();
        let ids: Vec<_> = registry
            .list(Some("users"))
            .await
            .iter()
            .map(|v| v.instance_id.clone())
            .collect();
        assert_eq!(ids, vec!["local"]);
    }

    #[tokio::test]
    async fn test_deregister_owned_on_shutdown() {
        let (registry, store) = memory_registry();
        registry.register(instance("a", "users", 1)).await.unwrap();
        registry.register(instance("b", "users", 2)).await.unwrap();
        let done = registry.deregister_owned(Duration::from_secs(1)).await;
        assert_eq!(done, 2);
        assert_eq!(store.registered_count(), 0);
        assert!(registry.list(None).await.is_empty());
    }
}
