//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Health checking
//!
//! One scheduler per process. Every tick it lists registered instances and
//! spawns one probe task per instance that is not already being probed.
//! Tasks run behind a semaphore of `max_parallel_probes` permits, so the
//! scheduler never waits on a probe. Results go back through
//! [`HealthSink::record_health`].

use async_trait::async_trait;
use dashmap::DashSet;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::discovery::health::ProbeRunner;
use crate::discovery::ServiceRegistry;
use crate::error::GatewayError;
use crate::types::{ChangeEvent, ChangeKind, HealthRecord, ServiceView};
use crate::GatewayResult;

/// Instances to probe
#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn instances(&self, service_name: Option<&str>) -> Vec<ServiceView>;
}

/// Where probe results are written
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// `checked` is the registration the probe ran against
    async fn record_health(&self, checked: &ServiceView, record: HealthRecord) -> GatewayResult<()>;
}

#[async_trait]
impl InstanceSource for ServiceRegistry {
    async fn instances(&self, service_name: Option<&str>) -> Vec<ServiceView> {
        self.list(service_name).await
    }
}

#[async_trait]
impl HealthSink for ServiceRegistry {
    async fn record_health(&self, checked: &ServiceView, record: HealthRecord) -> GatewayResult<()> {
        self.update_health_if_current(checked, record).await
    }
}

/// Health checker settings
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub interval: Duration,
    pub jitter_fraction: f64,
    pub max_parallel_probes: usize,
}

impl From<&HealthConfig> for CheckerSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval,
            jitter_fraction: config.jitter_fraction,
            max_parallel_probes: config.max_parallel_probes.max(1),
        }
    }
}

/// Periodic prober of registered instances
pub struct HealthChecker {
    source: Arc<dyn InstanceSource>,
    sink: Arc<dyn HealthSink>,
    runner: Arc<ProbeRunner>,
    settings: CheckerSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashSet<String>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl HealthChecker {
    pub fn new(
        source: Arc<dyn InstanceSource>,
        sink: Arc<dyn HealthSink>,
        runner: Arc<ProbeRunner>,
        settings: CheckerSettings,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_parallel_probes.max(1)));
        Self {
            source,
            sink,
            runner,
            settings,
            permits,
            in_flight: Arc::new(DashSet::new()),
            cancel,
            tracker,
        }
    }

    /// Checker over a registry, which is both the instance source and the sink
    pub fn for_registry(
        registry: &ServiceRegistry,
        runner: Arc<ProbeRunner>,
        config: &HealthConfig,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        let registry = Arc::new(registry.clone());
        Self::new(
            registry.clone(),
            registry,
            runner,
            CheckerSettings::from(config),
            cancel,
            tracker,
        )
    }

    pub fn runner(&self) -> &Arc<ProbeRunner> {
        &self.runner
    }

    /// Start the periodic scheduler. When `events` is given, newly
    /// registered instances are probed right away instead of at the next tick.
    pub fn start(self: &Arc<Self>, events: Option<broadcast::Receiver<ChangeEvent>>) {
        let checker = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut ticker = interval(checker.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Health checker started with interval: {:?}",
                checker.settings.interval
            );
            loop {
                tokio::select! {
                    _ = checker.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let instances = checker.source.instances(None).await;
                        debug!("Health tick over {} instances", instances.len());
                        for instance in instances {
                            checker.schedule(instance, true);
                        }
                    }
                }
            }
            info!("Health checker stopped");
        });

        if let Some(mut events) = events {
            let checker = Arc::clone(self);
            self.tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = checker.cancel.cancelled() => break,
                        event = events.recv() => match event {
                            Ok(event) => {
                                if let ChangeKind::Registered { instance_id } = &event.kind {
                                    if let Some(view) = event.instances.iter().find(|v| &v.instance_id == instance_id) {
                                        checker.schedule(view.clone(), false);
                                    }
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                debug!("Health checker skipped {} registry events", skipped);
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            });
        }
    }

    /// Cancel the scheduler and every in-flight probe
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn jitter(&self) -> Duration {
        let fraction = self.settings.jitter_fraction;
        if fraction <= 0.0 {
            return Duration::ZERO;
        }
        let factor = rand::thread_rng().gen_range(0.0..fraction);
        self.settings.interval.mul_f64(factor)
    }

    fn schedule(self: &Arc<Self>, instance: ServiceView, jitter: bool) {
        if self.cancel.is_cancelled() || !self.in_flight.insert(instance.instance_id.clone()) {
            return;
        }
        let checker = Arc::clone(self);
        let delay = if jitter { self.jitter() } else { Duration::ZERO };
        self.tracker.spawn(async move {
            let instance_id = instance.instance_id.clone();
            tokio::select! {
                _ = checker.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    checker.probe_and_record(&instance).await;
                }
            }
            checker.in_flight.remove(&instance_id);
        });
    }

    async fn probe_and_record(&self, instance: &ServiceView) -> Option<HealthRecord> {
        let _permit = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            permit = self.permits.acquire() => permit.ok()?,
        };
        let record = self.runner.run(instance, &self.cancel).await?;
        match self
            .sink
            .record_health(instance, record.clone())
            .await
        {
            Ok(()) => {}
            // deregistered while the probe ran
            Err(GatewayError::NotFound(_)) => {
                debug!("Instance {} left before its probe finished", instance.instance_id)
            }
            Err(e) => warn!("Failed to record health of {}: {}", instance.instance_id, e),
        }
        Some(record)
    }

    /// Probe every instance of a service now and record the results
    pub async fn check_service(&self, service_name: &str) -> Vec<(String, HealthRecord)> {
        let instances = self.source.instances(Some(service_name)).await;
        let runs = instances.iter().map(|instance| async move {
            self.probe_and_record(instance)
                .await
                .map(|record| (instance.instance_id.clone(), record))
        });
        futures::future::join_all(runs)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
