//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Core service discovery implementation

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::cache::DiscoveryCache;
use super::registry::ServiceRegistry;
use crate::clock::SharedClock;
use crate::config::DiscoveryConfig;
use crate::load_balancer::InstanceSelector;
use crate::types::{ChangeKind, SelectionPolicy, ServiceView};
use crate::GatewayResult;

/// Service discovery for the gateway: cached healthy lists plus instance selection
pub struct ServiceDiscovery {
    registry: ServiceRegistry,
    cache: DiscoveryCache,
    selector: InstanceSelector,
}

impl ServiceDiscovery {
    pub fn new(registry: ServiceRegistry, clock: SharedClock, config: &DiscoveryConfig) -> Self {
        let cache = DiscoveryCache::new(registry.clone(), clock.clone(), config.cache_ttl);
        let selector = InstanceSelector::new(clock, config.selection_policy);
        Self {
            registry,
            cache,
            selector,
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    pub fn default_policy(&self) -> SelectionPolicy {
        self.selector.default_policy()
    }

    /// Drop cache entries and selection state as instances leave
    pub fn start(self: &Arc<Self>, cancel: CancellationToken, tracker: &TaskTracker) {
        let discovery = Arc::clone(self);
        let mut events = self.registry.events();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            discovery.cache.invalidate(&event.service_name);
                            if let ChangeKind::Deregistered { instance_id, .. } = &event.kind {
                                discovery.selector.forget(instance_id);
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Discovery fell behind by {} registry events", skipped);
                            discovery.cache.clear();
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Discovery event loop stopped");
        });
        info!("Service discovery started");
    }

    /// Healthy instances of a service, possibly from cache
    pub async fn healthy(&self, service_name: &str) -> Arc<Vec<ServiceView>> {
        self.cache.healthy(service_name).await
    }

    /// Select an instance with the configured policy
    pub async fn select(&self, service_name: &str) -> GatewayResult<ServiceView> {
        self.select_excluding(service_name, &HashSet::new(), self.default_policy())
            .await
    }

    /// Select an instance not in `excluded`
    pub async fn select_excluding(
        &self,
        service_name: &str,
        excluded: &HashSet<String>,
        policy: SelectionPolicy,
    ) -> GatewayResult<ServiceView> {
        let instances = self.cache.healthy(service_name).await;
        self.selector
            .select_with(service_name, &instances, excluded, policy)
    }
}
