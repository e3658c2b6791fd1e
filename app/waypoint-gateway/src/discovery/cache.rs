//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Discovery cache
//!
//! Healthy instance lists per service, refreshed from the registry. An entry
//! is served while it is younger than its TTL and was loaded at the
//! registry's current version for the service; a change event bumps that
//! version, so a changed service misses on its next lookup.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::registry::ServiceRegistry;
use crate::clock::SharedClock;
use crate::types::ServiceView;

/// Cached healthy list of one service
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub service_name: String,
    pub instances: Arc<Vec<ServiceView>>,
    /// Registry version the entry was loaded at
    pub version: u64,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant, current_version: u64) -> bool {
        self.version == current_version && now.saturating_duration_since(self.inserted_at) <= self.ttl
    }
}

/// Cache of healthy instance lists keyed by service name
pub struct DiscoveryCache {
    registry: ServiceRegistry,
    clock: SharedClock,
    ttl: Duration,
    entries: DashMap<String, CacheEntry>,
    loaders: DashMap<String, Arc<Mutex<()>>>,
    loads: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(registry: ServiceRegistry, clock: SharedClock, ttl: Duration) -> Self {
        Self {
            registry,
            clock,
            ttl,
            entries: DashMap::new(),
            loaders: DashMap::new(),
            loads: AtomicU64::new(0),
        }
    }

    /// Healthy instances of `service_name`, sorted by instance id.
    ///
    /// Concurrent misses for one service share a single registry load.
    pub async fn healthy(&self, service_name: &str) -> Arc<Vec<ServiceView>> {
        if let Some(instances) = self.lookup(service_name).await {
            return instances;
        }

        let loader = self
            .loaders
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = loader.lock().await;
        let instances = self.load(service_name).await;
        drop(guard);

        // nobody else is waiting on this loader
        self.loaders
            .remove_if(service_name, |_, l| Arc::strong_count(l) <= 2);
        instances
    }

    async fn load(&self, service_name: &str) -> Arc<Vec<ServiceView>> {
        // another caller may have finished the load while we waited
        if let Some(instances) = self.lookup(service_name).await {
            return instances;
        }

        let (version, instances) = self.registry.healthy_snapshot(service_name).await;
        self.loads.fetch_add(1, Ordering::Relaxed);
        let instances = Arc::new(instances);
        debug!(
            "Loaded {} healthy instances of {} at version {}",
            instances.len(),
            service_name,
            version
        );
        // names the registry has never seen are not cached
        if version > 0 {
            self.entries.insert(
                service_name.to_string(),
                CacheEntry {
                    service_name: service_name.to_string(),
                    instances: instances.clone(),
                    version,
                    inserted_at: self.clock.monotonic(),
                    ttl: self.ttl,
                },
            );
        }
        instances
    }

    async fn lookup(&self, service_name: &str) -> Option<Arc<Vec<ServiceView>>> {
        let current_version = self.registry.version(service_name).await;
        let now = self.clock.monotonic();
        let entry = self.entries.get(service_name)?;
        if entry.is_fresh(now, current_version) {
            Some(entry.instances.clone())
        } else {
            None
        }
    }

    pub fn invalidate(&self, service_name: &str) {
        self.entries.remove(service_name);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registry loads performed so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}
