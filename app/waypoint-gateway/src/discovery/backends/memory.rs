//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! In-process coordination store

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::trait_def::{CoordinationStore, StoreHealthEntry};
use crate::error::GatewayError;
use crate::types::{HealthStatus, ServiceInstance};
use crate::GatewayResult;

/// Store kept in memory. Registrations are visible to this process only.
///
/// It can be switched offline to exercise store-failure paths.
#[derive(Debug)]
pub struct MemoryStore {
    services: DashMap<String, ServiceInstance>,
    kv: DashMap<String, String>,
    online: AtomicBool,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            kv: DashMap::new(),
            online: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate the store going away or coming back
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.services.contains_key(instance_id)
    }

    pub fn registered_count(&self) -> usize {
        self.services.len()
    }

    /// Number of calls made against the store, successful or not
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> GatewayResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::StoreUnavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> GatewayResult<()> {
        self.check_online()
    }

    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        self.check_online()?;
        self.services
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        self.check_online()?;
        self.services.remove(instance_id);
        Ok(())
    }

    async fn health_by_name(&self, service_name: &str) -> GatewayResult<Vec<StoreHealthEntry>> {
        self.check_online()?;
        let mut entries: Vec<StoreHealthEntry> = self
            .services
            .iter()
            .filter(|e| e.service_name == service_name)
            .map(|e| StoreHealthEntry {
                instance_id: e.instance_id.clone(),
                service_name: e.service_name.clone(),
                endpoint: e.endpoint.clone(),
                tags: e.tags.clone(),
                metadata: e.metadata.clone(),
                // nothing checks instances here; presence counts as alive
                status: HealthStatus::Passing,
            })
            .collect();
        entries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(entries)
    }

    async fn kv_get(&self, key: &str) -> GatewayResult<Option<String>> {
        self.check_online()?;
        Ok(self.kv.get(key).map(|v| v.value().clone()))
    }

    async fn kv_put(&self, key: &str, value: &str) -> GatewayResult<()> {
        self.check_online()?;
        self.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> GatewayResult<()> {
        self.check_online()?;
        self.kv.remove(key);
        Ok(())
    }
}
