//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Instance selection

use dashmap::DashMap;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::clock::SharedClock;
use crate::error::GatewayError;
use crate::types::{SelectionPolicy, ServiceView};
use crate::GatewayResult;

/// Picks one passing instance out of a service's healthy list
pub struct InstanceSelector {
    clock: SharedClock,
    default_policy: SelectionPolicy,
    round_robin_counters: DashMap<String, Arc<AtomicUsize>>,
    last_used: DashMap<String, Instant>,
}

impl InstanceSelector {
    pub fn new(clock: SharedClock, default_policy: SelectionPolicy) -> Self {
        Self {
            clock,
            default_policy,
            round_robin_counters: DashMap::new(),
            last_used: DashMap::new(),
        }
    }

    pub fn default_policy(&self) -> SelectionPolicy {
        self.default_policy
    }

    /// Select from `instances` using the default policy
    pub fn select(&self, service_name: &str, instances: &[ServiceView]) -> GatewayResult<ServiceView> {
        self.select_with(service_name, instances, &HashSet::new(), self.default_policy)
    }

    /// Select from `instances`, skipping ids in `excluded`.
    ///
    /// Only passing instances are candidates. Candidates are ordered by
    /// instance id, so ties resolve the same way on every call.
    pub fn select_with(
        &self,
        service_name: &str,
        instances: &[ServiceView],
        excluded: &HashSet<String>,
        policy: SelectionPolicy,
    ) -> GatewayResult<ServiceView> {
        let mut candidates: Vec<&ServiceView> = instances
            .iter()
            .filter(|v| v.is_passing() && !excluded.contains(&v.instance_id))
            .collect();
        if candidates.is_empty() {
            return Err(GatewayError::NoHealthyInstances(service_name.to_string()));
        }
        candidates.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let index = match policy {
            SelectionPolicy::RoundRobin => self.next_round_robin(service_name) % candidates.len(),
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionPolicy::LeastRecentlyUsed => self.least_recently_used(&candidates),
        };

        let chosen = candidates[index].clone();
        self.last_used
            .insert(chosen.instance_id.clone(), self.clock.monotonic());
        debug!(
            "Selected {} for {} ({:?}, {} candidates)",
            chosen.instance_id,
            service_name,
            policy,
            candidates.len()
        );
        Ok(chosen)
    }

    fn next_round_robin(&self, service_name: &str) -> usize {
        let counter = self
            .round_robin_counters
            .entry(service_name.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed)
    }

    fn least_recently_used(&self, candidates: &[&ServiceView]) -> usize {
        // never-used sorts first; equal keys keep instance id order
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| self.last_used.get(&c.instance_id).map(|t| *t))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    /// Drop selection state of instances that left the registry
    pub fn forget(&self, instance_id: &str) {
        self.last_used.remove(instance_id);
    }
}
