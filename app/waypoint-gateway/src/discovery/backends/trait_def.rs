//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Coordination store trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Endpoint, HealthStatus, ServiceInstance};
use crate::GatewayResult;

/// An instance as the store reports it, with the store's own health view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHealthEntry {
    pub instance_id: String,
    pub service_name: String,
    pub endpoint: Endpoint,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,

    /// Aggregated store-side status: passing, warning or critical
    pub status: HealthStatus,
}

/// External store that durably holds registrations and dynamic configuration
///
/// Transport failures are reported as `GatewayError::StoreUnavailable`;
/// a store-side rejection of a registration as `GatewayError::Duplicate`
/// or `GatewayError::InvalidInput`.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Cheap reachability check
    async fn ping(&self) -> GatewayResult<()>;

    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()>;

    /// Succeeds when the instance is already absent
    async fn deregister(&self, instance_id: &str) -> GatewayResult<()>;

    async fn health_by_name(&self, service_name: &str) -> GatewayResult<Vec<StoreHealthEntry>>;

    async fn kv_get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn kv_put(&self, key: &str, value: &str) -> GatewayResult<()>;

    async fn kv_delete(&self, key: &str) -> GatewayResult<()>;
}
