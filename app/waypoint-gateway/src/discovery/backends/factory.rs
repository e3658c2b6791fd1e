//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Coordination store factory

use std::sync::Arc;
use tracing::info;

use super::consul::{ConsulCheckSettings, ConsulStore};
use super::memory::MemoryStore;
use super::trait_def::CoordinationStore;
use crate::config::{GatewayConfig, RegistryBackend};
use crate::GatewayResult;

/// Build the store selected by `registry.backend`
pub fn create_store(config: &GatewayConfig) -> GatewayResult<Arc<dyn CoordinationStore>> {
    match config.registry.backend {
        RegistryBackend::Consul => {
            let checks = ConsulCheckSettings {
                interval: config.health.interval,
                timeout: config.health.timeout,
                deregister_critical_after: config.registry.deregister_after,
            };
            let store = ConsulStore::new(
                &config.registry.store_address,
                config.registry.store_token.clone(),
                config.registry.store_timeout,
                checks,
            )?;
            info!("Using Consul coordination store at {}", config.registry.store_address);
            Ok(Arc::new(store))
        }
        RegistryBackend::Memory => {
            info!("Using in-memory coordination store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
