//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Gateway state management

use crate::{
    config::GatewayConfig,
    types::{GatewayInfo, GatewayStatus},
};
use chrono::Utc;
use tokio::sync::RwLock;

/// Gateway state
#[derive(Debug)]
pub struct GatewayState {
    gateway_info: RwLock<GatewayInfo>,
}

impl GatewayState {
    /// Create a new gateway state
    pub fn new(config: &GatewayConfig) -> Self {
        let gateway_info = GatewayInfo {
            gateway_id: config.gateway.gateway_id.clone(),
            service: config.gateway.service_name.clone(),
            status: GatewayStatus::Starting,
            version: crate::GATEWAY_VERSION.to_string(),
            listen_address: config.gateway.bind_address(),
            api_prefix: config.gateway.api_prefix.clone(),
            path_prefix_segments: config.gateway.path_prefix_segments,
            started_at: None,
        };

        Self {
            gateway_info: RwLock::new(gateway_info),
        }
    }

    /// Get gateway information
    pub async fn info(&self) -> GatewayInfo {
        self.gateway_info.read().await.clone()
    }

    /// Set gateway status. Entering `Running` stamps the start time.
    pub async fn set_status(&self, status: GatewayStatus) {
        let mut info = self.gateway_info.write().await;
        if status == GatewayStatus::Running && info.started_at.is_none() {
            info.started_at = Some(Utc::now());
        }
        info.status = status;
    }

    /// Get gateway status
    pub async fn status(&self) -> GatewayStatus {
        self.gateway_info.read().await.status
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == GatewayStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_transitions() {
        let state = GatewayState::new(&GatewayConfig::default());
        assert_eq!(state.status().await, GatewayStatus::Starting);
        assert!(state.info().await.started_at.is_none());

        state.set_status(GatewayStatus::Running).await;
        assert!(state.is_running().await);
        let started = state.info().await.started_at;
        assert!(started.is_some());

        state.set_status(GatewayStatus::Stopped).await;
        let info = state.info().await;
        assert_eq!(info.status, GatewayStatus::Stopped);
        assert_eq!(info.started_at, started);
    }

    #[tokio::test]
    async fn test_info_reflects_config() {
        let mut config = GatewayConfig::default();
        config.gateway.api_prefix = "/api/v2".to_string();
        let info = GatewayState::new(&config).info().await;
        assert_eq!(info.api_prefix, "/api/v2");
        assert_eq!(info.service, config.gateway.service_name);
        assert_eq!(info.version, crate::GATEWAY_VERSION);
    }
}
