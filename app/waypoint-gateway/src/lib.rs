//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Waypoint Gateway: service registry, discovery and reverse proxy
//!
//! Backends register instances in a coordination store. The gateway probes
//! their health, caches the healthy set per service and forwards
//! `/{prefix}/{service}/{rest}` requests to one of them.

pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod http;
pub mod load_balancer;
pub mod middleware;
pub mod routing;
pub mod types;

// Re-export main types
pub use config::GatewayConfig;
pub use error::{ErrorCategory, GatewayError};
pub use gateway::WaypointGateway;
pub use types::*;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway version information
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Gateway name
pub const GATEWAY_NAME: &str = "waypoint-gateway";

/// Service name the gateway registers under by default
pub const DEFAULT_SERVICE_NAME: &str = "api-gateway";

/// Default listen port
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Initialize waypoint gateway against the configured coordination store
pub async fn init_gateway(config: GatewayConfig) -> GatewayResult<WaypointGateway> {
    tracing::info!("Initializing Waypoint gateway v{}", GATEWAY_VERSION);

    let gateway = WaypointGateway::create(config)?;
    gateway.start().await?;
    tracing::info!("Waypoint gateway initialization completed");

    Ok(gateway)
}

/// Shutdown waypoint gateway
pub async fn shutdown_gateway(gateway: &WaypointGateway) -> GatewayResult<()> {
    tracing::info!("Shutting down Waypoint gateway");

    gateway.shutdown().await?;
    tracing::info!("Waypoint gateway shutdown completed");

    Ok(())
}
