//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Shared fixtures for the gateway integration tests

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    http::{Request, Response},
    Router,
};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceExt;
use waypoint_gateway::{
    clock::system_clock,
    config::{GatewayConfig, RegistryBackend},
    discovery::MemoryStore,
    Endpoint, HealthRecord, HealthStatus, ServiceInstance, WaypointGateway,
};

/// Serve `app` on an ephemeral local port
pub async fn spawn_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A local port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Defaults with the in-memory store and no background probing
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.registry.backend = RegistryBackend::Memory;
    config.health.enabled = false;
    config.dispatch.upstream_timeout = Duration::from_secs(5);
    config.dispatch.connect_timeout = Duration::from_secs(1);
    config
}

pub async fn start_gateway(config: GatewayConfig) -> Arc<WaypointGateway> {
    let gateway = Arc::new(
        WaypointGateway::with_store(config, Arc::new(MemoryStore::new()), system_clock()).unwrap(),
    );
    gateway.start().await.unwrap();
    gateway
}

/// Register an instance on `127.0.0.1:port` and mark it passing
pub async fn register_passing(gateway: &WaypointGateway, id: &str, service: &str, port: u16) {
    let registry = gateway.registry();
    registry
        .register(ServiceInstance::new(id, service, Endpoint::new("127.0.0.1", port)))
        .await
        .unwrap();
    registry
        .update_health(
            id,
            HealthRecord::with_status(HealthStatus::Passing, chrono::Utc::now()),
        )
        .await
        .unwrap();
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Poll `check` every 50ms until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
