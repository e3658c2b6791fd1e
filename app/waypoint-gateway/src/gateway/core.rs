//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Main gateway core implementation
//!
//! `WaypointGateway` owns every long-lived component and their lifecycle:
//! `create → start → shutdown`. All background work hangs off a single
//! cancellation token and task tracker.

use crate::{
    clock::{system_clock, SharedClock},
    config::GatewayConfig,
    discovery::{
        create_store, CoordinationStore, ProbeRunner, RegistrySettings, ServiceDiscovery,
        ServiceRegistry,
    },
    error::GatewayError,
    gateway::health::HealthChecker,
    gateway::state::GatewayState,
    http::HttpServer,
    routing::Dispatcher,
    types::{Endpoint, GatewayStatus, ProbeSpec, ServiceInstance},
    GatewayResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use waypoint_auth::{AuthGate, JwtConfig, JwtValidator};

/// Tag carried by the gateway's own registration
pub const GATEWAY_TAG: &str = "api-gateway";

/// Path probed on the gateway's own registration
const SELF_PROBE_PATH: &str = "/health/live";

/// Upper bound on waiting for background tasks after cancellation
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main Waypoint Gateway implementation
pub struct WaypointGateway {
    /// Gateway configuration
    config: GatewayConfig,

    /// Gateway state
    state: Arc<GatewayState>,

    clock: SharedClock,

    /// Service registry
    registry: ServiceRegistry,

    /// Cached discovery and instance selection
    discovery: Arc<ServiceDiscovery>,

    /// Health checker
    health_checker: Arc<HealthChecker>,

    /// Reverse-proxy dispatcher
    dispatcher: Arc<Dispatcher>,

    /// Auth gate, absent when authentication is disabled
    auth_gate: Option<Arc<AuthGate>>,

    /// Shutdown signal shared by every background task
    cancel: CancellationToken,

    tracker: TaskTracker,
}

impl WaypointGateway {
    /// Create a gateway talking to the configured coordination store
    pub fn create(config: GatewayConfig) -> GatewayResult<Self> {
        let store = create_store(&config)?;
        Self::with_store(config, store, system_clock())
    }

    /// Create a gateway over an explicit store and clock
    pub fn with_store(
        config: GatewayConfig,
        store: Arc<dyn CoordinationStore>,
        clock: SharedClock,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let state = Arc::new(GatewayState::new(&config));

        let registry = ServiceRegistry::new(
            store,
            clock.clone(),
            RegistrySettings::from(&config),
            cancel.clone(),
            tracker.clone(),
        );

        let discovery = Arc::new(ServiceDiscovery::new(
            registry.clone(),
            clock.clone(),
            &config.discovery,
        ));

        let runner = Arc::new(ProbeRunner::new(
            clock.clone(),
            config.health.timeout,
            config.health.response_time_threshold,
        )?);
        let health_checker = Arc::new(HealthChecker::for_registry(
            &registry,
            runner,
            &config.health,
            cancel.clone(),
            tracker.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(discovery.clone(), &config, cancel.clone())?);

        let auth_gate = build_auth_gate(&config)?.map(Arc::new);

        Ok(Self {
            config,
            state,
            clock,
            registry,
            discovery,
            health_checker,
            dispatcher,
            auth_gate,
            cancel,
            tracker,
        })
    }

    /// Start background work and register the gateway itself.
    ///
    /// Fails with `StoreUnavailable` when the coordination store does not answer.
    pub async fn start(&self) -> GatewayResult<()> {
        info!(
            "Starting Waypoint gateway {} ({})",
            self.config.gateway.gateway_id, self.config.gateway.service_name
        );
        self.state.set_status(GatewayStatus::Starting).await;

        if let Err(e) = self.ping_store().await {
            error!("Coordination store unreachable at startup: {}", e);
            self.state.set_status(GatewayStatus::Error).await;
            return Err(e);
        }

        self.registry.spawn_reconciler();
        self.discovery.start(self.cancel.clone(), &self.tracker);

        if self.config.health.enabled {
            self.health_checker.start(Some(self.registry.events()));
        } else {
            warn!("Health checking disabled; instance status is only changed through the API");
        }

        if let Some(address) = &self.config.gateway.advertise_address {
            self.register_self(address).await?;
        }

        self.state.set_status(GatewayStatus::Running).await;
        info!("Waypoint gateway started successfully");
        Ok(())
    }

    async fn register_self(&self, address: &str) -> GatewayResult<()> {
        let endpoint = Endpoint::parse(address)?;
        let instance = ServiceInstance::new(
            self.config.gateway.gateway_id.clone(),
            self.config.gateway.service_name.clone(),
            endpoint,
        )
        .with_tag(GATEWAY_TAG)
        .with_metadata("version", crate::GATEWAY_VERSION)
        .with_probes(vec![ProbeSpec::http(SELF_PROBE_PATH)]);

        self.registry.register(instance).await?;
        info!(
            "Registered gateway as {} at {}",
            self.config.gateway.gateway_id, address
        );
        Ok(())
    }

    /// Cancel probes and upstream calls. New requests are refused by the
    /// server once its graceful shutdown begins.
    pub fn begin_shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling outstanding probes and upstream calls");
            self.cancel.cancel();
        }
    }

    /// Drain the gateway: cancel background work, deregister owned instances
    /// within the grace period and wait for tasks to finish
    pub async fn shutdown(&self) -> GatewayResult<()> {
        info!("Shutting down Waypoint gateway");
        self.state.set_status(GatewayStatus::Stopping).await;

        self.health_checker.stop();
        self.begin_shutdown();

        let removed = self
            .registry
            .deregister_owned(self.config.gateway.shutdown_grace)
            .await;
        info!("Deregistered {} owned instances", removed);

        self.registry.close();
        self.tracker.close();
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("Background tasks still running after {:?}", TASK_DRAIN_TIMEOUT);
        }

        self.state.set_status(GatewayStatus::Stopped).await;
        info!("Waypoint gateway stopped");
        Ok(())
    }

    async fn store_call<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: std::future::Future<Output = GatewayResult<T>>,
    {
        let timeout = self.config.registry.store_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::StoreUnavailable(format!(
                "{} did not answer within {:?}",
                self.registry.store().name(),
                timeout
            ))),
        }
    }

    /// Check the coordination store within the configured store timeout
    pub async fn ping_store(&self) -> GatewayResult<()> {
        self.store_call(self.registry.store().ping()).await
    }

    /// Read a dynamic configuration value
    pub async fn config_value(&self, key: &str) -> GatewayResult<String> {
        validate_config_key(key)?;
        self.store_call(self.registry.store().kv_get(key))
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("config key {key}")))
    }

    /// Write a dynamic configuration value
    pub async fn set_config_value(&self, key: &str, value: &str) -> GatewayResult<()> {
        validate_config_key(key)?;
        self.store_call(self.registry.store().kv_put(key, value))
            .await?;
        info!("Config key {} updated", key);
        Ok(())
    }

    /// Remove a dynamic configuration value. Absent keys are not an error.
    pub async fn delete_config_value(&self, key: &str) -> GatewayResult<()> {
        validate_config_key(key)?;
        self.store_call(self.registry.store().kv_delete(key))
            .await?;
        info!("Config key {} deleted", key);
        Ok(())
    }

    /// HTTP router serving the management API and the reverse proxy
    pub fn router(self: &Arc<Self>) -> axum::Router {
        HttpServer::new(self.clone()).create_router()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health_checker
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn auth_gate(&self) -> Option<&Arc<AuthGate>> {
        self.auth_gate.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

fn validate_config_key(key: &str) -> GatewayResult<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|s| s.is_empty() || s == "..") {
        return Err(GatewayError::InvalidInput(format!("invalid config key: {key:?}")));
    }
    Ok(())
}

fn build_auth_gate(config: &GatewayConfig) -> GatewayResult<Option<AuthGate>> {
    let auth = &config.auth;
    if !auth.enabled {
        return Ok(None);
    }
    if auth.jwt_validator != "jwt" {
        return Err(GatewayError::Configuration(format!(
            "unknown auth.jwt_validator: {}",
            auth.jwt_validator
        )));
    }
    let secret = auth.jwt_secret.clone().ok_or_else(|| {
        GatewayError::Configuration("auth.jwt_secret is required when auth is enabled".to_string())
    })?;

    let validator = JwtValidator::new(JwtConfig {
        secret,
        issuer: auth.issuer.clone(),
        audience: auth.audience.clone(),
        ..JwtConfig::default()
    })?;

    let gate = AuthGate::builder(Arc::new(validator))
        .public_paths(auth.public_paths.iter())?
        .admin_paths(config.admin_paths().iter())?
        .admin_roles(auth.admin_roles.iter())
        .build();
    Ok(Some(gate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::discovery::MemoryStore;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.health.enabled = false;
        config
    }

    fn gateway(config: GatewayConfig, store: Arc<MemoryStore>) -> WaypointGateway {
        WaypointGateway::with_store(config, store, Arc::new(ManualClock::new())).unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let gateway = gateway(config(), store);

        gateway.start().await.unwrap();
        assert_eq!(gateway.state().status().await, GatewayStatus::Running);

        gateway.shutdown().await.unwrap();
        assert_eq!(gateway.state().status().await, GatewayStatus::Stopped);
        assert!(gateway.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_start_fails_when_store_unreachable() {
        let store = Arc::new(MemoryStore::new());
        store.set_online(false);
        let gateway = gateway(config(), store);

        let err = gateway.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::StoreUnavailable(_)));
        assert_eq!(gateway.state().status().await, GatewayStatus::Error);
    }

    #[tokio::test]
    async fn test_self_registration_is_removed_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let mut config = config();
        config.gateway.advertise_address = Some("127.0.0.1:8080".to_string());
        let gateway = gateway(config.clone(), store.clone());

        gateway.start().await.unwrap();
        let registered = gateway
            .registry()
            .get(&config.gateway.gateway_id)
            .await
            .unwrap();
        assert!(registered.tags.contains(GATEWAY_TAG));
        assert!(store.is_registered(&config.gateway.gateway_id));

        gateway.shutdown().await.unwrap();
        assert!(!store.is_registered(&config.gateway.gateway_id));
        assert!(gateway
            .registry()
            .get(&config.gateway.gateway_id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_config_values() {
        let gateway = gateway(config(), Arc::new(MemoryStore::new()));

        assert!(matches!(
            gateway.config_value("features/beta").await,
            Err(GatewayError::NotFound(_))
        ));
        gateway.set_config_value("features/beta", "on").await.unwrap();
        assert_eq!(gateway.config_value("features/beta").await.unwrap(), "on");

        gateway.delete_config_value("features/beta").await.unwrap();
        gateway.delete_config_value("features/beta").await.unwrap();
        assert!(gateway.config_value("features/beta").await.is_err());

        for bad in ["", "/abs", "a//b", "a/../b"] {
            assert!(matches!(
                gateway.set_config_value(bad, "x").await,
                Err(GatewayError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_auth_requires_secret() {
        let mut config = config();
        config.auth.enabled = true;
        let result =
            WaypointGateway::with_store(config.clone(), Arc::new(MemoryStore::new()), system_clock());
        assert!(matches!(result, Err(GatewayError::Configuration(_))));

        config.auth.jwt_secret = Some("test-secret".to_string());
        let gateway =
            WaypointGateway::with_store(config, Arc::new(MemoryStore::new()), system_clock())
                .unwrap();
        assert!(gateway.auth_gate().is_some());
    }

    #[tokio::test]
    async fn test_unknown_validator_rejected() {
        let mut config = config();
        config.auth.enabled = true;
        config.auth.jwt_secret = Some("test-secret".to_string());
        config.auth.jwt_validator = "opaque".to_string();
        let result = WaypointGateway::with_store(config, Arc::new(MemoryStore::new()), system_clock());
        assert!(matches!(result, Err(GatewayError::Configuration(_))));
    }
}
