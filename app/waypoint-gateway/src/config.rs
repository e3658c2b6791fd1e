//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Configuration for Waypoint Gateway
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, then `WAYPOINT_*` environment variables using `__` between
//! section and key (`WAYPOINT_HEALTH__INTERVAL=5`). Durations are given in
//! seconds and may be fractional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::GatewayError;
use crate::types::{Endpoint, SelectionPolicy};
use crate::GatewayResult;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "WAYPOINT";

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "WAYPOINT_CONFIG";

/// Config file used when `WAYPOINT_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

const LIST_KEYS: &[&str] = &[
    "auth.public_paths",
    "auth.admin_paths",
    "auth.admin_roles",
    "gateway.cors_origins",
];

/// Serde helpers for durations expressed as (fractional) seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!("duration of {secs} seconds is out of range: {e}"))
        })
    }
}

/// Configuration for the Waypoint Gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener and routing settings
    pub gateway: GatewaySettings,

    /// Coordination store and registry settings
    pub registry: RegistryConfig,

    /// Health checker settings
    pub health: HealthConfig,

    /// Discovery cache and selection settings
    pub discovery: DiscoveryConfig,

    /// Reverse-proxy settings
    pub dispatch: DispatchConfig,

    /// Auth gate settings
    pub auth: AuthConfig,
}

/// Listener and routing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Gateway identifier
    pub gateway_id: String,

    /// Name the gateway reports and self-registers under
    pub service_name: String,

    /// Bind address
    pub listen_address: String,

    /// Bind port
    pub listen_port: u16,

    /// Path segments before the service name (`/api/v1/<svc>` is 2)
    pub path_prefix_segments: usize,

    /// Mount point of the management API
    pub api_prefix: String,

    /// Address other components reach this gateway at; enables self-registration
    pub advertise_address: Option<String>,

    /// Enable CORS
    pub enable_cors: bool,

    /// Allowed CORS origins, `*` for any
    pub cors_origins: Vec<String>,

    /// Grace period for deregistration during shutdown
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            gateway_id: uuid::Uuid::new_v4().to_string(),
            service_name: crate::DEFAULT_SERVICE_NAME.to_string(),
            listen_address: "0.0.0.0".to_string(),
            listen_port: crate::DEFAULT_LISTEN_PORT,
            path_prefix_segments: 2,
            api_prefix: "/api/v1".to_string(),
            advertise_address: None,
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl GatewaySettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port)
    }
}

/// Coordination store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryBackend {
    /// Consul-compatible agent HTTP API
    Consul,

    /// In-process store, nothing shared across gateway replicas
    Memory,
}

/// Coordination store and registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Store backend
    pub backend: RegistryBackend,

    /// Store address, `host:port`
    pub store_address: String,

    /// Optional ACL token sent with every store call
    pub store_token: Option<String>,

    /// Deadline for each store call
    #[serde(with = "duration_secs")]
    pub store_timeout: Duration,

    /// How long an instance may stay critical before it is removed
    #[serde(with = "duration_secs")]
    pub deregister_after: Duration,

    /// Retry cadence for store operations that failed
    #[serde(with = "duration_secs")]
    pub reconcile_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Consul,
            store_address: "127.0.0.1:8500".to_string(),
            store_token: None,
            store_timeout: Duration::from_secs(5),
            deregister_after: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
        }
    }
}

/// Health checker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the periodic checker
    pub enabled: bool,

    /// Time between probe rounds
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Per-probe deadline
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Fraction of `interval` used to stagger probe start times
    pub jitter_fraction: f64,

    /// Worker pool size
    pub max_parallel_probes: usize,

    /// Default latency limit for response_time probes
    #[serde(with = "duration_secs")]
    pub response_time_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            jitter_fraction: 0.1,
            max_parallel_probes: 16,
            response_time_threshold: Duration::from_secs(5),
        }
    }
}

/// Discovery cache and selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Upper bound on the age of a cached instance list
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,

    /// Default selection policy
    pub selection_policy: SelectionPolicy,

    /// Undelivered change events of one service at which a backlog warning is logged
    pub watch_buffer: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            selection_policy: SelectionPolicy::RoundRobin,
            watch_buffer: 64,
        }
    }
}

/// Reverse-proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Deadline for a whole upstream exchange
    #[serde(with = "duration_secs")]
    pub upstream_timeout: Duration,

    /// Deadline for opening an upstream connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Alternate instances tried after a failed idempotent request
    pub retry_budget: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry_budget: 1,
        }
    }
}

/// Auth gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enforce authentication
    pub enabled: bool,

    /// Validator implementation; only `jwt` is built in
    pub jwt_validator: String,

    /// HMAC secret for the JWT validator
    pub jwt_secret: Option<String>,

    /// Expected token issuer
    pub issuer: String,

    /// Expected token audience
    pub audience: String,

    /// `METHOD:/prefix` patterns that skip authentication
    pub public_paths: Vec<String>,

    /// `METHOD:/prefix` patterns that require an admin role. Unset means the
    /// management write routes under `gateway.api_prefix`.
    pub admin_paths: Option<Vec<String>>,

    /// Roles accepted on admin paths
    pub admin_roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwt_validator: "jwt".to_string(),
            jwt_secret: None,
            issuer: "waypoint".to_string(),
            audience: "waypoint-clients".to_string(),
            public_paths: vec![
                "GET:/health".to_string(),
                "GET:/info".to_string(),
                "OPTIONS:/".to_string(),
            ],
            admin_paths: None,
            admin_roles: waypoint_auth::DEFAULT_ADMIN_ROLES
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

/// Management write routes mounted under `api_prefix`
pub fn management_admin_paths(api_prefix: &str) -> Vec<String> {
    let api = api_prefix.trim_end_matches('/');
    vec![
        format!("POST:{api}/services"),
        format!("*:{api}/services/instances"),
        format!("PUT:{api}/config"),
        format!("DELETE:{api}/config"),
    ]
}

impl GatewayConfig {
    /// Configured admin paths, or the management write routes when unset
    pub fn admin_paths(&self) -> Vec<String> {
        self.auth
            .admin_paths
            .clone()
            .unwrap_or_else(|| management_admin_paths(&self.gateway.api_prefix))
    }

    /// Load from `WAYPOINT_CONFIG` (or the default path, if present) and the environment
    pub fn load() -> GatewayResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .ok();
        match path {
            Some(path) => Self::from_sources(Some(&path), true, ENV_PREFIX),
            None => Self::from_sources(Some(Path::new(DEFAULT_CONFIG_PATH)), false, ENV_PREFIX),
        }
    }

    /// Load from multiple sources with precedence
    pub fn from_sources(
        config_file: Option<&Path>,
        file_required: bool,
        env_prefix: &str,
    ) -> GatewayResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&GatewayConfig::default())?);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(file_required));
        }

        let mut env = config::Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }
        builder = builder.add_source(env);

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> GatewayResult<()> {
        let invalid = |msg: String| Err(GatewayError::Configuration(msg));

        if self.gateway.path_prefix_segments == 0 {
            return invalid("gateway.path_prefix_segments must be at least 1".into());
        }
        if !self.gateway.api_prefix.starts_with('/') {
            return invalid(format!(
                "gateway.api_prefix must start with '/': {}",
                self.gateway.api_prefix
            ));
        }
        let api_segments = self
            .gateway
            .api_prefix
            .split('/')
            .filter(|s| !s.is_empty())
            .count();
        if api_segments != self.gateway.path_prefix_segments {
            return invalid(format!(
                "gateway.api_prefix {} has {} segments but gateway.path_prefix_segments is {}",
                self.gateway.api_prefix, api_segments, self.gateway.path_prefix_segments
            ));
        }
        if self.gateway.service_name.trim().is_empty() {
            return invalid("gateway.service_name must not be empty".into());
        }
        if let Some(addr) = &self.gateway.advertise_address {
            Endpoint::parse(addr).map_err(|e| {
                GatewayError::Configuration(format!("gateway.advertise_address: {e}"))
            })?;
        }
        if self.registry.backend == RegistryBackend::Consul {
            Endpoint::parse(&self.registry.store_address).map_err(|e| {
                GatewayError::Configuration(format!("registry.store_address: {e}"))
            })?;
        }

        for (key, value) in [
            ("registry.store_timeout", self.registry.store_timeout),
            ("registry.deregister_after", self.registry.deregister_after),
            ("registry.reconcile_interval", self.registry.reconcile_interval),
            ("health.interval", self.health.interval),
            ("health.timeout", self.health.timeout),
            ("health.response_time_threshold", self.health.response_time_threshold),
            ("discovery.cache_ttl", self.discovery.cache_ttl),
            ("dispatch.upstream_timeout", self.dispatch.upstream_timeout),
            ("dispatch.connect_timeout", self.dispatch.connect_timeout),
        ] {
            if value.is_zero() {
                return invalid(format!("{key} must be greater than zero"));
            }
        }

        if self.health.max_parallel_probes == 0 {
            return invalid("health.max_parallel_probes must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.health.jitter_fraction) {
            return invalid(format!(
                "health.jitter_fraction must be in [0, 1), got {}",
                self.health.jitter_fraction
            ));
        }
        if self.discovery.watch_buffer == 0 {
            return invalid("discovery.watch_buffer must be at least 1".into());
        }

        if self.auth.enabled {
            if self.auth.jwt_validator != "jwt" {
                return invalid(format!("unknown auth.jwt_validator: {}", self.auth.jwt_validator));
            }
            if self.auth.jwt_secret.as_deref().map_or(true, str::is_empty) {
                return invalid("auth.jwt_secret is required when auth is enabled".into());
            }
        }

        Ok(())
    }
}
