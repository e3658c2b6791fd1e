//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Types for Waypoint Gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;
use crate::GatewayResult;

/// Gateway status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Static descriptor served on `/info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Gateway identifier
    pub gateway_id: String,

    /// Service name the gateway registers under
    pub service: String,

    /// Gateway status
    pub status: GatewayStatus,

    /// Gateway version
    pub version: String,

    /// Listen address
    pub listen_address: String,

    /// Prefix of the management API
    pub api_prefix: String,

    /// Number of leading path segments stripped before the service name
    pub path_prefix_segments: usize,

    /// Start time
    pub started_at: Option<DateTime<Utc>>,
}

/// URL scheme spoken by an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Transport address of an instance, `host:port` with an optional scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Http,
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `http://host:port` or `https://host:port`
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let raw = raw.trim();
        let (scheme, rest) = if let Some(rest) = raw.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = raw.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            (Scheme::Http, raw)
        };
        let rest = rest.trim_end_matches('/');

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| GatewayError::InvalidInput(format!("endpoint must be host:port: {raw}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains('/') || host.chars().any(char::is_whitespace) {
            return Err(GatewayError::InvalidInput(format!("invalid endpoint host: {raw}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| GatewayError::InvalidInput(format!("invalid endpoint port: {raw}")))?;
        if port == 0 {
            return Err(GatewayError::InvalidInput(format!("endpoint port must be non-zero: {raw}")));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://host:port`
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Http => f.write_str(&self.authority()),
            Scheme::Https => write!(f, "https://{}", self.authority()),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Aggregate health state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Passing,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn is_passing(&self) -> bool {
        *self == HealthStatus::Passing
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Passing => "passing",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "unknown" => Some(HealthStatus::Unknown),
            "passing" => Some(HealthStatus::Passing),
            "warning" => Some(HealthStatus::Warning),
            "critical" => Some(HealthStatus::Critical),
            _ => None,
        }
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Passing => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Warning => 2,
            HealthStatus::Critical => 3,
        }
    }

    /// Combine probe results: any critical wins, then warning, then passing.
    pub fn aggregate<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(HealthStatus::severity)
            .unwrap_or(HealthStatus::Unknown)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe to run against an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// GET `path`; 2xx is passing
    Http {
        #[serde(default = "default_health_path")]
        path: String,
    },

    /// Connect and close
    Tcp,

    /// Http probe that also fails above a latency threshold
    ResponseTime {
        #[serde(default = "default_health_path")]
        path: String,

        /// Threshold in seconds; the configured default applies when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threshold_secs: Option<f64>,
    },

    /// Capability registered with the health checker under `name`
    Custom { name: String },
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl ProbeSpec {
    pub fn http(path: impl Into<String>) -> Self {
        ProbeSpec::Http { path: path.into() }
    }

    /// Key in the per-probe outcome map
    pub fn key(&self) -> String {
        match self {
            ProbeSpec::Http { path } => format!("http:{path}"),
            ProbeSpec::Tcp => "tcp".to_string(),
            ProbeSpec::ResponseTime { path, .. } => format!("response_time:{path}"),
            ProbeSpec::Custom { name } => format!("custom:{name}"),
        }
    }

    pub fn threshold(&self) -> Option<Duration> {
        match self {
            ProbeSpec::ResponseTime {
                threshold_secs: Some(secs),
                ..
            } if *secs > 0.0 => Some(Duration::from_secs_f64(*secs)),
            _ => None,
        }
    }
}

/// How the health checker probes an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckDescriptor {
    pub probes: Vec<ProbeSpec>,
}

impl Default for HealthCheckDescriptor {
    fn default() -> Self {
        Self {
            probes: vec![ProbeSpec::http(default_health_path())],
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub status: HealthStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ProbeOutcome {
    pub fn passing() -> Self {
        Self {
            status: HealthStatus::Passing,
            message: None,
            latency_ms: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Warning,
            message: Some(message.into()),
            latency_ms: None,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Critical,
            message: Some(message.into()),
            latency_ms: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }
}

/// Current health of an instance
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    pub status: HealthStatus,

    /// Time of the last probe run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Outcome per probe, keyed by [`ProbeSpec::key`]
    #[serde(default)]
    pub probes: BTreeMap<String, ProbeOutcome>,
}

impl HealthRecord {
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Aggregate a probe run. An empty run is critical: nothing vouched for the instance.
    pub fn from_outcomes(probes: BTreeMap<String, ProbeOutcome>, checked_at: DateTime<Utc>) -> Self {
        let status = if probes.is_empty() {
            HealthStatus::Critical
        } else {
            HealthStatus::aggregate(probes.values().map(|o| o.status))
        };
        let message = probes
            .iter()
            .filter(|(_, o)| o.status != HealthStatus::Passing)
            .filter_map(|(k, o)| o.message.as_ref().map(|m| format!("{k}: {m}")))
            .collect::<Vec<_>>();
        Self {
            status,
            checked_at: Some(checked_at),
            message: if message.is_empty() {
                None
            } else {
                Some(message.join("; "))
            },
            probes,
        }
    }

    pub fn with_status(status: HealthStatus, checked_at: DateTime<Utc>) -> Self {
        Self {
            status,
            checked_at: Some(checked_at),
            message: None,
            probes: BTreeMap::new(),
        }
    }
}

/// A registered member of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub endpoint: Endpoint,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub health_check: HealthCheckDescriptor,

    #[serde(default)]
    pub health: HealthRecord,

    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl ServiceInstance {
    pub fn new(instance_id: impl Into<String>, service_name: impl Into<String>, endpoint: Endpoint) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            endpoint,
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            health_check: HealthCheckDescriptor::default(),
            health: HealthRecord::unknown(),
            registered_at: now,
            last_seen_at: now,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_probes(mut self, probes: Vec<ProbeSpec>) -> Self {
        self.health_check = HealthCheckDescriptor { probes };
        self
    }

    pub fn status(&self) -> HealthStatus {
        self.health.status
    }

    pub fn is_passing(&self) -> bool {
        self.health.status == HealthStatus::Passing
    }
}

/// Immutable snapshot of an instance
///
/// The registry never mutates an instance in place; every change installs a
/// new value, so a view handed out earlier keeps describing the moment it
/// was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceView(Arc<ServiceInstance>);

impl ServiceView {
    pub fn new(instance: ServiceInstance) -> Self {
        Self(Arc::new(instance))
    }

    pub fn to_instance(&self) -> ServiceInstance {
        (*self.0).clone()
    }
}

impl Deref for ServiceView {
    type Target = ServiceInstance;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<ServiceInstance> for ServiceView {
    fn from(instance: ServiceInstance) -> Self {
        Self::new(instance)
    }
}

/// Why an instance left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterReason {
    /// Explicit deregister call
    Requested,

    /// Critical for longer than the deregistration window
    CriticalTimeout,

    /// Re-registered under another service name
    Moved,

    /// Gateway shutdown
    Shutdown,
}

/// What changed in a [`ChangeEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Registered {
        instance_id: String,
    },
    Deregistered {
        instance_id: String,
        reason: DeregisterReason,
    },
    StatusChanged {
        instance_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    MetadataUpdated {
        instance_id: String,
    },
}

impl ChangeKind {
    pub fn instance_id(&self) -> &str {
        match self {
            ChangeKind::Registered { instance_id }
            | ChangeKind::Deregistered { instance_id, .. }
            | ChangeKind::StatusChanged { instance_id, .. }
            | ChangeKind::MetadataUpdated { instance_id } => instance_id,
        }
    }
}

/// Notification that a service's instance list changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub service_name: String,

    /// Per-service version after the change, starting at 1
    pub version: u64,

    pub kind: ChangeKind,

    /// Every instance of the service after the change, sorted by instance id
    pub instances: Vec<ServiceView>,
}

impl ChangeEvent {
    pub fn healthy(&self) -> impl Iterator<Item = &ServiceView> {
        self.instances.iter().filter(|v| v.is_passing())
    }
}

/// Instance counts by health status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub passing: usize,
    pub warning: usize,
    pub critical: usize,
    pub unknown: usize,
}

impl StatusCounts {
    pub fn tally<'a, I: IntoIterator<Item = &'a ServiceView>>(views: I) -> Self {
        let mut counts = Self::default();
        for view in views {
            counts.total += 1;
            match view.status() {
                HealthStatus::Passing => counts.passing += 1,
                HealthStatus::Warning => counts.warning += 1,
                HealthStatus::Critical => counts.critical += 1,
                HealthStatus::Unknown => counts.unknown += 1,
            }
        }
        counts
    }
}

/// Instance selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    Random,
    LeastRecentlyUsed,
}
