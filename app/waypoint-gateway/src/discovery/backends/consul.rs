//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Consul coordination store implementation
//!
//! Talks to the agent HTTP API directly:
//! `/v1/agent/service/{register,deregister}`, `/v1/health/service/{name}`,
//! `/v1/kv/{key}` and `/v1/agent/self`.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use super::trait_def::{CoordinationStore, StoreHealthEntry};
use crate::error::GatewayError;
use crate::types::{Endpoint, HealthStatus, ProbeSpec, Scheme, ServiceInstance};
use crate::GatewayResult;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Check timing handed to the agent along with each registration
#[derive(Debug, Clone)]
pub struct ConsulCheckSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub deregister_critical_after: Duration,
}

impl Default for ConsulCheckSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            deregister_critical_after: Duration::from_secs(30),
        }
    }
}

/// Consul coordination store
#[derive(Debug, Clone)]
pub struct ConsulStore {
    http_client: HttpClient,
    base_url: String,
    token: Option<String>,
    checks: ConsulCheckSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: Vec<&'a str>,
    address: &'a str,
    port: u16,
    meta: &'a BTreeMap<String, String>,
    checks: Vec<CheckDefinition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckDefinition {
    name: String,
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    interval: String,
    timeout: String,
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthServiceEntry {
    #[serde(default)]
    node: Option<NodeInfo>,
    service: AgentService,
    #[serde(default)]
    checks: Vec<AgentCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    status: String,
}

fn go_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

impl ConsulStore {
    pub fn new(
        address: &str,
        token: Option<String>,
        timeout: Duration,
        checks: ConsulCheckSettings,
    ) -> GatewayResult<Self> {
        let endpoint = Endpoint::parse(address)
            .map_err(|e| GatewayError::Configuration(format!("invalid Consul address: {e}")))?;
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: endpoint.base_url(),
            token,
            checks,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/v1{}", self.base_url, path);
        let mut request = self.http_client.request(method, url);
        if let Some(ref token) = self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> GatewayResult<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("Consul request failed: {e}")))
    }

    async fn expect_success(response: reqwest::Response, action: &str) -> GatewayResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => GatewayError::Duplicate(format!("{action}: {body}")),
            StatusCode::BAD_REQUEST => GatewayError::InvalidInput(format!("{action}: {body}")),
            _ => GatewayError::StoreUnavailable(format!("{action}: HTTP {status} {body}")),
        })
    }

    fn check_definitions(&self, instance: &ServiceInstance) -> Vec<CheckDefinition> {
        let interval = go_duration(self.checks.interval);
        let timeout = go_duration(self.checks.timeout);
        let deregister = go_duration(self.checks.deregister_critical_after);

        instance
            .health_check
            .probes
            .iter()
            .filter_map(|probe| {
                let (http, tcp) = match probe {
                    ProbeSpec::Http { path } | ProbeSpec::ResponseTime { path, .. } => {
                        (Some(format!("{}{}", instance.endpoint.base_url(), path)), None)
                    }
                    ProbeSpec::Tcp => (None, Some(instance.endpoint.authority())),
                    // runs in the gateway only
                    ProbeSpec::Custom { .. } => return None,
                };
                Some(CheckDefinition {
                    name: format!("{} {}", instance.service_name, probe.key()),
                    http,
                    tcp,
                    interval: interval.clone(),
                    timeout: timeout.clone(),
                    deregister_critical_service_after: deregister.clone(),
                })
            })
            .collect()
    }

    fn entry_from_consul(entry: HealthServiceEntry) -> GatewayResult<StoreHealthEntry> {
        let address = if entry.service.address.is_empty() {
            entry.node.map(|n| n.address).unwrap_or_default()
        } else {
            entry.service.address
        };
        let meta = entry.service.meta.unwrap_or_default();
        let scheme = match meta.get("scheme").map(String::as_str) {
            Some("https") => Scheme::Https,
            _ => Scheme::Http,
        };
        let mut endpoint = Endpoint::parse(&format!("{}:{}", address, entry.service.port))
            .map_err(|e| GatewayError::StoreUnavailable(format!("Consul returned a bad address: {e}")))?;
        endpoint.scheme = scheme;

        let status = HealthStatus::aggregate(entry.checks.iter().map(|c| {
            HealthStatus::parse(&c.status).unwrap_or(HealthStatus::Critical)
        }));
        let status = if status == HealthStatus::Unknown {
            HealthStatus::Passing
        } else {
            status
        };

        Ok(StoreHealthEntry {
            instance_id: entry.service.id,
            service_name: entry.service.service,
            endpoint,
            tags: entry.service.tags.unwrap_or_default().into_iter().collect::<BTreeSet<_>>(),
            metadata: meta,
            status,
        })
    }
}

#[async_trait]
impl CoordinationStore for ConsulStore {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn ping(&self) -> GatewayResult<()> {
        let response = self.send(self.request(Method::GET, "/agent/self")).await?;
        Self::expect_success(response, "agent self").await?;
        Ok(())
    }

    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        let mut meta = instance.metadata.clone();
        if instance.endpoint.scheme == Scheme::Https {
            meta.insert("scheme".to_string(), "https".to_string());
        }
        let body = ServiceRegistration {
            id: &instance.instance_id,
            name: &instance.service_name,
            tags: instance.tags.iter().map(String::as_str).collect(),
            address: &instance.endpoint.host,
            port: instance.endpoint.port,
            meta: &meta,
            checks: self.check_definitions(instance),
        };

        let response = self
            .send(self.request(Method::PUT, "/agent/service/register").json(&body))
            .await?;
        Self::expect_success(response, "register").await?;
        info!(
            "Registered {} ({}) with Consul at {}",
            instance.instance_id, instance.service_name, self.base_url
        );
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        let response = self
            .send(self.request(Method::PUT, &format!("/agent/service/deregister/{instance_id}")))
            .await?;
        // the agent answers 404 for unknown ids
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Consul has no instance {instance_id}, nothing to deregister");
            return Ok(());
        }
        Self::expect_success(response, "deregister").await?;
        info!("Deregistered {} from Consul", instance_id);
        Ok(())
    }

    async fn health_by_name(&self, service_name: &str) -> GatewayResult<Vec<StoreHealthEntry>> {
        let response = self
            .send(self.request(Method::GET, &format!("/health/service/{service_name}")))
            .await?;
        let response = Self::expect_success(response, "health query").await?;
        let entries: Vec<HealthServiceEntry> = response
            .json()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("failed to parse Consul health data: {e}")))?;

        let mut result = entries
            .into_iter()
            .map(Self::entry_from_consul)
            .collect::<GatewayResult<Vec<_>>>()?;
        result.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(result)
    }

    async fn kv_get(&self, key: &str) -> GatewayResult<Option<String>> {
        let response = self
            .send(self.request(Method::GET, &format!("/kv/{key}")).query(&[("raw", "")]))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(response, "kv get").await?;
        let value = response
            .text()
            .await
            .map_err(|e| GatewayError::StoreUnavailable(format!("failed to read KV value: {e}")))?;
        Ok(Some(value))
    }

    async fn kv_put(&self, key: &str, value: &str) -> GatewayResult<()> {
        let response = self
            .send(self.request(Method::PUT, &format!("/kv/{key}")).body(value.to_string()))
            .await?;
        Self::expect_success(response, "kv put").await?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> GatewayResult<()> {
        let response = self
            .send(self.request(Method::DELETE, &format!("/kv/{key}")))
            .await?;
        Self::expect_success(response, "kv delete").await?;
        Ok(())
    }
}
