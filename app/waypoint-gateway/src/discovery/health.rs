//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Health probes
//!
//! A probe answers one question about one endpoint. [`ProbeRunner`] turns a
//! [`HealthCheckDescriptor`](crate::types::HealthCheckDescriptor) into
//! probes, runs them with a deadline and folds the outcomes into a
//! [`HealthRecord`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::types::{Endpoint, HealthRecord, ProbeOutcome, ProbeSpec, ServiceView};
use crate::GatewayResult;

/// A single health probe
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn check(&self, endpoint: &Endpoint) -> ProbeOutcome;
}

/// GET a path; 2xx passes, 429 warns, anything else fails
pub struct HttpProbe {
    client: Client,
    path: String,
}

impl HttpProbe {
    pub fn new(client: Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn check(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let url = format!("{}{}", endpoint.base_url(), self.path);
        let started = Instant::now();
        let outcome = match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!("Health check passed for endpoint: {}", url);
                    ProbeOutcome::passing()
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    ProbeOutcome::warning(format!("HTTP {status}"))
                } else {
                    debug!("Health check failed for endpoint {}: status {}", url, status);
                    ProbeOutcome::critical(format!("HTTP {status}"))
                }
            }
            Err(e) => {
                debug!("Health check error for endpoint {}: {}", url, e);
                ProbeOutcome::critical(e.to_string())
            }
        };
        outcome.with_latency(started.elapsed())
    }
}

/// Open a TCP connection and close it again
pub struct TcpProbe;

#[async_trait]
impl Probe for TcpProbe {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn check(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let started = Instant::now();
        match TcpStream::connect(endpoint.authority()).await {
            Ok(stream) => {
                drop(stream);
                ProbeOutcome::passing().with_latency(started.elapsed())
            }
            Err(e) => ProbeOutcome::critical(format!("connect {}: {}", endpoint.authority(), e)),
        }
    }
}

/// Http probe that also fails when the answer is slower than `threshold`
pub struct ResponseTimeProbe {
    http: HttpProbe,
    threshold: Duration,
}

impl ResponseTimeProbe {
    pub fn new(http: HttpProbe, threshold: Duration) -> Self {
        Self { http, threshold }
    }
}

#[async_trait]
impl Probe for ResponseTimeProbe {
    fn kind(&self) -> &'static str {
        "response_time"
    }

    async fn check(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let started = Instant::now();
        let outcome = self.http.check(endpoint).await;
        let elapsed = started.elapsed();
        if outcome.status.is_passing() && elapsed > self.threshold {
            return ProbeOutcome::critical(format!(
                "response time {}ms exceeds {}ms",
                elapsed.as_millis(),
                self.threshold.as_millis()
            ))
            .with_latency(elapsed);
        }
        outcome
    }
}

/// Runs every probe of an instance's descriptor
pub struct ProbeRunner {
    client: Client,
    clock: SharedClock,
    timeout: Duration,
    response_time_threshold: Duration,
    custom: DashMap<String, Arc<dyn Probe>>,
}

impl ProbeRunner {
    pub fn new(
        clock: SharedClock,
        timeout: Duration,
        response_time_threshold: Duration,
    ) -> GatewayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            clock,
            timeout,
            response_time_threshold,
            custom: DashMap::new(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Make a user-defined probe available to descriptors as `custom:{name}`
    pub fn register_custom(&self, name: impl Into<String>, probe: Arc<dyn Probe>) {
        self.custom.insert(name.into(), probe);
    }

    fn probe_for(&self, spec: &ProbeSpec) -> Option<Arc<dyn Probe>> {
        match spec {
            ProbeSpec::Http { path } => Some(Arc::new(HttpProbe::new(self.client.clone(), path))),
            ProbeSpec::Tcp => Some(Arc::new(TcpProbe)),
            ProbeSpec::ResponseTime { path, .. } => Some(Arc::new(ResponseTimeProbe::new(
                HttpProbe::new(self.client.clone(), path),
                spec.threshold().unwrap_or(self.response_time_threshold),
            ))),
            ProbeSpec::Custom { name } => self.custom.get(name).map(|p| p.value().clone()),
        }
    }

    async fn run_one(&self, spec: &ProbeSpec, endpoint: &Endpoint) -> ProbeOutcome {
        let Some(probe) = self.probe_for(spec) else {
            return ProbeOutcome::critical(format!("no probe registered for {}", spec.key()));
        };
        match timeout(self.timeout, probe.check(endpoint)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::critical(format!(
                "{} probe timed out after {:?}",
                probe.kind(),
                self.timeout
            )),
        }
    }

    /// Probe `instance` once. Returns `None` when cancelled before all
    /// probes finished; partial runs are never reported.
    pub async fn run(&self, instance: &ServiceView, cancel: &CancellationToken) -> Option<HealthRecord> {
        let probes = &instance.health_check.probes;
        let all = join_all(
            probes
                .iter()
                .map(|spec| async move { (spec.key(), self.run_one(spec, &instance.endpoint).await) }),
        );

        let outcomes: BTreeMap<String, ProbeOutcome> = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Probe run for {} cancelled", instance.instance_id);
                return None;
            }
            outcomes = all => outcomes.into_iter().collect(),
        };

        let record = HealthRecord::from_outcomes(outcomes, self.clock.now());
        if !record.status.is_passing() {
            warn!(
                "Instance {} of {} is {}: {}",
                instance.instance_id,
                instance.service_name,
                record.status,
                record.message.as_deref().unwrap_or("no detail")
            );
        }
        Some(record)
    }
}
