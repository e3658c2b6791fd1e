//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Core routing implementation
//!
//! A failed dispatch is only retried on another instance when the method is
//! GET, HEAD or OPTIONS and the request declares no body; a streamed body
//! cannot be replayed once handed to the transport.

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Response};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::matcher::RouteMatch;
use super::proxy::{Outbound, Proxy};
use crate::config::GatewayConfig;
use crate::discovery::ServiceDiscovery;
use crate::error::GatewayError;
use crate::middleware::RequestScope;
use crate::GatewayResult;

/// Reverse-proxy dispatcher
pub struct Dispatcher {
    discovery: Arc<ServiceDiscovery>,
    proxy: Proxy,
    api_prefix: String,
    prefix_segments: usize,
    retry_budget: usize,
    cancel: CancellationToken,
}

/// Whether a failed attempt of this request may be repeated elsewhere
pub fn is_retryable(method: &Method, headers: &HeaderMap) -> bool {
    let idempotent = matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS);
    idempotent && !declares_body(headers)
}

fn declares_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    match headers.get(header::CONTENT_LENGTH) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(true, |len| len > 0),
        None => false,
    }
}

impl Dispatcher {
    /// Upstream calls in flight are abandoned once `cancel` fires
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        config: &GatewayConfig,
        cancel: CancellationToken,
    ) -> GatewayResult<Self> {
        Ok(Self {
            discovery,
            proxy: Proxy::new(&config.dispatch)?,
            api_prefix: config.gateway.api_prefix.trim_end_matches('/').to_string(),
            prefix_segments: config.gateway.path_prefix_segments,
            retry_budget: config.dispatch.retry_budget,
            cancel,
        })
    }

    /// Route `request` to a healthy instance of the service named in its path
    pub async fn dispatch(
        &self,
        request: Request<Body>,
        scope: &RequestScope,
    ) -> GatewayResult<Response<Body>> {
        let (parts, body) = request.into_parts();
        let route = RouteMatch::parse(parts.uri.path(), parts.uri.query(), self.prefix_segments)?;
        // auth rules are written against the api prefix; nothing else is proxied
        if route.prefix != self.api_prefix {
            return Err(GatewayError::NotFound(format!("no route for {}", parts.uri.path())));
        }
        let retryable = is_retryable(&parts.method, &parts.headers);
        let attempts = if retryable { 1 + self.retry_budget } else { 1 };

        let outbound = Outbound {
            method: &parts.method,
            headers: &parts.headers,
            route: &route,
            scope,
        };
        // a declared body is streamed through exactly once
        let mut body = if declares_body(&parts.headers) { Some(body) } else { None };
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 1..=attempts {
            let instance = match self
                .discovery
                .select_excluding(&route.service_name, &excluded, self.discovery.default_policy())
                .await
            {
                Ok(instance) => instance,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };

            debug!(
                request_id = %scope.request_id,
                "Dispatching {} {} to {} (attempt {}/{})",
                parts.method,
                route.upstream_path,
                instance.instance_id,
                attempt,
                attempts
            );

            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(GatewayError::Shutdown("gateway is shutting down".to_string()));
                }
                result = self.proxy.forward(&instance.endpoint, &outbound, body.take()) => result,
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        request_id = %scope.request_id,
                        "Upstream {} of {} failed: {}",
                        instance.instance_id,
                        route.service_name,
                        e
                    );
                    excluded.insert(instance.instance_id.clone());
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GatewayError::BadGateway(format!("no upstream answered for {}", route.service_name))
        }))
    }
}
