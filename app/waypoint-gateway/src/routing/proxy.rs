//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! HTTP proxy implementation
//!
//! Forwards one request to one upstream instance. Bodies are streamed in
//! both directions; nothing is buffered.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Response};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::matcher::RouteMatch;
use crate::config::DispatchConfig;
use crate::error::GatewayError;
use crate::middleware::RequestScope;
use crate::types::Endpoint;
use crate::GatewayResult;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_SERVICE_NAME: &str = "x-service-name";
pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_USER_ID: &str = "x-user-id";
pub const X_USER_ROLES: &str = "x-user-roles";

/// Connection-scoped headers that never cross a proxy
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// The parts of an inbound request the proxy reads
#[derive(Debug)]
pub struct Outbound<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    pub route: &'a RouteMatch,
    pub scope: &'a RequestScope,
}

/// HTTP proxy for gateway
pub struct Proxy {
    http_client: Client,
    upstream_timeout: Duration,
}

impl Proxy {
    pub fn new(config: &DispatchConfig) -> GatewayResult<Self> {
        let http_client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            http_client,
            upstream_timeout: config.upstream_timeout,
        })
    }

    /// Upstream URL for `route` on `endpoint`
    pub fn upstream_url(endpoint: &Endpoint, route: &RouteMatch) -> String {
        format!("{}{}", endpoint.base_url(), route.path_and_query())
    }

    /// Headers sent upstream: inbound headers minus hop-by-hop and `Host`,
    /// plus forwarding, routing, correlation and principal headers.
    pub fn upstream_headers(outbound: &Outbound<'_>) -> HeaderMap {
        let inbound = outbound.headers;
        let mut headers = HeaderMap::with_capacity(inbound.len() + 6);
        for (name, value) in inbound.iter() {
            if is_hop_by_hop(name) || name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(host) = inbound.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }
        if let Some(addr) = outbound.scope.client_addr {
            let client = addr.ip().to_string();
            let chain = match inbound.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client}"),
                _ => client,
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        set_header(&mut headers, X_SERVICE_NAME, &outbound.route.service_name);
        set_header(&mut headers, X_REQUEST_ID, &outbound.scope.request_id);

        // never trust identity headers from the client
        headers.remove(X_USER_ID);
        headers.remove(X_USER_ROLES);
        if let Some(principal) = &outbound.scope.principal {
            set_header(&mut headers, X_USER_ID, &principal.user_id);
            set_header(&mut headers, X_USER_ROLES, &principal.roles.join(","));
        }
        headers
    }

    /// Send the request to `endpoint` and stream the answer back.
    ///
    /// Every failure to obtain a response is `BadGateway`.
    pub async fn forward(
        &self,
        endpoint: &Endpoint,
        outbound: &Outbound<'_>,
        body: Option<Body>,
    ) -> GatewayResult<Response<Body>> {
        let url = Self::upstream_url(endpoint, outbound.route);
        let timeout = outbound
            .scope
            .remaining(self.upstream_timeout)
            .ok_or_else(|| GatewayError::BadGateway("request deadline exceeded".to_string()))?;
        debug!(
            request_id = %outbound.scope.request_id,
            "Proxying {} to: {}",
            outbound.method,
            url
        );

        let mut request = self
            .http_client
            .request(outbound.method.clone(), &url)
            .headers(Self::upstream_headers(outbound))
            .timeout(timeout);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "timed out"
            } else if e.is_connect() {
                "connect failed"
            } else {
                "transport error"
            };
            GatewayError::BadGateway(format!("{} {}: {}", endpoint.authority(), reason, e))
        })?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream.headers().iter() {
                if !is_hop_by_hop(name) {
                    headers.append(name.clone(), value.clone());
                }
            }
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| GatewayError::Internal(format!("Failed to build response: {e}")))
    }
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
