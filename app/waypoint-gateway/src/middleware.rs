//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Request pipeline
//!
//! Every inbound request passes, in order: correlation id, panic recovery,
//! then the access log once a response exists. The auth layer sits inside
//! the pipeline, so rejected requests are still logged and still carry
//! their request id.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use waypoint_auth::{AuthGate, Principal};

use crate::clock::normalize_request_id;
use crate::config::GatewayConfig;
use crate::error::{ErrorCategory, GatewayError};
use crate::routing::proxy::X_REQUEST_ID;

/// Per-request context, stored as a request extension
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub request_id: String,
    pub client_addr: Option<SocketAddr>,
    pub started_at: Instant,
    /// Every sub-operation of the request must finish by this instant
    pub deadline: Instant,
    /// Set by the auth layer for authenticated requests
    pub principal: Option<Principal>,
}

impl RequestScope {
    pub fn new(request_id: impl Into<String>, client_addr: Option<SocketAddr>, budget: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            request_id: request_id.into(),
            client_addr,
            started_at,
            deadline: started_at + budget,
            principal: None,
        }
    }

    /// Time left before the deadline, capped at `cap`; `None` once it has passed
    pub fn remaining(&self, cap: Duration) -> Option<Duration> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            None
        } else {
            Some(left.min(cap))
        }
    }
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::BadRequest | ErrorCategory::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCategory::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCategory::Forbidden => StatusCode::FORBIDDEN,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Duplicate => StatusCode::CONFLICT,
        ErrorCategory::ServiceUnavailable | ErrorCategory::StoreUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorCategory::BadGateway => StatusCode::BAD_GATEWAY,
        ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCategory::Configuration | ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorCategory,
    pub code: u16,
    pub message: String,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A [`GatewayError`] on its way to becoming an HTTP response
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<GatewayError>, scope: &RequestScope) -> Self {
        Self {
            error: error.into(),
            request_id: Some(scope.request_id.clone()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            request_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.error.category();
        let status = status_for(category);
        // internals stay in the log
        let message = match category {
            ErrorCategory::Internal => "internal error".to_string(),
            _ => self.error.to_string(),
        };
        if status.is_server_error() {
            warn!(request_id = ?self.request_id, "{}: {}", category, self.error);
        } else {
            debug!(request_id = ?self.request_id, "{}: {}", category, self.error);
        }

        let body = ErrorBody {
            error: category,
            code: status.as_u16(),
            message,
            request_id: self.request_id,
            timestamp: Utc::now(),
        };
        let mut response = (status, Json(body)).into_response();
        if category == ErrorCategory::Unauthorized {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

/// Settings of the request pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Deadline budget of every request
    pub request_budget: Duration,
}

impl From<&GatewayConfig> for PipelineSettings {
    /// Room for the first attempt and every retry
    fn from(config: &GatewayConfig) -> Self {
        let attempts = config.dispatch.retry_budget.saturating_add(1).min(u32::MAX as usize) as u32;
        Self {
            request_budget: config.dispatch.upstream_timeout.saturating_mul(attempts),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Correlation id, panic recovery and access log
pub async fn request_pipeline(
    State(settings): State<Arc<PipelineSettings>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = normalize_request_id(
        req.headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok()),
    );
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let scope = RequestScope::new(request_id.clone(), client_addr, settings.request_budget);
    let started_at = scope.started_at;
    req.extensions_mut().insert(scope);

    let mut response = match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(payload) => {
            error!(
                request_id = %request_id,
                "Request handler panicked: {}",
                panic_message(payload.as_ref())
            );
            ApiError {
                error: GatewayError::Internal("handler panicked".to_string()),
                request_id: Some(request_id.clone()),
            }
            .into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }

    let latency_ms = started_at.elapsed().as_millis() as u64;
    info!(
        target: "waypoint::access",
        request_id = %request_id,
        client_addr = %client_addr.map(|a| a.to_string()).unwrap_or_default(),
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms,
        user_agent = %user_agent,
        "request completed"
    );
    response
}

/// Authenticate requests through the auth gate. A `None` gate lets everything through.
pub async fn auth_layer(
    State(gate): State<Option<Arc<AuthGate>>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(gate) = gate else {
        return next.run(req).await;
    };

    match gate.require_auth(&req).await {
        Ok(principal) => {
            if let Some(principal) = principal {
                debug!(user_id = %principal.user_id, "Request authenticated");
                if let Some(scope) = req.extensions_mut().get_mut::<RequestScope>() {
                    scope.principal = Some(principal);
                }
            }
            next.run(req).await
        }
        Err(e) => {
            let request_id = req
                .extensions()
                .get::<RequestScope>()
                .map(|s| s.request_id.clone());
            warn!(request_id = ?request_id, "Authentication failed: {}", e);
            ApiError {
                error: GatewayError::from(e),
                request_id,
            }
            .into_response()
        }
    }
}
