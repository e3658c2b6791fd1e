//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Error types for Waypoint Gateway

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use waypoint_auth::AuthError;

/// Error category, the stable classification exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    BadRequest,
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotFound,
    Duplicate,
    ServiceUnavailable,
    BadGateway,
    StoreUnavailable,
    Timeout,
    Configuration,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::InvalidInput => "invalid_input",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::ServiceUnavailable => "service_unavailable",
            Self::BadGateway => "bad_gateway",
            Self::StoreUnavailable => "store_unavailable",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("No healthy instances for service: {0}")]
    NoHealthyInstances(String),

    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Unauthorized(String),

    #[error("Authorization error: {0}")]
    Forbidden(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Health check error: {0}")]
    Health(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Configuration(_) => ErrorCategory::Configuration,
            GatewayError::InvalidInput(_) => ErrorCategory::InvalidInput,
            GatewayError::BadRequest(_) => ErrorCategory::BadRequest,
            GatewayError::NotFound(_) => ErrorCategory::NotFound,
            GatewayError::Duplicate(_) => ErrorCategory::Duplicate,
            GatewayError::NoHealthyInstances(_) | GatewayError::Shutdown(_) => {
                ErrorCategory::ServiceUnavailable
            }
            GatewayError::StoreUnavailable(_) => ErrorCategory::StoreUnavailable,
            GatewayError::BadGateway(_) | GatewayError::Network(_) => ErrorCategory::BadGateway,
            GatewayError::Timeout(_) => ErrorCategory::Timeout,
            GatewayError::Unauthorized(_) => ErrorCategory::Unauthorized,
            GatewayError::Forbidden(_) => ErrorCategory::Forbidden,
            GatewayError::Serialization(_)
            | GatewayError::Health(_)
            | GatewayError::Internal(_)
            | GatewayError::Other(_) => ErrorCategory::Internal,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        if err.is_forbidden() {
            GatewayError::Forbidden(err.to_string())
        } else {
            GatewayError::Unauthorized(err.to_string())
        }
    }
}
