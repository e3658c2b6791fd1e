//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Authentication errors

use thiserror::Error;

/// Authentication result type
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    #[error("Token expired: {0}")]
    TokenExpired(String),

    #[error("Token not yet valid: {0}")]
    TokenNotYetValid(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Invalid route pattern: {0}")]
    InvalidPattern(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Token generation failed: {0}")]
    TokenGeneration(String),
}

impl AuthError {
    pub fn missing_credential(msg: impl Into<String>) -> Self {
        Self::MissingCredential(msg.into())
    }

    pub fn token_validation(msg: impl Into<String>) -> Self {
        Self::TokenValidation(msg.into())
    }

    pub fn token_expired(msg: impl Into<String>) -> Self {
        Self::TokenExpired(msg.into())
    }

    pub fn token_not_yet_valid(msg: impl Into<String>) -> Self {
        Self::TokenNotYetValid(msg.into())
    }

    pub fn authorization_failed(msg: impl Into<String>) -> Self {
        Self::AuthorizationFailed(msg.into())
    }

    pub fn invalid_pattern(msg: impl Into<String>) -> Self {
        Self::InvalidPattern(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn token_generation(msg: impl Into<String>) -> Self {
        Self::TokenGeneration(msg.into())
    }

    /// True when the caller presented a valid credential but lacks the role.
    ///
    /// Maps to 403; every other variant raised by the gate maps to 401.
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::AuthorizationFailed(_))
    }
}
