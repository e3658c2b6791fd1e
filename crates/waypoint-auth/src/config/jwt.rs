//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! JWT configuration

use serde::{Deserialize, Serialize};

/// JWT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// Shared HMAC secret
    pub secret: String,

    /// Lifetime of issued tokens in seconds
    pub expiration_secs: u64,

    /// Expected `iss` claim
    pub issuer: String,

    /// Expected `aud` claim
    pub audience: String,

    /// Signing algorithm
    pub algorithm: JwtAlgorithm,

    /// Clock skew tolerance in seconds
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "waypoint-dev-secret-change-in-production".to_string(),
            expiration_secs: crate::DEFAULT_JWT_EXPIRATION_SECS,
            issuer: "waypoint".to_string(),
            audience: "waypoint-clients".to_string(),
            algorithm: JwtAlgorithm::HS256,
            leeway_secs: crate::DEFAULT_LEEWAY_SECS,
        }
    }
}

/// JWT algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    HS256,
    HS384,
    HS512,
}

impl From<JwtAlgorithm> for jsonwebtoken::Algorithm {
    fn from(alg: JwtAlgorithm) -> Self {
        match alg {
            JwtAlgorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            JwtAlgorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            JwtAlgorithm::HS512 => jsonwebtoken::Algorithm::HS512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_config_default() {
        let config = JwtConfig::default();
        assert!(!config.secret.is_empty());
        assert_eq!(config.expiration_secs, crate::DEFAULT_JWT_EXPIRATION_SECS);
        assert_eq!(config.algorithm, JwtAlgorithm::HS256);
        assert_eq!(config.issuer, "waypoint");
        assert_eq!(config.audience, "waypoint-clients");
    }
}
