//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! JWT claims definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::JwtConfig;
use crate::principal::{MetadataValue, Principal};

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Issuer
    pub iss: String,

    /// Audience
    pub aud: String,

    /// Issued at
    pub iat: i64,

    /// Expiration time
    pub exp: i64,

    /// Not before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,

    /// User roles
    #[serde(default)]
    pub roles: Vec<String>,

    /// Any other claims
    #[serde(flatten, default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl JwtClaims {
    /// Create new claims valid from now for `config.expiration_secs`
    pub fn new(
        user_id: impl Into<String>,
        roles: Vec<String>,
        config: &JwtConfig,
        custom_claims: Option<HashMap<String, serde_json::Value>>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.into(),
            iss: config.issuer.clone(),
            aud: config.audience.clone(),
            iat: now,
            exp: now + config.expiration_secs as i64,
            nbf: Some(now),
            roles,
            custom: custom_claims.unwrap_or_default(),
        }
    }

    /// Check if user has role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Build the principal carried through the request pipeline
    pub fn into_principal(self) -> Principal {
        let metadata = self
            .custom
            .iter()
            .filter_map(|(k, v)| MetadataValue::from_json(v).map(|v| (k.clone(), v)))
            .collect();
        Principal {
            user_id: self.sub,
            roles: self.roles,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_new() {
        let config = JwtConfig::default();
        let claims = JwtClaims::new("user-7", vec!["admin".to_string()], &config, None);
        assert_eq!(claims.sub, "user-7");
        assert_eq!(claims.iss, "waypoint");
        assert_eq!(claims.exp - claims.iat, config.expiration_secs as i64);
        assert!(claims.has_role("admin"));
        assert!(!claims.has_role("user"));
    }

    #[test]
    fn test_extra_claims_flatten_into_metadata() {
        let raw = serde_json::json!({
            "sub": "u1",
            "iss": "waypoint",
            "aud": "waypoint-clients",
            "iat": 1,
            "exp": 2,
            "roles": ["user"],
            "tenant": "acme",
            "tier": 3
        });
        let claims: JwtClaims = serde_json::from_value(raw).unwrap();
        let principal = claims.into_principal();
        assert_eq!(principal.user_id, "u1");
        assert_eq!(principal.roles, vec!["user".to_string()]);
        assert_eq!(
            principal.metadata.get("tenant"),
            Some(&MetadataValue::Text("acme".to_string()))
        );
        assert_eq!(principal.metadata.get("tier"), Some(&MetadataValue::Int(3)));
    }
}
