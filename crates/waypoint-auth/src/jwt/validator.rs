//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Token validators

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use std::collections::HashMap;
use tracing::debug;

use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::principal::Principal;

use super::claims::JwtClaims;

/// Turns a bearer credential into a principal
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> AuthResult<Principal>;
}

/// HMAC JWT validator
pub struct JwtValidator {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: JwtConfig) -> AuthResult<Self> {
        if config.secret.is_empty() {
            return Err(AuthError::configuration("JWT secret must not be empty"));
        }

        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(config.algorithm.into());
        validation.set_audience(&[&config.audience]);
        validation.set_issuer(&[&config.issuer]);
        validation.validate_nbf = true;
        validation.leeway = config.leeway_secs;

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    /// Sign a token for `user_id` using this validator's configuration
    pub fn issue(
        &self,
        user_id: &str,
        roles: Vec<String>,
        custom_claims: Option<HashMap<String, serde_json::Value>>,
    ) -> AuthResult<String> {
        let claims = JwtClaims::new(user_id, roles, &self.config, custom_claims);
        encode(&Header::new(self.config.algorithm.into()), &claims, &self.encoding_key)
            .map_err(|e| AuthError::token_generation(e.to_string()))
    }

    /// Decode and verify a token, returning its claims
    pub fn decode_claims(&self, token: &str) -> AuthResult<JwtClaims> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::token_expired("Token has expired"),
                ErrorKind::ImmatureSignature => {
                    AuthError::token_not_yet_valid("Token not yet valid")
                }
                _ => AuthError::token_validation(e.to_string()),
            },
        )?;
        debug!("Validated JWT token for user: {}", data.claims.sub);
        Ok(data.claims)
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> AuthResult<Principal> {
        self.decode_claims(token).map(JwtClaims::into_principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> JwtValidator {
        JwtValidator::new(JwtConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let v = validator();
        let token = v.issue("user-1", vec!["admin".to_string()], None).unwrap();
        let principal = v.validate(&token).await.unwrap();
        assert_eq!(principal.user_id, "user-1");
        assert!(principal.has_role("admin"));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let token = validator().issue("user-1", vec![], None).unwrap();
        let other = JwtValidator::new(JwtConfig {
            secret: "another-secret".to_string(),
            ..JwtConfig::default()
        })
        .unwrap();
        let err = other.validate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenValidation(_)));
    }

    #[tokio::test]
    async fn test_wrong_audience_rejected() {
        let issuer = JwtValidator::new(JwtConfig {
            audience: "someone-else".to_string(),
            ..JwtConfig::default()
        })
        .unwrap();
        let token = issuer.issue("user-1", vec![], None).unwrap();
        assert!(validator().validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_token() {
        let v = validator();
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            sub: "user-1".to_string(),
            iss: "waypoint".to_string(),
            aud: "waypoint-clients".to_string(),
            iat: now - 7200,
            exp: now - 3600,
            nbf: None,
            roles: vec![],
            custom: HashMap::new(),
        };
        let token = encode(&Header::default(), &claims, &v.encoding_key).unwrap();
        let err = v.validate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired(_)));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        assert!(validator().validate("not-a-jwt").await.is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let result = JwtValidator::new(JwtConfig {
            secret: String::new(),
            ..JwtConfig::default()
        });
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }
}
