//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! The auth gate run in front of the dispatcher
//!
//! A request is checked against three lists, in order:
//!
//! 1. public patterns: matching requests skip authentication entirely
//! 2. a bearer credential is required and validated
//! 3. admin patterns: matching requests also need one of the admin roles

use http::{header::AUTHORIZATION, HeaderMap, Method, Request};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::error::{AuthError, AuthResult};
use crate::jwt::TokenValidator;
use crate::principal::{Principal, RolePredicate};

/// A `METHOD:/path-prefix` pattern. `*` or an omitted method matches any method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    method: Option<Method>,
    prefix: String,
}

impl RoutePattern {
    pub fn new(method: Option<Method>, prefix: impl Into<String>) -> AuthResult<Self> {
        let prefix = prefix.into();
        if !prefix.starts_with('/') {
            return Err(AuthError::invalid_pattern(format!(
                "path prefix must start with '/': {prefix}"
            )));
        }
        Ok(Self { method, prefix })
    }

    pub fn parse(pattern: &str) -> AuthResult<Self> {
        let pattern = pattern.trim();
        match pattern.split_once(':') {
            Some((method, prefix)) => {
                let method = match method.trim() {
                    "*" | "" => None,
                    m => Some(
                        Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                            .map_err(|_| AuthError::invalid_pattern(pattern.to_string()))?,
                    ),
                };
                Self::new(method, prefix.trim())
            }
            None => Self::new(None, pattern),
        }
    }

    /// Prefix match on whole path segments: `/health` matches `/health`
    /// and `/health/live` but not `/healthz`.
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(m) = &self.method {
            if m != method {
                return false;
            }
        }
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || self.prefix.ends_with('/'),
            None => false,
        }
    }
}

impl FromStr for RoutePattern {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method {
            Some(m) => write!(f, "{}:{}", m, self.prefix),
            None => write!(f, "*:{}", self.prefix),
        }
    }
}

/// Extract the bearer token from an `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> AuthResult<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AuthError::missing_credential("Authorization header required"))?
        .to_str()
        .map_err(|_| AuthError::token_validation("Authorization header is not valid ASCII"))?;

    let (scheme, token) = value
        .split_once(' ')
        .ok_or_else(|| AuthError::token_validation("Expected 'Bearer <token>'"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::token_validation(format!(
            "Unsupported authorization scheme: {scheme}"
        )));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::missing_credential("Empty bearer token"));
    }
    Ok(token)
}

/// Auth gate
#[derive(Clone)]
pub struct AuthGate {
    validator: Arc<dyn TokenValidator>,
    public: Vec<RoutePattern>,
    admin: Vec<RoutePattern>,
    admin_roles: RolePredicate,
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("public", &self.public)
            .field("admin", &self.admin)
            .field("admin_roles", &self.admin_roles)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn builder(validator: Arc<dyn TokenValidator>) -> AuthGateBuilder {
        AuthGateBuilder {
            validator,
            public: Vec::new(),
            admin: Vec::new(),
            admin_roles: RolePredicate::any_of(crate::DEFAULT_ADMIN_ROLES.iter().copied()),
        }
    }

    pub fn is_public(&self, method: &Method, path: &str) -> bool {
        self.public.iter().any(|p| p.matches(method, path))
    }

    pub fn is_admin(&self, method: &Method, path: &str) -> bool {
        self.admin.iter().any(|p| p.matches(method, path))
    }

    pub fn admin_roles(&self) -> &RolePredicate {
        &self.admin_roles
    }

    /// Check a request.
    ///
    /// Returns `Ok(None)` for public routes, `Ok(Some(principal))` once the
    /// credential is validated, and an [`AuthError`] otherwise. Only the
    /// request head is read; the body is never touched.
    pub fn require_auth<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = AuthResult<Option<Principal>>> + Send + '_ {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let token = bearer_token(req.headers()).map(str::to_string);
        async move { self.check(&method, &path, token).await }
    }

    /// Same as [`AuthGate::require_auth`] for callers holding the parts separately.
    pub async fn authenticate(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> AuthResult<Option<Principal>> {
        let token = bearer_token(headers).map(str::to_string);
        self.check(method, path, token).await
    }

    async fn check(
        &self,
        method: &Method,
        path: &str,
        token: AuthResult<String>,
    ) -> AuthResult<Option<Principal>> {
        if self.is_public(method, path) {
            debug!(%method, path, "Public route, skipping authentication");
            return Ok(None);
        }

        let principal = self.validator.validate(&token?).await?;

        if self.is_admin(method, path) && !principal.satisfies(&self.admin_roles) {
            return Err(AuthError::authorization_failed(format!(
                "user {} lacks an admin role for {} {}",
                principal.user_id, method, path
            )));
        }

        Ok(Some(principal))
    }
}

/// Builder for [`AuthGate`]
pub struct AuthGateBuilder {
    validator: Arc<dyn TokenValidator>,
    public: Vec<RoutePattern>,
    admin: Vec<RoutePattern>,
    admin_roles: RolePredicate,
}

impl AuthGateBuilder {
    pub fn public_paths<I, S>(mut self, patterns: I) -> AuthResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            self.public.push(RoutePattern::parse(p.as_ref())?);
        }
        Ok(self)
    }

    pub fn admin_paths<I, S>(mut self, patterns: I) -> AuthResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            self.admin.push(RoutePattern::parse(p.as_ref())?);
        }
        Ok(self)
    }

    pub fn admin_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.admin_roles = RolePredicate::any_of(roles);
        self
    }

    pub fn build(self) -> AuthGate {
        AuthGate {
            validator: self.validator,
            public: self.public,
            admin: self.admin,
            admin_roles: self.admin_roles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JwtConfig;
    use crate::jwt::JwtValidator;

    fn gate() -> (AuthGate, Arc<JwtValidator>) {
        let validator = Arc::new(JwtValidator::new(JwtConfig::default()).unwrap());
        let gate = AuthGate::builder(validator.clone())
            .public_paths(["GET:/health", "*:/info", "OPTIONS:/"])
            .unwrap()
            .admin_paths(["*:/api/v1/services/instances", "POST:/api/v1/services"])
            .unwrap()
            .build();
        (gate, validator)
    }

    fn request(method: Method, path: &str, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(t) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {t}"));
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_pattern_parse() {
        let p = RoutePattern::parse("get:/health").unwrap();
        assert!(p.matches(&Method::GET, "/health/live"));
        assert!(!p.matches(&Method::POST, "/health"));
        assert!(!p.matches(&Method::GET, "/healthz"));

        let any = RoutePattern::parse("/info").unwrap();
        assert!(any.matches(&Method::DELETE, "/info"));
        assert_eq!(any.to_string(), "*:/info");

        assert!(RoutePattern::parse("GET:health").is_err());
    }

    #[tokio::test]
    async fn test_public_route_skips_auth() {
        let (gate, _) = gate();
        let req = request(Method::GET, "/health/ready", None);
        assert_eq!(gate.require_auth(&req).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_token_unauthorized() {
        let (gate, _) = gate();
        let req = request(Method::GET, "/api/v1/users/1", None);
        let err = gate.require_auth(&req).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredential(_)));
        assert!(!err.is_forbidden());
    }

    #[tokio::test]
    async fn test_valid_token_returns_principal() {
        let (gate, validator) = gate();
        let token = validator.issue("u-1", vec!["user".to_string()], None).unwrap();
        let req = request(Method::GET, "/api/v1/users/1", Some(&token));
        let principal = gate.require_auth(&req).await.unwrap().unwrap();
        assert_eq!(principal.user_id, "u-1");
    }

    #[tokio::test]
    async fn test_admin_route_requires_role() {
        let (gate, validator) = gate();
        let user = validator.issue("u-1", vec!["user".to_string()], None).unwrap();
        let admin = validator.issue("u-2", vec!["admin".to_string()], None).unwrap();

        let req = request(Method::DELETE, "/api/v1/services/instances/a", Some(&user));
        assert!(gate.require_auth(&req).await.unwrap_err().is_forbidden());

        let req = request(Method::DELETE, "/api/v1/services/instances/a", Some(&admin));
        assert!(gate.require_auth(&req).await.unwrap().is_some());

        // GET on the service listing is not an admin path
        let req = request(Method::GET, "/api/v1/services", Some(&user));
        assert!(gate.require_auth(&req).await.is_ok());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(matches!(bearer_token(&headers), Err(AuthError::MissingCredential(_))));

        headers.insert(AUTHORIZATION, "bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "abc");

        headers.insert(AUTHORIZATION, "Basic dXNlcjpwYXNz".parse().unwrap());
        assert!(matches!(bearer_token(&headers), Err(AuthError::TokenValidation(_))));
    }
}
