//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Authentication gate for the Waypoint gateway
//!
//! This crate decides whether an inbound request may proceed to the
//! dispatcher. It knows nothing about the HTTP framework in use: requests
//! are inspected through the `http` crate types only.
//!
//! # Features
//!
//! - **Allow-lists**: `METHOD:/prefix` patterns that skip authentication
//! - **Admin paths**: patterns that additionally require an admin role
//! - **Principals**: user id, roles and a typed metadata map
//! - **Role predicates**: `RolePredicate::any_of` for downstream checks
//! - **Pluggable validation**: any [`TokenValidator`]; [`JwtValidator`] is
//!   provided for HMAC-signed JWTs
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use waypoint_auth::{AuthGate, JwtConfig, JwtValidator};
//!
//! let validator = JwtValidator::new(JwtConfig::default()).unwrap();
//! let gate = AuthGate::builder(Arc::new(validator))
//!     .public_paths(["GET:/health", "*:/info"])
//!     .unwrap()
//!     .build();
//!
//! assert!(gate.is_public(&http::Method::GET, "/health"));
//! assert!(!gate.is_public(&http::Method::GET, "/api/v1/users"));
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod jwt;
pub mod principal;

pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use gate::{AuthGate, AuthGateBuilder, RoutePattern};
pub use jwt::{JwtClaims, JwtValidator, TokenValidator};
pub use principal::{MetadataValue, Principal, RolePredicate};

/// Default JWT expiration time in seconds (used when issuing tokens)
pub const DEFAULT_JWT_EXPIRATION_SECS: u64 = 3600;

/// Default clock skew tolerance applied to `exp` and `nbf`
pub const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Roles treated as administrators when none are configured
pub const DEFAULT_ADMIN_ROLES: &[&str] = &["admin", "super_admin"];

/// Bearer scheme prefix for the `Authorization` header
pub const BEARER_PREFIX: &str = "Bearer ";
