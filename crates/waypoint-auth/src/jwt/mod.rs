//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Bearer token validation

pub mod claims;
pub mod validator;

pub use claims::JwtClaims;
pub use validator::{JwtValidator, TokenValidator};
