//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Authentication configuration module

pub mod jwt;

pub use jwt::{JwtAlgorithm, JwtConfig};
