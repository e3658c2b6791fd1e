//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Routing submodule containing the reverse-proxy dispatcher

pub mod core;
pub mod matcher;
pub mod proxy;

// Re-export main types
pub use core::{is_retryable, Dispatcher};
pub use matcher::RouteMatch;
pub use proxy::Proxy;
