//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Gateway submodule containing the main gateway implementation

pub mod core;
pub mod health;
pub mod state;

// Re-export main types
pub use core::{WaypointGateway, GATEWAY_TAG};
pub use health::{CheckerSettings, HealthChecker, HealthSink, InstanceSource};
pub use state::GatewayState;
