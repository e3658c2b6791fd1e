//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Coordination store backends

pub mod consul;
pub mod factory;
pub mod memory;
pub mod trait_def;

pub use consul::{ConsulCheckSettings, ConsulStore};
pub use factory::create_store;
pub use memory::MemoryStore;
pub use trait_def::{CoordinationStore, StoreHealthEntry};
