//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Service discovery: registry, change propagation, cache, selection and probes

pub mod backends;
pub mod cache;
pub mod core;
pub mod health;
pub mod registry;
pub mod watch;

// Re-export main types
pub use backends::{create_store, ConsulStore, CoordinationStore, MemoryStore, StoreHealthEntry};
pub use cache::{CacheEntry, DiscoveryCache};
pub use core::ServiceDiscovery;
pub use health::{HttpProbe, Probe, ProbeRunner, ResponseTimeProbe, TcpProbe};
pub use registry::{RegistrySettings, ServiceRegistry};
pub use watch::{ChangeListener, FnListener, Watcher, WatcherSet};
