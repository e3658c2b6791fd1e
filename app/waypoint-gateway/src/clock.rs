//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Time and identifier sources
//!
//! Components take a [`SharedClock`] at construction instead of reading the
//! system clock directly, so tests can drive time explicitly.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Longest inbound request id kept verbatim
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Source of wall-clock and monotonic time
pub trait Clock: Send + Sync + fmt::Debug {
    /// Wall-clock time, used for timestamps in records
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic time, used for TTLs and latencies
    fn monotonic(&self) -> Instant;
}

pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the system and tokio timers
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    wall: DateTime<Utc>,
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.offset()).unwrap_or(chrono::Duration::zero());
        self.wall + offset
    }

    fn monotonic(&self) -> Instant {
        self.base + self.offset()
    }
}

/// Fresh 128-bit request id, lowercase hex
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Keep a caller-supplied request id if it is 1 to 128 visible ASCII
/// characters, otherwise generate a new one.
pub fn normalize_request_id(inbound: Option<&str>) -> String {
    match inbound {
        Some(id) if is_valid_request_id(id) => id.to_string(),
        _ => generate_request_id(),
    }
}

pub fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN && id.bytes().all(|b| b.is_ascii_graphic())
}

/// Conventional instance id: `{service}-{host}-{port}`
pub fn generate_instance_id(service_name: &str, host: &str, port: u16) -> String {
    format!("{service_name}-{host}-{port}")
}
