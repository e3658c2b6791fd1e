//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Route matching implementation
//!
//! Proxied paths have the shape `/<prefix...>/<service-name>/<rest...>`
//! where the prefix has a configured number of segments.

use crate::error::GatewayError;
use crate::GatewayResult;

/// Route match result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Prefix segments joined with a leading slash, e.g. `/api/v1`
    pub prefix: String,

    /// Routed service
    pub service_name: String,

    /// Upstream path, always starting with `/`
    pub upstream_path: String,

    /// Query string without the `?`
    pub query: Option<String>,
}

impl RouteMatch {
    /// Split `path` after `prefix_segments` segments
    pub fn parse(path: &str, query: Option<&str>, prefix_segments: usize) -> GatewayResult<Self> {
        let trimmed = path.strip_prefix('/').ok_or_else(|| {
            GatewayError::BadRequest(format!("path must start with '/': {path}"))
        })?;

        let mut parts = trimmed.splitn(prefix_segments + 2, '/');
        let mut prefix = String::new();
        for _ in 0..prefix_segments {
            match parts.next() {
                Some(segment) if !segment.is_empty() => {
                    prefix.push('/');
                    prefix.push_str(segment);
                }
                _ => return Err(missing_service(path)),
            }
        }

        let service_name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(missing_service(path)),
        };
        let upstream_path = format!("/{}", parts.next().unwrap_or(""));

        Ok(Self {
            prefix,
            service_name,
            upstream_path,
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// Upstream path with the query string appended
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.upstream_path, query),
            None => self.upstream_path.clone(),
        }
    }
}

fn missing_service(path: &str) -> GatewayError {
    GatewayError::BadRequest(format!("no service name in path {path}"))
}
