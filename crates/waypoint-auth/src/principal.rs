//! SPDX-FileCopyrightText: © 2025 Cory Parent <goedelsoup+orasi@goedelsoup.io>
//! SPDX-License-Identifier: Apache-2.0
//!

//! Authenticated principals and role predicates

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed metadata value carried by a principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// Convert a JSON claim into a metadata value. Objects and mixed
    /// arrays have no typed counterpart and are rendered as JSON text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::Text(s.clone())),
            serde_json::Value::Array(items) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                Some(strings.map(Self::List).unwrap_or_else(|| Self::Text(value.to_string())))
            }
            serde_json::Value::Object(_) => Some(Self::Text(value.to_string())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    /// User identifier (`sub` for JWTs)
    pub user_id: String,

    /// Granted roles
    pub roles: Vec<String>,

    /// Additional claims
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            roles,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Check if the principal has a role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// Check a role predicate against this principal
    pub fn satisfies(&self, predicate: &RolePredicate) -> bool {
        predicate.matches(self)
    }
}

/// Role requirement evaluated against a principal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolePredicate {
    /// No role required
    Any,

    /// At least one of the listed roles
    AnyOf(Vec<String>),

    /// Every listed role
    AllOf(Vec<String>),
}

impl RolePredicate {
    pub fn any_of<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyOf(roles.into_iter().map(Into::into).collect())
    }

    pub fn all_of<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllOf(roles.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, principal: &Principal) -> bool {
        match self {
            Self::Any => true,
            Self::AnyOf(roles) => roles.iter().any(|r| principal.has_role(r)),
            Self::AllOf(roles) => roles.iter().all(|r| principal.has_role(r)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal::new("user-1", roles.iter().map(|r| r.to_string()).collect())
    }

    #[test]
    fn test_any_of() {
        let admin = RolePredicate::any_of(["admin", "super_admin"]);
        assert!(principal(&["user", "admin"]).satisfies(&admin));
        assert!(!principal(&["user"]).satisfies(&admin));
        assert!(!principal(&[]).satisfies(&admin));
    }

    #[test]
    fn test_all_of() {
        let both = RolePredicate::all_of(["reader", "writer"]);
        assert!(principal(&["reader", "writer", "x"]).satisfies(&both));
        assert!(!principal(&["reader"]).satisfies(&both));
        assert!(principal(&[]).satisfies(&RolePredicate::Any));
    }

    #[test]
    fn test_metadata_from_json() {
        assert_eq!(
            MetadataValue::from_json(&serde_json::json!("acme")),
            Some(MetadataValue::Text("acme".to_string()))
        );
        assert_eq!(
            MetadataValue::from_json(&serde_json::json!(7)),
            Some(MetadataValue::Int(7))
        );
        assert_eq!(
            MetadataValue::from_json(&serde_json::json!(["a", "b"])),
            Some(MetadataValue::List(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(MetadataValue::from_json(&serde_json::Value::Null), None);
        assert!(matches!(
            MetadataValue::from_json(&serde_json::json!({"k": 1})),
            Some(MetadataValue::Text(_))
        ));
    }
}
