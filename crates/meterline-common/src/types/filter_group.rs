//! Filter groups: prioritized property predicates that select a pricing tier

use crate::error::{MeteringError, Result};
use crate::types::usage::validate_filters;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Named, prioritized predicate over event properties.
///
/// Every condition must hold for the group to match; a group with no
/// conditions matches every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub id: String,
    #[serde(default)]
    pub priority: i64,
    /// Property name to allowed values
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
}

impl FilterGroup {
    pub fn new(id: impl Into<String>, priority: i64) -> Self {
        Self {
            id: id.into(),
            priority,
            filters: BTreeMap::new(),
        }
    }

    /// Add a condition `property IN values`
    pub fn with_filter<I, S>(mut self, property: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(property.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Reject a blank id, a blank property name, or a condition with no values
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(MeteringError::Validation("filter group id is required".into()));
        }
        validate_filters(&self.filters)
    }

    /// Number of conditions in the predicate
    pub fn condition_count(&self) -> usize {
        self.filters.len()
    }

    /// Whether every condition holds. Only string properties compare equal to
    /// allowed values, as with `JSONExtractString`.
    pub fn matches(&self, properties: &Map<String, Value>) -> bool {
        self.filters.iter().all(|(property, allowed)| {
            properties
                .get(property)
                .and_then(Value::as_str)
                .map(|v| allowed.iter().any(|a| a == v))
                .unwrap_or(false)
        })
    }
}
