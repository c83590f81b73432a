//! Query parameter objects and usage results

use crate::error::{MeteringError, Result};
use crate::types::aggregation::{AggregationType, WindowSize};
use crate::types::filter_group::FilterGroup;
use crate::types::processed_event::EventStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of rows per discovery batch
pub const DEFAULT_DISCOVERY_BATCH_SIZE: usize = 1000;

fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        return Err(MeteringError::Validation(
            "start_time must be before end_time".into(),
        ));
    }
    Ok(())
}

/// Every filter needs a property name and at least one allowed value
pub fn validate_filters(filters: &BTreeMap<String, Vec<String>>) -> Result<()> {
    for (property, values) in filters {
        if property.is_empty() {
            return Err(MeteringError::Validation(
                "filter property name cannot be empty".into(),
            ));
        }
        if values.is_empty() {
            return Err(MeteringError::Validation(format!(
                "filter on {} has no values",
                property
            )));
        }
    }
    Ok(())
}

/// Usage query for one event name over `[start_time, end_time)`.
/// Tenant and environment come from the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageParams {
    pub event_name: String,
    #[serde(default)]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub aggregation_type: AggregationType,
    /// Property aggregated by SUM/AVG/COUNT_UNIQUE/LATEST
    #[serde(default)]
    pub property_name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Property name to allowed values
    #[serde(default)]
    pub filters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

impl UsageParams {
    pub fn new(
        event_name: impl Into<String>,
        aggregation_type: AggregationType,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            external_customer_id: None,
            customer_id: None,
            aggregation_type,
            property_name: None,
            start_time,
            end_time,
            filters: BTreeMap::new(),
            window_size: None,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property_name = Some(property.into());
        self
    }

    pub fn with_external_customer(mut self, id: impl Into<String>) -> Self {
        self.external_customer_id = Some(id.into());
        self
    }

    pub fn with_customer(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn with_filter<I, S>(mut self, property: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters
            .insert(property.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_window(mut self, window: WindowSize) -> Self {
        self.window_size = Some(window);
        self
    }

    /// Aggregated property, required for every type except COUNT
    pub fn property(&self) -> Result<&str> {
        match self.property_name.as_deref() {
            Some(p) if !p.is_empty() => Ok(p),
            _ => Err(MeteringError::Validation(format!(
                "property_name is required for {} aggregation",
                self.aggregation_type
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_name.is_empty() {
            return Err(MeteringError::Validation("event_name is required".into()));
        }
        validate_window(self.start_time, self.end_time)?;
        if self.aggregation_type.requires_property() {
            self.property()?;
        }
        validate_filters(&self.filters)
    }
}

/// Usage query resolved per best-matching filter group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWithFiltersParams {
    #[serde(flatten)]
    pub usage: UsageParams,
    /// Candidate groups; empty puts every event in one unnamed bucket
    #[serde(default)]
    pub filter_groups: Vec<FilterGroup>,
}

impl UsageWithFiltersParams {
    pub fn new(usage: UsageParams, filter_groups: Vec<FilterGroup>) -> Self {
        Self {
            usage,
            filter_groups,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.usage.validate()?;
        for group in &self.filter_groups {
            group.validate()?;
        }
        Ok(())
    }
}

/// Scope for cost summation over processed events
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummaryParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub meter_id: Option<String>,
    pub price_id: Option<String>,
    pub feature_id: Option<String>,
}

impl UsageSummaryParams {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            validate_window(start, end)?;
        }
        Ok(())
    }
}

/// Processed quantity and cost of one feature over a summary scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureUsageTotal {
    pub feature_id: String,
    pub quantity: Decimal,
    pub cost: Decimal,
    pub event_count: u64,
}

/// Filtered, paginated listing of processed events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetProcessedEventsParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub meter_id: Option<String>,
    pub feature_id: Option<String>,
    pub price_id: Option<String>,
    pub event_status: Option<EventStatus>,
    pub limit: u64,
    pub offset: u64,
    /// Also compute the total number of matching rows
    pub count_total: bool,
}

impl Default for GetProcessedEventsParams {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            customer_id: None,
            subscription_id: None,
            meter_id: None,
            feature_id: None,
            price_id: None,
            event_status: None,
            limit: 50,
            offset: 0,
            count_total: false,
        }
    }
}

impl GetProcessedEventsParams {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(MeteringError::Validation("limit must be positive".into()));
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            validate_window(start, end)?;
        }
        Ok(())
    }
}

/// Resume token for DESC keyset pagination over (timestamp, id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysetCursor {
    pub timestamp: DateTime<Utc>,
    pub id: String,
}

impl KeysetCursor {
    pub fn new(timestamp: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }

    /// Whether `(timestamp, id)` sorts strictly before the cursor
    pub fn admits(&self, timestamp: DateTime<Utc>, id: &str) -> bool {
        (timestamp, id) < (self.timestamp, self.id.as_str())
    }
}

/// Parameters for unprocessed raw event discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindRawEventsParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_customer_ids: Vec<String>,
    #[serde(default)]
    pub event_names: Vec<String>,
    #[serde(default)]
    pub event_ids: Vec<String>,
    pub batch_size: usize,
    #[serde(default)]
    pub cursor: Option<KeysetCursor>,
}

impl Default for FindRawEventsParams {
    fn default() -> Self {
        Self {
            start_time: None,
            end_time: None,
            external_customer_ids: Vec::new(),
            event_names: Vec::new(),
            event_ids: Vec::new(),
            batch_size: DEFAULT_DISCOVERY_BATCH_SIZE,
            cursor: None,
        }
    }
}

impl FindRawEventsParams {
    pub fn for_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_cursor(mut self, cursor: Option<KeysetCursor>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Batch size with zero falling back to the default
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_DISCOVERY_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            validate_window(start, end)?;
        }
        Ok(())
    }
}

/// Value of one time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub window_start: DateTime<Utc>,
    pub value: Decimal,
}

/// Answer to a usage query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Aggregate over the whole window
    pub value: Decimal,
    /// Per-bucket values, empty unless a window size was requested
    pub results: Vec<UsageWindow>,
    pub event_name: String,
    pub aggregation_type: AggregationType,
}

/// Aggregate for one best-match filter group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroupUsage {
    /// Empty when no groups were supplied
    pub filter_group_id: String,
    pub value: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_usage_params_validation() {
        let (start, end) = window();
        assert!(UsageParams::new("api_call", AggregationType::Count, start, end)
            .validate()
            .is_ok());
        assert!(UsageParams::new("api_call", AggregationType::Sum, start, end)
            .validate()
            .is_err());
        assert!(UsageParams::new("api_call", AggregationType::Count, end, start)
            .validate()
            .is_err());
        assert!(UsageParams::new("api_call", AggregationType::Count, start, end)
            .with_filter("model", Vec::<String>::new())
            .validate()
            .is_err());
    }

    #[test]
    fn test_filter_group_ids_required() {
        let (start, end) = window();
        let params = UsageWithFiltersParams::new(
            UsageParams::new("api_call", AggregationType::Count, start, end),
            vec![FilterGroup::new("", 1)],
        );
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_cursor_admits_strictly_older() {
        let (start, _) = window();
        let cursor = KeysetCursor::new(start, "event_5");
        assert!(cursor.admits(start, "event_4"));
        assert!(!cursor.admits(start, "event_5"));
        assert!(!cursor.admits(start, "event_6"));
        assert!(cursor.admits(start - chrono::Duration::seconds(1), "event_9"));
    }

    #[test]
    fn test_batch_size_default() {
        let params = FindRawEventsParams::default().with_batch_size(0);
        assert_eq!(params.effective_batch_size(), DEFAULT_DISCOVERY_BATCH_SIZE);
    }
}
