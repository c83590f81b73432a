//! Event repositories
//!
//! Three storage seams, each an async trait with a ClickHouse backend for
//! production and an in-memory backend for tests and local runs:
//!
//! - [`RawEventRepository`]: immutable ingested events and unprocessed discovery
//! - [`ProcessedEventRepository`]: events with quantity and cost
//! - [`UsageRepository`]: aggregate reads over processed events

pub mod clickhouse;
pub mod memory;

pub use self::clickhouse::ClickHouseStore;
pub use memory::InMemoryEventStore;

use async_trait::async_trait;
use meterline_common::{
    AggregationResult, FeatureUsageTotal, FilterGroupUsage, FindRawEventsParams, GetProcessedEventsParams,
    KeysetCursor, MeteringError, ProcessedEvent, RawEvent, RequestContext, Result,
    UsageParams, UsageSummaryParams, UsageWithFiltersParams,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Storage for raw events
#[async_trait]
pub trait RawEventRepository: Send + Sync {
    /// Validate and append one event
    async fn insert_event(&self, ctx: &RequestContext, event: &RawEvent) -> Result<()>;

    /// Validate all, then append in chunks; a failed chunk leaves earlier chunks committed
    async fn bulk_insert_events(&self, ctx: &RequestContext, events: &[RawEvent]) -> Result<()>;

    /// One page of raw events without a processed counterpart, newest first.
    /// The cursor is `None` once the scan is exhausted.
    async fn find_unprocessed_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)>;

    /// One keyset page of live raw events, processed or not, newest first
    async fn find_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)>;
}

/// Storage for processed events
#[async_trait]
pub trait ProcessedEventRepository: Send + Sync {
    async fn insert_processed_event(&self, ctx: &RequestContext, event: &ProcessedEvent) -> Result<()>;

    async fn bulk_insert_processed_events(
        &self,
        ctx: &RequestContext,
        events: &[ProcessedEvent],
    ) -> Result<()>;

    /// Newest-first page and the total count (zero unless `count_total`)
    async fn get_processed_events(
        &self,
        ctx: &RequestContext,
        params: &GetProcessedEventsParams,
    ) -> Result<(Vec<ProcessedEvent>, u64)>;

    /// Sum of cost over processed rows, zero when nothing matches
    async fn get_usage_summary(&self, ctx: &RequestContext, params: &UsageSummaryParams) -> Result<Decimal>;

    /// Processed quantity and cost per feature, ordered by feature id
    async fn get_feature_totals(
        &self,
        ctx: &RequestContext,
        params: &UsageSummaryParams,
    ) -> Result<Vec<FeatureUsageTotal>>;

    /// Rows still pending for a customer and/or subscription
    async fn find_unprocessed_events(
        &self,
        ctx: &RequestContext,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Vec<ProcessedEvent>>;
}

/// Aggregate usage reads
#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Scalar aggregate, plus zero-filled buckets when a window size is set
    async fn get_usage(&self, ctx: &RequestContext, params: &UsageParams) -> Result<AggregationResult>;

    /// One aggregate per best-match filter group, ordered by group id
    async fn get_usage_with_filters(
        &self,
        ctx: &RequestContext,
        params: &UsageWithFiltersParams,
    ) -> Result<Vec<FilterGroupUsage>>;
}

/// Reject events written outside the request scope
pub(crate) fn check_scope(ctx: &RequestContext, tenant_id: &str, environment_id: &str) -> Result<()> {
    if tenant_id != ctx.tenant_id || environment_id != ctx.environment_id {
        return Err(MeteringError::Validation(format!(
            "event scope {}/{} does not match request scope {}/{}",
            tenant_id, environment_id, ctx.tenant_id, ctx.environment_id
        )));
    }
    Ok(())
}

/// Float64 aggregate to decimal; NaN (avg of nothing) reads as zero
pub(crate) fn decimal_from_f64(value: f64) -> Result<Decimal> {
    if value.is_nan() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_f64(value)
        .map(|d| d.normalize())
        .ok_or_else(|| MeteringError::Cast(format!("aggregate {} is out of decimal range", value)))
}

/// Pending lookups need a customer or a subscription
pub(crate) fn validate_pending_lookup(customer_id: Option<&str>, subscription_id: Option<&str>) -> Result<()> {
    let present = |v: Option<&str>| v.map(|s| !s.is_empty()).unwrap_or(false);
    if !present(customer_id) && !present(subscription_id) {
        return Err(MeteringError::Validation(
            "customer_id or subscription_id is required".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_scope_mismatch_is_validation() {
        let ctx = RequestContext::new("tenant_1", "env_1");
        assert!(check_scope(&ctx, "tenant_1", "env_1").is_ok());
        let err = check_scope(&ctx, "tenant_2", "env_1").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_decimal_from_f64() {
        assert_eq!(decimal_from_f64(f64::NAN).unwrap(), Decimal::ZERO);
        assert_eq!(decimal_from_f64(12.5).unwrap(), dec!(12.5));
        assert!(decimal_from_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn test_pending_lookup_requires_an_identifier() {
        assert!(validate_pending_lookup(None, None).is_err());
        assert!(validate_pending_lookup(Some(""), None).is_err());
        assert!(validate_pending_lookup(Some("cust_1"), None).is_ok());
        assert!(validate_pending_lookup(None, Some("sub_1")).is_ok());
    }
}
