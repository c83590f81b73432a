//! Aggregation strategies for non-grouped usage queries
//!
//! Each strategy renders its aggregate expression; the shared query shape puts
//! the high-selectivity tenant/environment/event/time conditions in `PREWHERE`
//! over the collapsed (`FINAL`) view and the customer and property conditions
//! in `WHERE`.

use super::fragment::{
    numeric_property_sql, property_filters_sql, raw_property_sql, BuiltQuery, QueryFragment,
};
use super::PROCESSED_EVENTS_TABLE;
use meterline_common::{AggregationType, RequestContext, Result, UsageParams, WindowSize};

/// One aggregation strategy
pub trait Aggregator: Send + Sync {
    /// Type of the aggregate, which also decides how the value column decodes
    fn aggregation_type(&self) -> AggregationType;

    /// Append the aggregate expression
    fn value_sql(&self, q: &mut QueryFragment, property: &str);

    /// Full usage query, scalar or bucketed by `params.window_size`
    fn build_query(&self, ctx: &RequestContext, params: &UsageParams) -> Result<BuiltQuery> {
        params.validate()?;
        let property = if self.aggregation_type().requires_property() {
            params.property()?
        } else {
            ""
        };

        let mut q = QueryFragment::new(self.aggregation_type().as_str());
        q.sql("SELECT ");
        if let Some(window) = params.window_size {
            q.sql("toDateTime(")
                .sql(&window.bucket_sql("timestamp"))
                .sql(", 'UTC') AS window_start, ");
        }
        self.value_sql(&mut q, property);
        q.sql(" AS value FROM ").sql(PROCESSED_EVENTS_TABLE).sql(" FINAL");
        scope_sql(&mut q, ctx, params);

        if let Some(window) = params.window_size {
            window_tail_sql(&mut q, window, params);
        }
        Ok(q.into())
    }
}

/// `PREWHERE` on the sorting-key columns, `WHERE` on the rest
fn scope_sql(q: &mut QueryFragment, ctx: &RequestContext, params: &UsageParams) {
    q.sql(" PREWHERE tenant_id = ")
        .bind(&ctx.tenant_id)
        .sql(" AND environment_id = ")
        .bind(&ctx.environment_id)
        .sql(" AND event_name = ")
        .bind(&params.event_name)
        .sql(" AND timestamp >= ")
        .bind_timestamp(params.start_time)
        .sql(" AND timestamp < ")
        .bind_timestamp(params.end_time)
        .sql(" WHERE sign = 1");
    if let Some(external_customer_id) = &params.external_customer_id {
        q.sql(" AND external_customer_id = ").bind(external_customer_id);
    }
    if let Some(customer_id) = &params.customer_id {
        q.sql(" AND customer_id = ").bind(customer_id);
    }
    property_filters_sql(q, &params.filters);
}

/// Group by bucket and zero-fill every bucket in `[start, end)`
fn window_tail_sql(q: &mut QueryFragment, window: WindowSize, params: &UsageParams) {
    let mut from = QueryFragment::default();
    from.bind_timestamp(params.start_time);
    let from_bucket = window.bucket_sql(&from.sql);

    q.sql(" GROUP BY window_start ORDER BY window_start WITH FILL FROM toDateTime(")
        .sql(&from_bucket);
    q.args.extend(from.args);
    q.sql(", 'UTC') TO toDateTime(")
        .bind_timestamp(params.end_time)
        .sql(", 'UTC') STEP ")
        .sql(window.step_sql());
}

/// `count()`
#[derive(Debug, Default, Clone, Copy)]
pub struct CountAggregator;

impl Aggregator for CountAggregator {
    fn aggregation_type(&self) -> AggregationType {
        AggregationType::Count
    }

    fn value_sql(&self, q: &mut QueryFragment, _property: &str) {
        q.sql("count()");
    }
}

/// `sum` of the numeric property
#[derive(Debug, Default, Clone, Copy)]
pub struct SumAggregator;

impl Aggregator for SumAggregator {
    fn aggregation_type(&self) -> AggregationType {
        AggregationType::Sum
    }

    fn value_sql(&self, q: &mut QueryFragment, property: &str) {
        q.sql("sum(");
        numeric_property_sql(q, property);
        q.sql(")");
    }
}

/// `avg` of the numeric property
#[derive(Debug, Default, Clone, Copy)]
pub struct AvgAggregator;

impl Aggregator for AvgAggregator {
    fn aggregation_type(&self) -> AggregationType {
        AggregationType::Avg
    }

    fn value_sql(&self, q: &mut QueryFragment, property: &str) {
        q.sql("avg(");
        numeric_property_sql(q, property);
        q.sql(")");
    }
}

/// Distinct property values
#[derive(Debug, Default, Clone, Copy)]
pub struct CountUniqueAggregator;

impl Aggregator for CountUniqueAggregator {
    fn aggregation_type(&self) -> AggregationType {
        AggregationType::CountUnique
    }

    fn value_sql(&self, q: &mut QueryFragment, property: &str) {
        q.sql("count(DISTINCT ");
        raw_property_sql(q, property);
        q.sql(")");
    }
}

/// Numeric property of the most recent event
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestAggregator;

impl Aggregator for LatestAggregator {
    fn aggregation_type(&self) -> AggregationType {
        AggregationType::Latest
    }

    fn value_sql(&self, q: &mut QueryFragment, property: &str) {
        q.sql("argMax(");
        numeric_property_sql(q, property);
        q.sql(", timestamp)");
    }
}

/// Strategy for an aggregation type
pub fn aggregator_for(aggregation_type: AggregationType) -> Box<dyn Aggregator> {
    match aggregation_type {
        AggregationType::Count => Box::new(CountAggregator),
        AggregationType::Sum => Box::new(SumAggregator),
        AggregationType::Avg => Box::new(AvgAggregator),
        AggregationType::CountUnique => Box::new(CountUniqueAggregator),
        AggregationType::Latest => Box::new(LatestAggregator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::fragment::SqlArg;
    use chrono::{TimeZone, Utc};
    use meterline_common::MeteringError;

    const INJECTION: &str = "'; DROP TABLE events; --";

    fn ctx() -> RequestContext {
        RequestContext::new("tenant_1", "env_1")
    }

    fn params(aggregation_type: AggregationType) -> UsageParams {
        UsageParams::new(
            "api_call",
            aggregation_type,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_count_query_shape() {
        let query = CountAggregator.build_query(&ctx(), &params(AggregationType::Count)).unwrap();
        assert!(query.sql.starts_with("SELECT count() AS value FROM events_processed FINAL"));
        assert!(query.sql.contains("PREWHERE tenant_id = ?"));
        assert!(query.sql.contains("AND environment_id = ?"));
        assert!(query.sql.contains("AND event_name = ?"));
        assert!(query.sql.contains("WHERE sign = 1"));
        assert_eq!(query.args.len(), 5);
        assert_eq!(query.args[0], SqlArg::Str("tenant_1".into()));
    }

    #[test]
    fn test_filters_single_and_multi_value() {
        let query = SumAggregator
            .build_query(
                &ctx(),
                &params(AggregationType::Sum)
                    .with_property("tokens")
                    .with_filter("model", ["gpt-4"])
                    .with_filter("region", ["us", "eu"]),
            )
            .unwrap();
        assert!(query.sql.contains("JSONExtractString(properties, ?) = ?"));
        assert!(query.sql.contains("JSONExtractString(properties, ?) IN (?, ?)"));
        assert!(query.sql.contains("sum(toFloat64("));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_property_required() {
        for aggregator in [
            aggregator_for(AggregationType::Sum),
            aggregator_for(AggregationType::Avg),
            aggregator_for(AggregationType::CountUnique),
            aggregator_for(AggregationType::Latest),
        ] {
            let result = aggregator.build_query(&ctx(), &params(aggregator.aggregation_type()));
            assert!(matches!(result, Err(MeteringError::Validation(_))));
        }
    }

    #[test]
    fn test_type_round_trip() {
        for t in [
            AggregationType::Count,
            AggregationType::Sum,
            AggregationType::Avg,
            AggregationType::CountUnique,
            AggregationType::Latest,
        ] {
            assert_eq!(aggregator_for(t).aggregation_type(), t);
        }
    }

    #[test]
    fn test_windowed_query_fills_gaps() {
        let query = CountAggregator
            .build_query(
                &ctx(),
                &params(AggregationType::Count).with_window(WindowSize::Hour),
            )
            .unwrap();
        assert!(query
            .sql
            .contains("toDateTime(toStartOfHour(timestamp, 'UTC'), 'UTC') AS window_start"));
        assert!(query.sql.contains("GROUP BY window_start ORDER BY window_start WITH FILL FROM"));
        assert!(query.sql.ends_with("STEP INTERVAL 1 HOUR"));
        assert_eq!(query.args.len(), 7);
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_no_caller_value_in_text() {
        for t in [
            AggregationType::Count,
            AggregationType::Sum,
            AggregationType::Avg,
            AggregationType::CountUnique,
            AggregationType::Latest,
        ] {
            let mut p = params(t)
                .with_property(INJECTION)
                .with_external_customer(INJECTION)
                .with_filter(INJECTION, [INJECTION]);
            p.event_name = INJECTION.to_string();
            let query = aggregator_for(t).build_query(&ctx(), &p).unwrap();
            assert!(!query.sql.contains(INJECTION), "{} leaked the value", t);
            assert!(query.args.iter().any(|a| a.as_text() == INJECTION));
        }
    }
}
