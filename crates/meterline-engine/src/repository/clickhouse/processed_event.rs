//! Processed event repository on ClickHouse

use super::rows::{
    from_scaled, CountRow, DecimalRow, FeatureTotalRow, ProcessedEventRow, PROCESSED_EVENT_COLUMNS,
};
use super::ClickHouseStore;
use crate::query::{BuiltQuery, QueryFragment, PROCESSED_EVENTS_TABLE};
use crate::repository::{check_scope, validate_pending_lookup, ProcessedEventRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterline_common::{
    EventStatus, FeatureUsageTotal, GetProcessedEventsParams, ProcessedEvent, RequestContext,
    Result, UsageSummaryParams,
};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

/// Optional equality filters shared by listing and summary reads
#[derive(Debug, Default)]
struct Scope<'a> {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    columns: Vec<(&'static str, &'a str)>,
    event_status: Option<EventStatus>,
}

impl<'a> Scope<'a> {
    fn column(mut self, name: &'static str, value: Option<&'a String>) -> Self {
        if let Some(value) = value {
            self.columns.push((name, value.as_str()));
        }
        self
    }

    /// `FROM events_processed FINAL WHERE ...` for the tenant and this scope
    fn from_sql(&self, q: &mut QueryFragment, ctx: &RequestContext) {
        q.sql(" FROM ")
            .sql(PROCESSED_EVENTS_TABLE)
            .sql(" FINAL WHERE tenant_id = ")
            .bind(&ctx.tenant_id)
            .sql(" AND environment_id = ")
            .bind(&ctx.environment_id);
        if let Some(start) = self.start_time {
            q.sql(" AND timestamp >= ").bind_timestamp(start);
        }
        if let Some(end) = self.end_time {
            q.sql(" AND timestamp < ").bind_timestamp(end);
        }
        for (column, value) in &self.columns {
            q.sql(" AND ").sql(column).sql(" = ").bind(*value);
        }
        if let Some(status) = self.event_status {
            q.sql(" AND event_status = ").bind(status.as_str());
        }
        q.sql(" AND sign = 1");
    }
}

fn listing_scope(params: &GetProcessedEventsParams) -> Scope<'_> {
    Scope {
        start_time: params.start_time,
        end_time: params.end_time,
        event_status: params.event_status,
        ..Default::default()
    }
    .column("customer_id", params.customer_id.as_ref())
    .column("subscription_id", params.subscription_id.as_ref())
    .column("meter_id", params.meter_id.as_ref())
    .column("feature_id", params.feature_id.as_ref())
    .column("price_id", params.price_id.as_ref())
}

/// Newest-first page of processed events
pub fn processed_events_query(ctx: &RequestContext, params: &GetProcessedEventsParams) -> BuiltQuery {
    let mut q = QueryFragment::new("processed_events");
    q.sql("SELECT ").sql(PROCESSED_EVENT_COLUMNS);
    listing_scope(params).from_sql(&mut q, ctx);
    q.sql(" ORDER BY timestamp DESC, id DESC LIMIT ")
        .bind(params.limit)
        .sql(" OFFSET ")
        .bind(params.offset);
    q.into()
}

pub fn processed_events_count_query(ctx: &RequestContext, params: &GetProcessedEventsParams) -> BuiltQuery {
    let mut q = QueryFragment::new("processed_events_count");
    q.sql("SELECT count() AS value");
    listing_scope(params).from_sql(&mut q, ctx);
    q.into()
}

fn summary_scope(params: &UsageSummaryParams) -> Scope<'_> {
    Scope {
        start_time: params.start_time,
        end_time: params.end_time,
        event_status: Some(EventStatus::Processed),
        ..Default::default()
    }
    .column("customer_id", params.customer_id.as_ref())
    .column("subscription_id", params.subscription_id.as_ref())
    .column("meter_id", params.meter_id.as_ref())
    .column("price_id", params.price_id.as_ref())
    .column("feature_id", params.feature_id.as_ref())
}

/// Cost of processed rows in scope
pub fn usage_summary_query(ctx: &RequestContext, params: &UsageSummaryParams) -> BuiltQuery {
    let mut q = QueryFragment::new("usage_summary");
    q.sql("SELECT sum(cost) AS value");
    summary_scope(params).from_sql(&mut q, ctx);
    q.into()
}

/// Quantity, cost and row count of processed rows in scope, per feature
pub fn feature_totals_query(ctx: &RequestContext, params: &UsageSummaryParams) -> BuiltQuery {
    let mut q = QueryFragment::new("feature_totals");
    q.sql("SELECT feature_id, sum(quantity) AS quantity, sum(cost) AS cost, count() AS event_count");
    summary_scope(params).from_sql(&mut q, ctx);
    q.sql(" GROUP BY feature_id ORDER BY feature_id");
    q.into()
}

/// Pending rows for a customer and/or subscription, oldest first
pub fn pending_events_query(
    ctx: &RequestContext,
    customer_id: Option<&str>,
    subscription_id: Option<&str>,
) -> BuiltQuery {
    let mut scope = Scope {
        event_status: Some(EventStatus::Pending),
        ..Default::default()
    };
    if let Some(customer_id) = customer_id.filter(|c| !c.is_empty()) {
        scope.columns.push(("customer_id", customer_id));
    }
    if let Some(subscription_id) = subscription_id.filter(|s| !s.is_empty()) {
        scope.columns.push(("subscription_id", subscription_id));
    }

    let mut q = QueryFragment::new("pending_events");
    q.sql("SELECT ").sql(PROCESSED_EVENT_COLUMNS);
    scope.from_sql(&mut q, ctx);
    q.sql(" ORDER BY timestamp, id");
    q.into()
}

fn to_events(rows: Vec<ProcessedEventRow>) -> Result<Vec<ProcessedEvent>> {
    rows.into_iter().map(ProcessedEvent::try_from).collect()
}

#[async_trait]
impl ProcessedEventRepository for ClickHouseStore {
    #[instrument(skip(self, ctx, event), fields(event_id = %event.id, status = %event.event_status))]
    async fn insert_processed_event(&self, ctx: &RequestContext, event: &ProcessedEvent) -> Result<()> {
        ctx.validate()?;
        event.validate()?;
        check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        let row = ProcessedEventRow::try_from(event)?;
        self.bounded(ctx)
            .run(
                "insert_processed_event",
                self.insert_rows(
                    PROCESSED_EVENTS_TABLE,
                    std::slice::from_ref(&row),
                    "Failed to insert processed event",
                ),
            )
            .await
    }

    #[instrument(skip(self, ctx, events), fields(count = events.len()))]
    async fn bulk_insert_processed_events(
        &self,
        ctx: &RequestContext,
        events: &[ProcessedEvent],
    ) -> Result<()> {
        ctx.validate()?;
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            event.validate()?;
            check_scope(ctx, &event.tenant_id, &event.environment_id)?;
            rows.push(ProcessedEventRow::try_from(event)?);
        }
        self.bounded(ctx)
            .run(
                "bulk_insert_processed_events",
                self.insert_chunked(PROCESSED_EVENTS_TABLE, &rows, "Failed to bulk insert processed events"),
            )
            .await?;
        debug!(count = rows.len(), "Inserted processed events");
        Ok(())
    }

    #[instrument(skip(self, ctx, params), fields(limit = params.limit, offset = params.offset))]
    async fn get_processed_events(
        &self,
        ctx: &RequestContext,
        params: &GetProcessedEventsParams,
    ) -> Result<(Vec<ProcessedEvent>, u64)> {
        ctx.validate()?;
        params.validate()?;
        let ctx = self.bounded(ctx);

        let rows: Vec<ProcessedEventRow> = ctx
            .run(
                "get_processed_events",
                self.fetch_rows(&processed_events_query(&ctx, params), "Failed to list processed events"),
            )
            .await?;
        let events = to_events(rows)?;

        let total = if params.count_total {
            ctx.run(
                "get_processed_events",
                self.fetch_first::<CountRow>(
                    &processed_events_count_query(&ctx, params),
                    "Failed to count processed events",
                ),
            )
            .await?
            .map(|row| row.value)
            .unwrap_or(0)
        } else {
            0
        };
        Ok((events, total))
    }

    #[instrument(skip(self, ctx, params))]
    async fn get_usage_summary(&self, ctx: &RequestContext, params: &UsageSummaryParams) -> Result<Decimal> {
        ctx.validate()?;
        params.validate()?;
        let ctx = self.bounded(ctx);
        let row = ctx
            .run(
                "get_usage_summary",
                self.fetch_first::<DecimalRow>(&usage_summary_query(&ctx, params), "Failed to sum usage cost"),
            )
            .await?;
        match row {
            Some(row) => from_scaled(row.value),
            None => Ok(Decimal::ZERO),
        }
    }

    #[instrument(skip(self, ctx, params))]
    async fn get_feature_totals(
        &self,
        ctx: &RequestContext,
        params: &UsageSummaryParams,
    ) -> Result<Vec<FeatureUsageTotal>> {
        ctx.validate()?;
        params.validate()?;
        let ctx = self.bounded(ctx);
        let rows: Vec<FeatureTotalRow> = ctx
            .run(
                "get_feature_totals",
                self.fetch_rows(&feature_totals_query(&ctx, params), "Failed to total usage by feature"),
            )
            .await?;
        debug!(features = rows.len(), "Totalled usage by feature");
        rows.into_iter().map(FeatureUsageTotal::try_from).collect()
    }

    #[instrument(skip(self, ctx))]
    async fn find_unprocessed_events(
        &self,
        ctx: &RequestContext,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Vec<ProcessedEvent>> {
        ctx.validate()?;
        validate_pending_lookup(customer_id, subscription_id)?;
        let ctx = self.bounded(ctx);
        let rows: Vec<ProcessedEventRow> = ctx
            .run(
                "find_unprocessed_events",
                self.fetch_rows(
                    &pending_events_query(&ctx, customer_id, subscription_id),
                    "Failed to query pending processed events",
                ),
            )
            .await?;
        to_events(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SqlArg;

    fn ctx() -> RequestContext {
        RequestContext::new("tenant_1", "env_1")
    }

    #[test]
    fn test_listing_query() {
        let params = GetProcessedEventsParams {
            customer_id: Some("cus_1".into()),
            event_status: Some(EventStatus::Failed),
            limit: 20,
            offset: 40,
            ..Default::default()
        };
        let query = processed_events_query(&ctx(), &params);
        assert!(query.sql.contains("FROM events_processed FINAL WHERE tenant_id = ?"));
        assert!(query.sql.contains("AND customer_id = ? AND event_status = ? AND sign = 1"));
        assert!(query.sql.ends_with("ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"));
        assert!(query.args.contains(&SqlArg::Str("failed".into())));
        assert_eq!(query.args[query.args.len() - 2..], [SqlArg::UInt(20), SqlArg::UInt(40)]);
        assert_eq!(query.args.len(), query.placeholder_count());

        let count = processed_events_count_query(&ctx(), &params);
        assert!(count.sql.starts_with("SELECT count() AS value FROM events_processed FINAL"));
        assert!(!count.sql.contains("LIMIT"));
    }

    #[test]
    fn test_summary_restricted_to_processed() {
        let params = UsageSummaryParams {
            subscription_id: Some("sub_1".into()),
            ..Default::default()
        };
        let query = usage_summary_query(&ctx(), &params);
        assert!(query.sql.starts_with("SELECT sum(cost) AS value"));
        assert!(query.args.contains(&SqlArg::Str("processed".into())));
        assert!(query.args.contains(&SqlArg::Str("sub_1".into())));
    }

    #[test]
    fn test_feature_totals_group_by_feature() {
        let params = UsageSummaryParams {
            customer_id: Some("cus_1".into()),
            ..Default::default()
        };
        let query = feature_totals_query(&ctx(), &params);
        assert!(query.sql.starts_with(
            "SELECT feature_id, sum(quantity) AS quantity, sum(cost) AS cost, count() AS event_count FROM events_processed FINAL"
        ));
        assert!(query.sql.contains("AND customer_id = ? AND event_status = ? AND sign = 1"));
        assert!(query.sql.ends_with("GROUP BY feature_id ORDER BY feature_id"));
        assert!(query.args.contains(&SqlArg::Str("processed".into())));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_pending_query_binds_both_identifiers() {
        let query = pending_events_query(&ctx(), Some("cus_1"), Some("sub_1"));
        assert!(query.sql.contains("AND customer_id = ? AND subscription_id = ? AND event_status = ?"));
        assert!(query.args.contains(&SqlArg::Str("pending".into())));
        assert!(query.sql.ends_with("ORDER BY timestamp, id"));
    }
}
