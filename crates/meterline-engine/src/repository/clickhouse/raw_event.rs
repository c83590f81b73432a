//! Raw event repository on ClickHouse
//!
//! Discovery runs in two steps so the wide rows are read only for ids that are
//! known to be unprocessed:
//!
//! 1. Step A scans `(timestamp, id, event_name)` of `raw_events` anti-joined
//!    against processed ids, newest first, one keyset page at a time.
//! 2. Step B fetches every column for exactly those ids from the collapsed view.
//!
//! Plain listing reads the collapsed view directly, processed or not.

use super::rows::{from_millis, RawEventRow, UnprocessedIdRow, RAW_EVENT_COLUMNS};
use super::ClickHouseStore;
use crate::query::{BuiltQuery, QueryFragment, PROCESSED_EVENTS_TABLE, RAW_EVENTS_TABLE};
use crate::repository::{check_scope, RawEventRepository};
use async_trait::async_trait;
use meterline_common::{FindRawEventsParams, KeysetCursor, RawEvent, RequestContext, Result};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// Step A: unprocessed ids in the window, newest first, after the cursor
pub fn unprocessed_ids_query(
    ctx: &RequestContext,
    params: &FindRawEventsParams,
    batch_size: usize,
) -> BuiltQuery {
    let mut q = QueryFragment::new("unprocessed_ids");
    q.sql("SELECT r.timestamp, r.id, r.event_name FROM ")
        .sql(RAW_EVENTS_TABLE)
        .sql(" AS r LEFT ANTI JOIN (SELECT id FROM ")
        .sql(PROCESSED_EVENTS_TABLE)
        .sql(" WHERE tenant_id = ")
        .bind(&ctx.tenant_id)
        .sql(" AND environment_id = ")
        .bind(&ctx.environment_id);
    window_sql(&mut q, "", params);
    if !params.external_customer_ids.is_empty() {
        q.sql(" AND ").bind_in("external_customer_id", &params.external_customer_ids);
    }
    q.sql(" AND sign = 1) AS p ON r.id = p.id WHERE r.tenant_id = ")
        .bind(&ctx.tenant_id)
        .sql(" AND r.environment_id = ")
        .bind(&ctx.environment_id);
    window_sql(&mut q, "r.", params);
    if !params.external_customer_ids.is_empty() {
        q.sql(" AND ").bind_in("r.external_customer_id", &params.external_customer_ids);
    }
    if !params.event_names.is_empty() {
        q.sql(" AND ").bind_in("r.event_name", &params.event_names);
    }
    if !params.event_ids.is_empty() {
        q.sql(" AND ").bind_in("r.id", &params.event_ids);
    }
    q.sql(" AND r.sign = 1");
    if let Some(cursor) = &params.cursor {
        q.sql(" AND (r.timestamp, r.id) < (")
            .bind_timestamp(cursor.timestamp)
            .sql(", ")
            .bind(&cursor.id)
            .sql(")");
    }
    q.sql(" ORDER BY r.timestamp DESC, r.id DESC LIMIT 1 BY r.timestamp, r.id LIMIT ")
        .bind(batch_size as u64);
    q.into()
}

/// Step B: full rows for `ids`, collapsed to the latest live version
pub fn raw_events_by_id_query(ctx: &RequestContext, ids: &[String]) -> BuiltQuery {
    let mut q = QueryFragment::new("raw_events_by_id");
    q.sql("SELECT ")
        .sql(RAW_EVENT_COLUMNS)
        .sql(" FROM ")
        .sql(RAW_EVENTS_TABLE)
        .sql(" FINAL WHERE tenant_id = ")
        .bind(&ctx.tenant_id)
        .sql(" AND environment_id = ")
        .bind(&ctx.environment_id)
        .sql(" AND id IN (")
        .bind_list(ids)
        .sql(") AND sign = 1");
    q.into()
}

/// One keyset page of live raw events, newest first
pub fn raw_events_query(ctx: &RequestContext, params: &FindRawEventsParams, batch_size: usize) -> BuiltQuery {
    let mut q = QueryFragment::new("raw_events");
    q.sql("SELECT ")
        .sql(RAW_EVENT_COLUMNS)
        .sql(" FROM ")
        .sql(RAW_EVENTS_TABLE)
        .sql(" FINAL WHERE tenant_id = ")
        .bind(&ctx.tenant_id)
        .sql(" AND environment_id = ")
        .bind(&ctx.environment_id);
    window_sql(&mut q, "", params);
    if !params.external_customer_ids.is_empty() {
        q.sql(" AND ").bind_in("external_customer_id", &params.external_customer_ids);
    }
    if !params.event_names.is_empty() {
        q.sql(" AND ").bind_in("event_name", &params.event_names);
    }
    if !params.event_ids.is_empty() {
        q.sql(" AND ").bind_in("id", &params.event_ids);
    }
    q.sql(" AND sign = 1");
    if let Some(cursor) = &params.cursor {
        q.sql(" AND (timestamp, id) < (")
            .bind_timestamp(cursor.timestamp)
            .sql(", ")
            .bind(&cursor.id)
            .sql(")");
    }
    q.sql(" ORDER BY timestamp DESC, id DESC LIMIT ").bind(batch_size as u64);
    q.into()
}

fn window_sql(q: &mut QueryFragment, prefix: &str, params: &FindRawEventsParams) {
    if let Some(start) = params.start_time {
        q.sql(" AND ").sql(prefix).sql("timestamp >= ").bind_timestamp(start);
    }
    if let Some(end) = params.end_time {
        q.sql(" AND ").sql(prefix).sql("timestamp < ").bind_timestamp(end);
    }
}

/// Step B rows in Step A order; ids Step B no longer sees are dropped
fn order_like(step_a: &[UnprocessedIdRow], rows: Vec<RawEvent>) -> Vec<RawEvent> {
    let mut by_key: HashMap<(i64, String), RawEvent> = rows
        .into_iter()
        .map(|e| ((e.timestamp.timestamp_millis(), e.id.clone()), e))
        .collect();
    step_a
        .iter()
        .filter_map(|a| by_key.remove(&(a.timestamp, a.id.clone())))
        .collect()
}

#[async_trait]
impl RawEventRepository for ClickHouseStore {
    #[instrument(skip(self, ctx, event), fields(event_id = %event.id, event_name = %event.event_name))]
    async fn insert_event(&self, ctx: &RequestContext, event: &RawEvent) -> Result<()> {
        ctx.validate()?;
        event.validate()?;
        check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        let row = RawEventRow::try_from(event)?;
        self.bounded(ctx)
            .run(
                "insert_event",
                self.insert_rows(RAW_EVENTS_TABLE, std::slice::from_ref(&row), "Failed to insert raw event"),
            )
            .await
    }

    #[instrument(skip(self, ctx, events), fields(count = events.len()))]
    async fn bulk_insert_events(&self, ctx: &RequestContext, events: &[RawEvent]) -> Result<()> {
        ctx.validate()?;
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            event.validate()?;
            check_scope(ctx, &event.tenant_id, &event.environment_id)?;
            rows.push(RawEventRow::try_from(event)?);
        }
        self.bounded(ctx)
            .run(
                "bulk_insert_events",
                self.insert_chunked(RAW_EVENTS_TABLE, &rows, "Failed to bulk insert raw events"),
            )
            .await?;
        debug!(count = rows.len(), "Inserted raw events");
        Ok(())
    }

    #[instrument(skip(self, ctx, params), fields(tenant_id = %ctx.tenant_id, environment_id = %ctx.environment_id))]
    async fn find_unprocessed_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
        ctx.validate()?;
        params.validate()?;
        let batch_size = params.effective_batch_size();
        let ctx = self.bounded(ctx);

        let step_a: Vec<UnprocessedIdRow> = ctx
            .run(
                "find_unprocessed_raw_events",
                self.fetch_rows(
                    &unprocessed_ids_query(&ctx, params, batch_size),
                    "Failed to query unprocessed event IDs (step A)",
                ),
            )
            .await?;
        if step_a.is_empty() {
            debug!("No unprocessed events");
            return Ok((Vec::new(), None));
        }

        let cursor = match step_a.last() {
            Some(last) if step_a.len() >= batch_size => {
                Some(KeysetCursor::new(from_millis(last.timestamp)?, last.id.clone()))
            }
            _ => None,
        };

        let mut seen = HashSet::new();
        let ids: Vec<String> = step_a
            .iter()
            .filter(|row| seen.insert(row.id.as_str()))
            .map(|row| row.id.clone())
            .collect();

        let rows: Vec<RawEventRow> = ctx
            .run(
                "find_unprocessed_raw_events",
                self.fetch_rows(
                    &raw_events_by_id_query(&ctx, &ids),
                    "Failed to fetch unprocessed events (step B)",
                ),
            )
            .await?;
        let events = rows
            .into_iter()
            .map(RawEvent::try_from)
            .collect::<Result<Vec<_>>>()?;
        let events = order_like(&step_a, events);

        debug!(
            step_a = step_a.len(),
            found = events.len(),
            has_more = cursor.is_some(),
            "Discovered unprocessed events"
        );
        Ok((events, cursor))
    }

    #[instrument(skip(self, ctx, params), fields(tenant_id = %ctx.tenant_id, environment_id = %ctx.environment_id))]
    async fn find_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
        ctx.validate()?;
        params.validate()?;
        let batch_size = params.effective_batch_size();
        let ctx = self.bounded(ctx);

        let rows: Vec<RawEventRow> = ctx
            .run(
                "find_raw_events",
                self.fetch_rows(&raw_events_query(&ctx, params, batch_size), "Failed to list raw events"),
            )
            .await?;
        let events = rows
            .into_iter()
            .map(RawEvent::try_from)
            .collect::<Result<Vec<_>>>()?;

        let cursor = match events.last() {
            Some(last) if events.len() >= batch_size => Some(KeysetCursor::new(last.timestamp, last.id.clone())),
            _ => None,
        };
        debug!(found = events.len(), has_more = cursor.is_some(), "Listed raw events");
        Ok((events, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SqlArg;
    use chrono::{Duration, TimeZone, Utc};

    const INJECTION: &str = "'; DROP TABLE events; --";

    fn ctx() -> RequestContext {
        RequestContext::new("tenant_1", "env_1")
    }

    #[test]
    fn test_step_a_shape() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let params = FindRawEventsParams::for_window(start, start + Duration::days(1));
        let query = unprocessed_ids_query(&ctx(), &params, 500);

        assert!(query.sql.starts_with("SELECT r.timestamp, r.id, r.event_name FROM raw_events AS r"));
        assert!(query.sql.contains("LEFT ANTI JOIN (SELECT id FROM events_processed WHERE"));
        assert!(query.sql.contains("AND r.sign = 1"));
        assert!(query.sql.ends_with("ORDER BY r.timestamp DESC, r.id DESC LIMIT 1 BY r.timestamp, r.id LIMIT ?"));
        assert!(!query.sql.contains("(r.timestamp, r.id) <"));
        assert_eq!(query.args.last(), Some(&SqlArg::UInt(500)));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_step_a_keyset_and_customer_pushdown() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut params = FindRawEventsParams::for_window(start, start + Duration::days(1))
            .with_cursor(Some(KeysetCursor::new(start + Duration::hours(3), "event_9")));
        params.external_customer_ids = vec!["cust_1".into(), "cust_2".into()];

        let query = unprocessed_ids_query(&ctx(), &params, 100);
        assert!(query.sql.contains("AND external_customer_id IN (?, ?) AND sign = 1) AS p"));
        assert!(query.sql.contains("AND r.external_customer_id IN (?, ?)"));
        assert!(query.sql.contains("AND (r.timestamp, r.id) < (toDateTime64(?, 3, 'UTC'), ?)"));
        assert!(query.args.contains(&SqlArg::Str("event_9".into())));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_discovery_queries_bind_caller_values() {
        let mut params = FindRawEventsParams::default()
            .with_cursor(Some(KeysetCursor::new(Utc::now(), INJECTION)));
        params.external_customer_ids = vec![INJECTION.into()];
        params.event_names = vec![INJECTION.into()];
        params.event_ids = vec![INJECTION.into()];
        let hostile = RequestContext::new(INJECTION, INJECTION);

        let step_a = unprocessed_ids_query(&hostile, &params, 10);
        let step_b = raw_events_by_id_query(&hostile, &[INJECTION.to_string()]);
        for query in [step_a, step_b] {
            assert!(!query.sql.contains(INJECTION));
            assert!(query.args.iter().any(|a| a.as_text() == INJECTION));
            assert_eq!(query.args.len(), query.placeholder_count());
        }
    }

    #[test]
    fn test_raw_listing_reads_collapsed_rows_without_anti_join() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut params = FindRawEventsParams::for_window(start, start + Duration::days(1))
            .with_cursor(Some(KeysetCursor::new(start + Duration::hours(1), "event_4")));
        params.event_names = vec!["api_call".into()];

        let query = raw_events_query(&ctx(), &params, 50);
        assert!(query.sql.starts_with("SELECT id, tenant_id"));
        assert!(query.sql.contains("FROM raw_events FINAL WHERE tenant_id = ?"));
        assert!(!query.sql.contains("ANTI JOIN"));
        assert!(query.sql.contains("AND event_name IN (?) AND sign = 1 AND (timestamp, id) < (toDateTime64(?, 3, 'UTC'), ?)"));
        assert!(query.sql.ends_with("ORDER BY timestamp DESC, id DESC LIMIT ?"));
        assert_eq!(query.args.last(), Some(&SqlArg::UInt(50)));
        assert_eq!(query.args.len(), query.placeholder_count());
    }

    #[test]
    fn test_step_b_shape() {
        let ids = vec!["event_1".to_string(), "event_2".to_string()];
        let query = raw_events_by_id_query(&ctx(), &ids);
        assert!(query.sql.contains("FROM raw_events FINAL WHERE tenant_id = ?"));
        assert!(query.sql.ends_with("AND id IN (?, ?) AND sign = 1"));
    }

    #[test]
    fn test_step_b_rows_follow_step_a_order() {
        let ts = Utc.timestamp_millis_opt(1_704_067_200_000).unwrap();
        let event = |id: &str, minutes| {
            RawEvent::new(id, "tenant_1", "env_1", "cust_1", "api_call", ts + Duration::minutes(minutes))
        };
        let step_a: Vec<UnprocessedIdRow> = [("event_3", 3), ("event_1", 1), ("event_2", 2)]
            .iter()
            .map(|(id, m)| UnprocessedIdRow {
                timestamp: (ts + Duration::minutes(*m)).timestamp_millis(),
                id: id.to_string(),
                event_name: "api_call".into(),
            })
            .collect();
        let fetched = vec![event("event_1", 1), event("event_3", 3)];

        let ordered = order_like(&step_a, fetched);
        let ids: Vec<&str> = ordered.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["event_3", "event_1"]);
    }
}
