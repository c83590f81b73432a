//! In-memory event store
//!
//! Keeps every written row per tenant/environment and collapses on read, the
//! way `ReplacingMergeTree ... FINAL` does: rows sharing a sort key keep the
//! highest version (a later write wins a version tie) and tombstones vanish.

use super::{
    check_scope, decimal_from_f64, validate_pending_lookup, ProcessedEventRepository,
    RawEventRepository, UsageRepository,
};
use crate::query::best_match;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meterline_common::{
    AggregationResult, AggregationType, DatabaseError, EventStatus, FeatureUsageTotal,
    FilterGroup, FilterGroupUsage, FindRawEventsParams, GetProcessedEventsParams, KeysetCursor,
    MeteringError, ProcessedEvent, RawEvent, RequestContext, Result, UsageParams,
    UsageSummaryParams, UsageWindow, UsageWithFiltersParams, DEFAULT_WRITE_CHUNK_SIZE,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, instrument};

type Scope = (String, String);

/// Row identity under the replacing merge
trait Versioned: Clone {
    fn sort_key(&self) -> (DateTime<Utc>, &str);
    fn version(&self) -> u64;
    fn is_live(&self) -> bool;
}

impl Versioned for RawEvent {
    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_live(&self) -> bool {
        !self.is_tombstone()
    }
}

impl Versioned for ProcessedEvent {
    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.id.as_str())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn is_live(&self) -> bool {
        self.sign > 0
    }
}

/// Latest live version of every row, in write order of first appearance
fn collapse<T: Versioned>(rows: &[T]) -> Vec<T> {
    let mut slots: HashMap<(DateTime<Utc>, &str), usize> = HashMap::new();
    let mut latest: Vec<&T> = Vec::new();
    for row in rows {
        match slots.get(&row.sort_key()) {
            Some(&slot) => {
                if row.version() >= latest[slot].version() {
                    latest[slot] = row;
                }
            }
            None => {
                slots.insert(row.sort_key(), latest.len());
                latest.push(row);
            }
        }
    }
    latest.into_iter().filter(|r| r.is_live()).cloned().collect()
}

fn in_window(ts: DateTime<Utc>, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
    start.map(|s| ts >= s).unwrap_or(true) && end.map(|e| ts < e).unwrap_or(true)
}

fn one_of(values: &[String], value: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == value)
}

fn matches_opt(filter: Option<&String>, value: &str) -> bool {
    filter.map(|f| f == value).unwrap_or(true)
}

/// Property as Float64, as `toFloat64` would read its unquoted JSON text
fn numeric_property(properties: &Map<String, Value>, property: &str) -> Result<f64> {
    let cast = || MeteringError::Cast(format!("property {} is not numeric", property));
    match properties.get(property) {
        Some(Value::Number(n)) => n.as_f64().ok_or_else(cast),
        Some(Value::String(s)) => s.parse::<f64>().map_err(|_| cast()),
        _ => Err(cast()),
    }
}

/// JSON text of a property, empty when absent
fn raw_property(properties: &Map<String, Value>, property: &str) -> String {
    properties
        .get(property)
        .map(Value::to_string)
        .unwrap_or_default()
}

/// Fold rows into one value, integer aggregates exact and the rest via Float64
fn aggregate(rows: &[&ProcessedEvent], aggregation_type: AggregationType, property: &str) -> Result<Decimal> {
    match aggregation_type {
        AggregationType::Count => Ok(Decimal::from(rows.len() as u64)),
        AggregationType::CountUnique => {
            let distinct: HashSet<String> = rows
                .iter()
                .map(|r| raw_property(&r.properties, property))
                .collect();
            Ok(Decimal::from(distinct.len() as u64))
        }
        AggregationType::Sum => {
            let mut sum = 0.0;
            for row in rows {
                sum += numeric_property(&row.properties, property)?;
            }
            decimal_from_f64(sum)
        }
        AggregationType::Avg => {
            let mut sum = 0.0;
            for row in rows {
                sum += numeric_property(&row.properties, property)?;
            }
            decimal_from_f64(sum / rows.len() as f64)
        }
        AggregationType::Latest => {
            let mut latest: Option<(DateTime<Utc>, f64)> = None;
            for row in rows {
                let value = numeric_property(&row.properties, property)?;
                if latest.map(|(ts, _)| row.timestamp >= ts).unwrap_or(true) {
                    latest = Some((row.timestamp, value));
                }
            }
            decimal_from_f64(latest.map(|(_, v)| v).unwrap_or(0.0))
        }
    }
}

/// In-memory store implementing all three repositories
pub struct InMemoryEventStore {
    /// Raw rows per tenant/environment, in write order
    raw: DashMap<Scope, Vec<RawEvent>>,

    /// Processed rows per tenant/environment, in write order
    processed: DashMap<Scope, Vec<ProcessedEvent>>,

    /// Rows per bulk write round trip
    chunk_size: usize,

    /// Chunks to accept before failing the next one
    fail_after_chunks: Mutex<Option<usize>>,

    /// Successful chunk writes
    chunks_written: AtomicUsize,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_WRITE_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            raw: DashMap::new(),
            processed: DashMap::new(),
            chunk_size: chunk_size.max(1),
            fail_after_chunks: Mutex::new(None),
            chunks_written: AtomicUsize::new(0),
        }
    }

    /// Accept `chunks` more chunk writes, then fail the next one once
    pub fn fail_after_chunks(&self, chunks: usize) {
        *self.fail_after_chunks.lock() = Some(chunks);
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks_written.load(Ordering::Relaxed)
    }

    /// Stored raw rows, every version included
    pub fn raw_row_count(&self, ctx: &RequestContext) -> usize {
        self.raw.get(&scope(ctx)).map(|rows| rows.len()).unwrap_or(0)
    }

    fn admit_chunk(&self, hint: &str) -> Result<()> {
        let mut remaining = self.fail_after_chunks.lock();
        match *remaining {
            Some(0) => {
                *remaining = None;
                Err(DatabaseError::insert(hint, "injected chunk failure").into())
            }
            Some(n) => {
                *remaining = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn write_raw_chunk(&self, ctx: &RequestContext, chunk: &[RawEvent]) -> Result<()> {
        self.admit_chunk("Failed to insert raw events")?;
        self.raw.entry(scope(ctx)).or_default().extend_from_slice(chunk);
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_processed_chunk(&self, ctx: &RequestContext, chunk: &[ProcessedEvent]) -> Result<()> {
        self.admit_chunk("Failed to insert processed events")?;
        self.processed
            .entry(scope(ctx))
            .or_default()
            .extend_from_slice(chunk);
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn live_raw(&self, ctx: &RequestContext) -> Vec<RawEvent> {
        self.raw
            .get(&scope(ctx))
            .map(|rows| collapse(rows.value()))
            .unwrap_or_default()
    }

    fn live_processed(&self, ctx: &RequestContext) -> Vec<ProcessedEvent> {
        self.processed
            .get(&scope(ctx))
            .map(|rows| collapse(rows.value()))
            .unwrap_or_default()
    }

    /// Live raw rows matching the listing filters and cursor of `params`, newest first
    fn raw_page(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
        skip: &HashSet<String>,
    ) -> (Vec<RawEvent>, Option<KeysetCursor>) {
        let batch_size = params.effective_batch_size();
        let mut page: Vec<RawEvent> = self
            .live_raw(ctx)
            .into_iter()
            .filter(|r| {
                !skip.contains(&r.id)
                    && in_window(r.timestamp, params.start_time, params.end_time)
                    && one_of(&params.external_customer_ids, &r.external_customer_id)
                    && one_of(&params.event_names, &r.event_name)
                    && one_of(&params.event_ids, &r.id)
                    && params
                        .cursor
                        .as_ref()
                        .map(|c| c.admits(r.timestamp, &r.id))
                        .unwrap_or(true)
            })
            .collect();
        page.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));
        page.truncate(batch_size);

        let cursor = if page.len() == batch_size {
            page.last().map(|r| KeysetCursor::new(r.timestamp, r.id.clone()))
        } else {
            None
        };
        (page, cursor)
    }

    /// Processed rows with status `processed` in a summary scope
    fn summary_rows(&self, ctx: &RequestContext, params: &UsageSummaryParams) -> Vec<ProcessedEvent> {
        self.live_processed(ctx)
            .into_iter()
            .filter(|e| {
                e.event_status == EventStatus::Processed
                    && in_window(e.timestamp, params.start_time, params.end_time)
                    && matches_opt(params.customer_id.as_ref(), &e.customer_id)
                    && matches_opt(params.subscription_id.as_ref(), &e.subscription_id)
                    && matches_opt(params.meter_id.as_ref(), &e.meter_id)
                    && matches_opt(params.price_id.as_ref(), &e.price_id)
                    && matches_opt(params.feature_id.as_ref(), &e.feature_id)
            })
            .collect()
    }

    /// Processed rows in the usage scope of `params`
    fn usage_rows(&self, ctx: &RequestContext, params: &UsageParams) -> Vec<ProcessedEvent> {
        let filters = FilterGroup {
            id: String::new(),
            priority: 0,
            filters: params.filters.clone(),
        };
        self.live_processed(ctx)
            .into_iter()
            .filter(|e| {
                e.event_name == params.event_name
                    && in_window(e.timestamp, Some(params.start_time), Some(params.end_time))
                    && matches_opt(params.external_customer_id.as_ref(), &e.external_customer_id)
                    && matches_opt(params.customer_id.as_ref(), &e.customer_id)
                    && filters.matches(&e.properties)
            })
            .collect()
    }
}

/// Scope check plus the context's cancellation and deadline
fn begin(ctx: &RequestContext, operation: &str) -> Result<()> {
    ctx.validate()?;
    ctx.ensure_active(operation)
}

fn scope(ctx: &RequestContext) -> Scope {
    (ctx.tenant_id.clone(), ctx.environment_id.clone())
}

#[async_trait]
impl RawEventRepository for InMemoryEventStore {
    #[instrument(skip(self, ctx, event), fields(event_id = %event.id))]
    async fn insert_event(&self, ctx: &RequestContext, event: &RawEvent) -> Result<()> {
        begin(ctx, "insert_event")?;
        event.validate()?;
        check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        self.raw.entry(scope(ctx)).or_default().push(event.clone());
        Ok(())
    }

    #[instrument(skip(self, ctx, events), fields(count = events.len()))]
    async fn bulk_insert_events(&self, ctx: &RequestContext, events: &[RawEvent]) -> Result<()> {
        begin(ctx, "bulk_insert_events")?;
        for event in events {
            event.validate()?;
            check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        }
        for chunk in events.chunks(self.chunk_size) {
            self.write_raw_chunk(ctx, chunk)?;
        }
        Ok(())
    }

    #[instrument(skip(self, ctx, params), fields(tenant_id = %ctx.tenant_id, batch_size = params.effective_batch_size()))]
    async fn find_unprocessed_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
        begin(ctx, "find_unprocessed_raw_events")?;
        params.validate()?;
        let processed: HashSet<String> = self
            .live_processed(ctx)
            .into_iter()
            .filter(|p| {
                in_window(p.timestamp, params.start_time, params.end_time)
                    && one_of(&params.external_customer_ids, &p.external_customer_id)
            })
            .map(|p| p.id)
            .collect();

        let (page, cursor) = self.raw_page(ctx, params, &processed);
        debug!(found = page.len(), has_more = cursor.is_some(), "Discovered unprocessed events");
        Ok((page, cursor))
    }

    #[instrument(skip(self, ctx, params), fields(tenant_id = %ctx.tenant_id, batch_size = params.effective_batch_size()))]
    async fn find_raw_events(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
    ) -> Result<(Vec<RawEvent>, Option<KeysetCursor>)> {
        begin(ctx, "find_raw_events")?;
        params.validate()?;
        Ok(self.raw_page(ctx, params, &HashSet::new()))
    }
}

#[async_trait]
impl ProcessedEventRepository for InMemoryEventStore {
    #[instrument(skip(self, ctx, event), fields(event_id = %event.id))]
    async fn insert_processed_event(&self, ctx: &RequestContext, event: &ProcessedEvent) -> Result<()> {
        begin(ctx, "insert_processed_event")?;
        event.validate()?;
        check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        self.processed.entry(scope(ctx)).or_default().push(event.clone());
        Ok(())
    }

    #[instrument(skip(self, ctx, events), fields(count = events.len()))]
    async fn bulk_insert_processed_events(
        &self,
        ctx: &RequestContext,
        events: &[ProcessedEvent],
    ) -> Result<()> {
        begin(ctx, "bulk_insert_processed_events")?;
        for event in events {
            event.validate()?;
            check_scope(ctx, &event.tenant_id, &event.environment_id)?;
        }
        for chunk in events.chunks(self.chunk_size) {
            self.write_processed_chunk(ctx, chunk)?;
        }
        Ok(())
    }

    async fn get_processed_events(
        &self,
        ctx: &RequestContext,
        params: &GetProcessedEventsParams,
    ) -> Result<(Vec<ProcessedEvent>, u64)> {
        begin(ctx, "get_processed_events")?;
        params.validate()?;
        let mut rows: Vec<ProcessedEvent> = self
            .live_processed(ctx)
            .into_iter()
            .filter(|e| {
                in_window(e.timestamp, params.start_time, params.end_time)
                    && matches_opt(params.customer_id.as_ref(), &e.customer_id)
                    && matches_opt(params.subscription_id.as_ref(), &e.subscription_id)
                    && matches_opt(params.meter_id.as_ref(), &e.meter_id)
                    && matches_opt(params.feature_id.as_ref(), &e.feature_id)
                    && matches_opt(params.price_id.as_ref(), &e.price_id)
                    && params.event_status.map(|s| s == e.event_status).unwrap_or(true)
            })
            .collect();
        rows.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));

        let total = if params.count_total { rows.len() as u64 } else { 0 };
        let page = rows
            .into_iter()
            .skip(params.offset as usize)
            .take(params.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn get_usage_summary(&self, ctx: &RequestContext, params: &UsageSummaryParams) -> Result<Decimal> {
        begin(ctx, "get_usage_summary")?;
        params.validate()?;
        Ok(self.summary_rows(ctx, params).iter().map(|e| e.cost).sum())
    }

    async fn get_feature_totals(
        &self,
        ctx: &RequestContext,
        params: &UsageSummaryParams,
    ) -> Result<Vec<FeatureUsageTotal>> {
        begin(ctx, "get_feature_totals")?;
        params.validate()?;
        let mut totals: BTreeMap<String, FeatureUsageTotal> = BTreeMap::new();
        for row in self.summary_rows(ctx, params) {
            let total = totals
                .entry(row.feature_id.clone())
                .or_insert_with(|| FeatureUsageTotal {
                    feature_id: row.feature_id.clone(),
                    quantity: Decimal::ZERO,
                    cost: Decimal::ZERO,
                    event_count: 0,
                });
            total.quantity += row.quantity;
            total.cost += row.cost;
            total.event_count += 1;
        }
        Ok(totals.into_values().collect())
    }

    async fn find_unprocessed_events(
        &self,
        ctx: &RequestContext,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> Result<Vec<ProcessedEvent>> {
        begin(ctx, "find_unprocessed_events")?;
        validate_pending_lookup(customer_id, subscription_id)?;
        let mut rows: Vec<ProcessedEvent> = self
            .live_processed(ctx)
            .into_iter()
            .filter(|e| {
                e.event_status == EventStatus::Pending
                    && customer_id.map(|c| c == e.customer_id).unwrap_or(true)
                    && subscription_id.map(|s| s == e.subscription_id).unwrap_or(true)
            })
            .collect();
        rows.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(rows)
    }
}

#[async_trait]
impl UsageRepository for InMemoryEventStore {
    #[instrument(skip(self, ctx, params), fields(event_name = %params.event_name, aggregation = %params.aggregation_type))]
    async fn get_usage(&self, ctx: &RequestContext, params: &UsageParams) -> Result<AggregationResult> {
        begin(ctx, "get_usage")?;
        params.validate()?;
        let property = if params.aggregation_type.requires_property() {
            params.property()?
        } else {
            ""
        };

        let rows = self.usage_rows(ctx, params);
        let all: Vec<&ProcessedEvent> = rows.iter().collect();
        let value = aggregate(&all, params.aggregation_type, property)?;

        let mut results = Vec::new();
        if let Some(window) = params.window_size {
            let mut buckets: BTreeMap<DateTime<Utc>, Vec<&ProcessedEvent>> = window
                .buckets(params.start_time, params.end_time)
                .into_iter()
                .map(|b| (b, Vec::new()))
                .collect();
            for row in &rows {
                buckets
                    .entry(window.bucket_start(row.timestamp))
                    .or_default()
                    .push(row);
            }
            for (window_start, bucket) in buckets {
                results.push(UsageWindow {
                    window_start,
                    value: aggregate(&bucket, params.aggregation_type, property)?,
                });
            }
        }

        Ok(AggregationResult {
            value,
            results,
            event_name: params.event_name.clone(),
            aggregation_type: params.aggregation_type,
        })
    }

    #[instrument(skip(self, ctx, params), fields(event_name = %params.usage.event_name, groups = params.filter_groups.len()))]
    async fn get_usage_with_filters(
        &self,
        ctx: &RequestContext,
        params: &UsageWithFiltersParams,
    ) -> Result<Vec<FilterGroupUsage>> {
        begin(ctx, "get_usage_with_filters")?;
        params.validate()?;
        let usage = &params.usage;
        let property = if usage.aggregation_type.requires_property() {
            usage.property()?
        } else {
            ""
        };

        let rows = self.usage_rows(ctx, usage);
        let mut groups: BTreeMap<&str, Vec<&ProcessedEvent>> = BTreeMap::new();
        for row in &rows {
            let group = if params.filter_groups.is_empty() {
                Some("")
            } else {
                best_match(&row.properties, &params.filter_groups)
            };
            if let Some(group_id) = group {
                groups.entry(group_id).or_default().push(row);
            }
        }

        groups
            .into_iter()
            .map(|(group_id, members)| {
                Ok(FilterGroupUsage {
                    filter_group_id: group_id.to_string(),
                    value: aggregate(&members, usage.aggregation_type, property)?,
                })
            })
            .collect()
    }
}
