//! Usage processor
//!
//! Drains unprocessed raw events for one tenant window page by page, prices
//! each through its meter binding and writes the processed rows before asking
//! for the next page. Callers must not run two processors over the same
//! tenant window at once.

use crate::config::ProcessingSettings;
use crate::expression::{number_to_decimal, QuantityEvaluator};
use crate::metrics::EngineMetrics;
use crate::repository::{ProcessedEventRepository, RawEventRepository};
use meterline_common::{
    EventStatus, FindRawEventsParams, MeteringError, ProcessedEvent, RawEvent, RequestContext,
    Result, DEFAULT_DISCOVERY_BATCH_SIZE,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How events of one name are priced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterBinding {
    pub event_name: String,
    /// Restrict to one customer; bindings with a customer win over generic ones
    #[serde(default)]
    pub external_customer_id: Option<String>,
    /// Internal customer id stamped on processed rows
    #[serde(default)]
    pub customer_id: String,
    /// Quantity formula over event properties
    #[serde(default)]
    pub formula: Option<String>,
    /// Numeric property used as the quantity when no formula is set
    #[serde(default)]
    pub aggregation_field: Option<String>,
    pub unit_price: Decimal,
    pub currency: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub price_id: String,
    #[serde(default)]
    pub meter_id: String,
    #[serde(default)]
    pub feature_id: String,
}

impl MeterBinding {
    pub fn new(event_name: impl Into<String>, unit_price: Decimal, currency: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            external_customer_id: None,
            customer_id: String::new(),
            formula: None,
            aggregation_field: None,
            unit_price,
            currency: currency.into(),
            subscription_id: String::new(),
            price_id: String::new(),
            meter_id: String::new(),
            feature_id: String::new(),
        }
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn with_aggregation_field(mut self, field: impl Into<String>) -> Self {
        self.aggregation_field = Some(field.into());
        self
    }

    pub fn for_customer(mut self, external_customer_id: impl Into<String>, customer_id: impl Into<String>) -> Self {
        self.external_customer_id = Some(external_customer_id.into());
        self.customer_id = customer_id.into();
        self
    }

    pub fn with_ids(
        mut self,
        subscription_id: impl Into<String>,
        price_id: impl Into<String>,
        meter_id: impl Into<String>,
        feature_id: impl Into<String>,
    ) -> Self {
        self.subscription_id = subscription_id.into();
        self.price_id = price_id.into();
        self.meter_id = meter_id.into();
        self.feature_id = feature_id.into();
        self
    }

    fn applies_to(&self, event: &RawEvent) -> bool {
        self.event_name == event.event_name
            && self
                .external_customer_id
                .as_ref()
                .map(|c| *c == event.external_customer_id)
                .unwrap_or(true)
    }
}

/// Binding for an event, customer-specific first, then in declaration order
pub fn binding_for<'a>(meters: &'a [MeterBinding], event: &RawEvent) -> Option<&'a MeterBinding> {
    meters
        .iter()
        .filter(|m| m.external_customer_id.is_some())
        .find(|m| m.applies_to(event))
        .or_else(|| meters.iter().find(|m| m.applies_to(event)))
}

/// Outcome of one processing run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    /// Discovery pages fetched, the final empty or short page included
    pub batches: usize,
    pub discovered: usize,
    pub processed: usize,
    pub failed: usize,
    /// Events without a binding
    pub skipped: usize,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
}

/// Turns raw events into processed events
pub struct UsageProcessor {
    raw: Arc<dyn RawEventRepository>,
    processed: Arc<dyn ProcessedEventRepository>,
    evaluator: Arc<dyn QuantityEvaluator>,
    metrics: Option<EngineMetrics>,
    /// Page size used when the caller's params leave it at zero
    batch_size: usize,
}

impl UsageProcessor {
    pub fn new(
        raw: Arc<dyn RawEventRepository>,
        processed: Arc<dyn ProcessedEventRepository>,
        evaluator: Arc<dyn QuantityEvaluator>,
    ) -> Self {
        Self {
            raw,
            processed,
            evaluator,
            metrics: None,
            batch_size: DEFAULT_DISCOVERY_BATCH_SIZE,
        }
    }

    /// Apply the configured discovery page size
    pub fn with_settings(mut self, settings: &ProcessingSettings) -> Self {
        if settings.discovery_batch_size > 0 {
            self.batch_size = settings.discovery_batch_size;
        }
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Process every unprocessed event matching `params`, starting from
    /// `params.cursor` and following the keyset until it runs out
    #[instrument(skip(self, ctx, params, meters), fields(tenant_id = %ctx.tenant_id, environment_id = %ctx.environment_id))]
    pub async fn process_window(
        &self,
        ctx: &RequestContext,
        params: &FindRawEventsParams,
        meters: &[MeterBinding],
    ) -> Result<ProcessingSummary> {
        let started = Instant::now();
        let mut params = params.clone();
        if params.batch_size == 0 {
            params.batch_size = self.batch_size;
        }
        let mut summary = ProcessingSummary::default();

        loop {
            let (events, cursor) = self.raw.find_unprocessed_raw_events(ctx, &params).await?;
            summary.batches += 1;
            summary.discovered += events.len();
            if let Some(metrics) = &self.metrics {
                metrics.discovery_batches.inc();
            }

            let mut rows = Vec::with_capacity(events.len());
            for event in &events {
                match binding_for(meters, event) {
                    Some(binding) => rows.push(self.process_event(event, binding)),
                    None => {
                        debug!(event_id = %event.id, event_name = %event.event_name, "No meter binding");
                        summary.skipped += 1;
                    }
                }
            }

            if !rows.is_empty() {
                self.processed.bulk_insert_processed_events(ctx, &rows).await?;
            }
            for row in &rows {
                match row.event_status {
                    EventStatus::Failed => summary.failed += 1,
                    _ => {
                        summary.processed += 1;
                        summary.total_quantity += row.quantity;
                        summary.total_cost += row.cost;
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .events_processed
                        .with_label_values(&[row.event_status.as_str()])
                        .inc();
                }
            }

            match cursor {
                Some(next) => params.cursor = Some(next),
                None => break,
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.events_skipped.inc_by(summary.skipped as u64);
            metrics
                .processing_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }
        info!(
            batches = summary.batches,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            total_cost = %summary.total_cost,
            "Window processed"
        );
        Ok(summary)
    }

    /// Processed row for one event; pricing failures yield a failed row
    pub fn process_event(&self, event: &RawEvent, binding: &MeterBinding) -> ProcessedEvent {
        let mut row = ProcessedEvent::from_raw(event);
        row.customer_id = binding.customer_id.clone();
        row.subscription_id = binding.subscription_id.clone();
        row.price_id = binding.price_id.clone();
        row.meter_id = binding.meter_id.clone();
        row.feature_id = binding.feature_id.clone();
        row.currency = binding.currency.clone();
        if let Some(field) = &binding.aggregation_field {
            row.aggregation_field = field.clone();
            row.aggregation_field_value = event
                .payload
                .get(field)
                .map(|v| match v {
                    JsonValue::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
        }

        match self.price(event, binding) {
            Ok((quantity, cost)) => row.complete(quantity, cost),
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "Failed to price event");
                row.fail()
            }
        }
    }

    fn price(&self, event: &RawEvent, binding: &MeterBinding) -> Result<(Decimal, Decimal)> {
        let quantity = match (&binding.formula, &binding.aggregation_field) {
            (Some(formula), _) => self.evaluator.evaluate_quantity(formula, &event.payload)?,
            (None, Some(field)) => field_quantity(event, field)?,
            (None, None) => Decimal::ONE,
        };
        if quantity < Decimal::ZERO {
            return Err(MeteringError::Validation(format!(
                "quantity {} is negative",
                quantity
            )));
        }
        let cost = quantity.checked_mul(binding.unit_price).ok_or_else(|| {
            MeteringError::Cast(format!(
                "cost of {} x {} overflows",
                quantity, binding.unit_price
            ))
        })?;
        Ok((quantity.normalize(), cost.normalize()))
    }
}

/// Numeric property as a quantity; numeric strings are accepted
fn field_quantity(event: &RawEvent, field: &str) -> Result<Decimal> {
    match event.payload.get(field) {
        Some(JsonValue::String(s)) => Decimal::from_str(s.trim())
            .map_err(|_| MeteringError::Cast(format!("property {} is not numeric: {}", field, s))),
        Some(JsonValue::Number(n)) => Ok(number_to_decimal(n)?),
        Some(other) => Err(MeteringError::Cast(format!(
            "property {} is not numeric: {}",
            field, other
        ))),
        None => Err(MeteringError::Cast(format!("property {} is missing", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::ExpressionEvaluator;
    use crate::repository::InMemoryEventStore;
    use chrono::{Duration, TimeZone, Utc};
    use meterline_common::GetProcessedEventsParams;
    use rust_decimal_macros::dec;

    fn ctx() -> RequestContext {
        RequestContext::new("tenant_1", "env_1")
    }

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn event(id: &str, name: &str, minutes: i64) -> RawEvent {
        RawEvent::new(id, "tenant_1", "env_1", "cust_1", name, t0() + Duration::minutes(minutes))
    }

    fn processor(store: &Arc<InMemoryEventStore>) -> UsageProcessor {
        UsageProcessor::new(store.clone(), store.clone(), Arc::new(ExpressionEvaluator::new()))
    }

    #[test]
    fn test_customer_binding_wins() {
        let meters = vec![
            MeterBinding::new("api_call", dec!(1), "USD"),
            MeterBinding::new("api_call", dec!(0.5), "USD").for_customer("cust_1", "cus_1"),
        ];
        let chosen = binding_for(&meters, &event("e1", "api_call", 0)).unwrap();
        assert_eq!(chosen.unit_price, dec!(0.5));
        assert!(binding_for(&meters, &event("e2", "other", 0)).is_none());
    }

    #[test]
    fn test_price_by_formula_field_and_count() {
        let store = Arc::new(InMemoryEventStore::new());
        let p = processor(&store);
        let e = event("e1", "image_generated", 0)
            .with_property("token", 10)
            .with_property("duration", 30)
            .with_property("pixel", 10)
            .with_property("size", "2.5");

        let by_formula = MeterBinding::new("image_generated", dec!(0.001), "USD")
            .with_formula("token * duration * pixel");
        let row = p.process_event(&e, &by_formula);
        assert_eq!(row.event_status, EventStatus::Processed);
        assert_eq!(row.quantity, dec!(3000));
        assert_eq!(row.cost, dec!(3));

        let by_field = MeterBinding::new("image_generated", dec!(2), "USD").with_aggregation_field("size");
        let row = p.process_event(&e, &by_field);
        assert_eq!(row.quantity, dec!(2.5));
        assert_eq!(row.cost, dec!(5));
        assert_eq!(row.aggregation_field_value, "2.5");

        let by_count = MeterBinding::new("image_generated", dec!(0.2), "USD");
        assert_eq!(p.process_event(&e, &by_count).quantity, dec!(1));
    }

    #[test]
    fn test_bad_formula_yields_failed_row() {
        let store = Arc::new(InMemoryEventStore::new());
        let p = processor(&store);
        let e = event("e1", "api_call", 0).with_property("model", "gpt-4");
        let binding = MeterBinding::new("api_call", dec!(1), "USD").with_formula("model");
        let row = p.process_event(&e, &binding);
        assert_eq!(row.event_status, EventStatus::Failed);
        assert_eq!(row.cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_process_window_drains_all_pages() {
        let store = Arc::new(InMemoryEventStore::new());
        let events: Vec<RawEvent> = (0..7)
            .map(|i| event(&format!("event_{}", i), "api_call", i).with_property("tokens", 2))
            .chain([event("event_x", "unmetered", 30)])
            .collect();
        store.bulk_insert_events(&ctx(), &events).await.unwrap();

        let meters = vec![MeterBinding::new("api_call", dec!(0.5), "USD").with_formula("tokens")];
        let params = FindRawEventsParams::for_window(t0(), t0() + Duration::hours(1)).with_batch_size(3);
        let summary = processor(&store)
            .process_window(&ctx(), &params, &meters)
            .await
            .unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.discovered, 8);
        assert_eq!(summary.processed, 7);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total_quantity, dec!(14));
        assert_eq!(summary.total_cost, dec!(7));

        let (rows, total) = store
            .get_processed_events(
                &ctx(),
                &GetProcessedEventsParams {
                    count_total: true,
                    limit: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(total, 7);
        assert!(rows.iter().all(|r| r.currency == "USD"));

        // Only the unmetered event is still unprocessed
        let again = processor(&store)
            .process_window(&ctx(), &params, &meters)
            .await
            .unwrap();
        assert_eq!(again.discovered, 1);
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn test_configured_batch_size_applies_to_unsized_params() {
        let store = Arc::new(InMemoryEventStore::new());
        let events: Vec<RawEvent> = (0..5)
            .map(|i| event(&format!("event_{}", i), "api_call", i))
            .collect();
        store.bulk_insert_events(&ctx(), &events).await.unwrap();

        let settings = ProcessingSettings {
            discovery_batch_size: 2,
        };
        let processor = processor(&store).with_settings(&settings);
        assert_eq!(processor.batch_size(), 2);

        let params = FindRawEventsParams::for_window(t0(), t0() + Duration::hours(1)).with_batch_size(0);
        let summary = processor
            .process_window(&ctx(), &params, &[MeterBinding::new("api_call", dec!(1), "USD")])
            .await
            .unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.processed, 5);
    }
}
