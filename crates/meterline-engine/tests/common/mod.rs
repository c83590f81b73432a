//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use meterline_common::{RawEvent, RequestContext};
use meterline_engine::{ExpressionEvaluator, InMemoryEventStore, UsageProcessor};
use std::sync::Arc;

pub const TENANT: &str = "tenant_1";
pub const ENV: &str = "env_1";

/// Store plus a processor wired to it
pub struct TestHarness {
    pub ctx: RequestContext,
    pub store: Arc<InMemoryEventStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            ctx: RequestContext::new(TENANT, ENV),
            store: Arc::new(InMemoryEventStore::new()),
        }
    }

    pub fn processor(&self) -> UsageProcessor {
        UsageProcessor::new(
            self.store.clone(),
            self.store.clone(),
            Arc::new(ExpressionEvaluator::new()),
        )
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

pub fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

pub fn raw_event(id: &str, customer: &str, name: &str, minutes: i64) -> RawEvent {
    RawEvent::new(id, TENANT, ENV, customer, name, at(minutes))
}

/// Ingest JSON document as a producer would publish it
pub fn ingest_doc(id: &str, customer: &str, name: &str, minutes: i64, properties: serde_json::Value) -> String {
    serde_json::json!({
        "id": id,
        "tenant_id": TENANT,
        "environment_id": ENV,
        "external_customer_id": customer,
        "event_name": name,
        "timestamp": at(minutes),
        "properties": properties,
    })
    .to_string()
}
