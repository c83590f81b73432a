//! Event ingestion
//!
//! A [`Subscription`] yields deliveries from a transport; the
//! [`IngestConsumer`] decodes each into a [`RawEvent`], writes it, and acks
//! only once the write succeeded.
//!
//! - `channel`: in-process tokio channel transport
//! - `nats`: NATS JetStream pull consumer
//! - `consumer`: the decode/write/ack loop

pub mod channel;
pub mod consumer;
pub mod nats;

pub use channel::{AckCounter, ChannelPublisher, ChannelSubscription};
pub use consumer::{IngestConsumer, IngestStats, Outcome};
pub use nats::NatsSubscription;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use meterline_common::{MeteringError, RawEvent, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Acknowledges one delivery to its transport
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// One message from a subscription
pub struct Delivery {
    pub payload: Bytes,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: Box<dyn Acker>) -> Self {
        Self { payload, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Source of deliveries; `None` once the transport is closed
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Wire document for an ingested event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEvent {
    #[serde(default, alias = "event_id")]
    pub id: Option<String>,
    pub tenant_id: String,
    #[serde(default)]
    pub environment_id: String,
    pub external_customer_id: String,
    pub event_name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, alias = "payload")]
    pub properties: Map<String, Value>,
    /// Event time; required so that redeliveries share one sort key
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IngestEvent {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| MeteringError::Serialization(format!("invalid ingest event: {}", e)))
    }

    /// Raw event stamped with arrival time and version.
    ///
    /// The id and timestamp come only from the document, so a redelivered
    /// message lands on the same `(timestamp, id)` key and collapses into the
    /// earlier write. Documents missing either are rejected.
    pub fn into_raw_event(self, ingested_at: DateTime<Utc>) -> Result<RawEvent> {
        let id = match self.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(MeteringError::Validation("event id is required".into())),
        };
        let timestamp = self
            .timestamp
            .ok_or_else(|| MeteringError::Validation("event timestamp is required".into()))?;
        let event = RawEvent::new(
            id,
            self.tenant_id,
            self.environment_id,
            self.external_customer_id,
            self.event_name,
            timestamp,
        )
        .with_source(self.source)
        .with_payload(self.properties)
        .with_ingested_at(ingested_at)
        .with_version(ingested_at.timestamp_millis().max(0) as u64);
        event.validate()?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_full_document() {
        let doc = br#"{
            "event_id": "evt_1",
            "tenant_id": "tenant_1",
            "environment_id": "env_1",
            "external_customer_id": "cust_1",
            "event_name": "api_call",
            "source": "sdk",
            "properties": {"tokens": 12, "model": "gpt-4"},
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let raw = IngestEvent::decode(doc).unwrap().into_raw_event(at).unwrap();

        assert_eq!(raw.id, "evt_1");
        assert_eq!(raw.source, "sdk");
        assert_eq!(raw.payload["tokens"], 12);
        assert_eq!(raw.timestamp, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(raw.ingested_at, at);
        assert_eq!(raw.version, at.timestamp_millis() as u64);
        assert!(raw.validate().is_ok());
    }

    #[test]
    fn test_missing_id_or_timestamp_is_rejected() {
        let at = Utc::now();
        let no_timestamp = br#"{"id":"evt_1","tenant_id":"t","environment_id":"e","external_customer_id":"c","event_name":"n"}"#;
        let err = IngestEvent::decode(no_timestamp).unwrap().into_raw_event(at).unwrap_err();
        assert!(err.is_validation());

        for id in [r#""#, r#""id":"  ","#] {
            let doc = format!(
                r#"{{{}"tenant_id":"t","environment_id":"e","external_customer_id":"c","event_name":"n","timestamp":"2024-01-01T00:00:00Z"}}"#,
                id
            );
            let err = IngestEvent::decode(doc.as_bytes())
                .unwrap()
                .into_raw_event(at)
                .unwrap_err();
            assert!(err.is_validation(), "{:?}", err);
        }
    }

    #[test]
    fn test_redelivery_keeps_the_sort_key() {
        let doc = br#"{"id":"evt_1","tenant_id":"t","environment_id":"e","external_customer_id":"c","event_name":"n","timestamp":"2024-01-01T00:00:00Z"}"#;
        let first = IngestEvent::decode(doc)
            .unwrap()
            .into_raw_event(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap())
            .unwrap();
        let second = IngestEvent::decode(doc)
            .unwrap()
            .into_raw_event(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap())
            .unwrap();
        assert_eq!((first.timestamp, &first.id), (second.timestamp, &second.id));
        assert!(second.version > first.version);
    }

    #[test]
    fn test_malformed_document_is_serialization_error() {
        let err = IngestEvent::decode(b"{not json").unwrap_err();
        assert!(matches!(err, MeteringError::Serialization(_)));
        assert!(!err.is_retryable());
    }
}
