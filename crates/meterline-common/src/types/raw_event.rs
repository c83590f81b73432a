//! Raw usage events
//!
//! A raw event is the immutable ingested fact. It is never updated in place; a
//! newer row with the same id and a higher version supersedes it, and a row with
//! `sign = -1` is a tombstone that hides the id from collapsed reads.

use crate::error::{MeteringError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Number of denormalized scalar columns carried next to the payload
pub const FIELD_COUNT: usize = 10;

/// Sign of a live row
pub const SIGN_INSERT: i8 = 1;
/// Sign of a tombstone row
pub const SIGN_DELETE: i8 = -1;

/// Generate a time-ordered event id (`event_<uuidv7>`)
pub fn generate_event_id() -> String {
    format!("{}{}", crate::EVENT_ID_PREFIX, Uuid::now_v7().simple())
}

/// Raw usage event as persisted in `raw_events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Logical event id, stable across versions
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    /// Customer id in the tenant's own system
    pub external_customer_id: String,
    pub event_name: String,
    #[serde(default)]
    pub source: String,
    /// Property bag of the event
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Denormalized scalars for filtering without JSON parsing (field1..field10)
    #[serde(default)]
    pub fields: [Option<String>; FIELD_COUNT],
    /// Event time
    pub timestamp: DateTime<Utc>,
    /// Arrival time
    pub ingested_at: DateTime<Utc>,
    /// Replace version, higher wins
    pub version: u64,
    /// +1 insert, -1 tombstone
    pub sign: i8,
}

impl RawEvent {
    /// Create a new live event; ingested_at is now and the version follows it
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        environment_id: impl Into<String>,
        external_customer_id: impl Into<String>,
        event_name: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let ingested_at = Utc::now();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            environment_id: environment_id.into(),
            external_customer_id: external_customer_id.into(),
            event_name: event_name.into(),
            source: String::new(),
            payload: Map::new(),
            fields: Default::default(),
            timestamp,
            ingested_at,
            version: ingested_at.timestamp_millis().max(0) as u64,
            sign: SIGN_INSERT,
        }
    }

    /// Set the property bag
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Set a single property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set denormalized field `n` (1-based, matching the column names)
    pub fn with_field(mut self, n: usize, value: impl Into<String>) -> Self {
        if (1..=FIELD_COUNT).contains(&n) {
            self.fields[n - 1] = Some(value.into());
        }
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    /// Tombstone superseding this event
    pub fn tombstone(&self, version: u64) -> Self {
        let mut row = self.clone();
        row.version = version;
        row.sign = SIGN_DELETE;
        row
    }

    pub fn is_tombstone(&self) -> bool {
        self.sign == SIGN_DELETE
    }

    /// Event properties used by formulas and filters
    pub fn properties(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Validate the event before it is written
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(MeteringError::Validation("id is required".into()));
        }
        if self.tenant_id.is_empty() {
            return Err(MeteringError::Validation("tenant_id is required".into()));
        }
        if self.environment_id.is_empty() {
            return Err(MeteringError::Validation(
                "environment_id is required".into(),
            ));
        }
        if self.event_name.is_empty() {
            return Err(MeteringError::Validation("event_name is required".into()));
        }
        if self.external_customer_id.is_empty() {
            return Err(MeteringError::Validation(
                "external_customer_id is required".into(),
            ));
        }
        if self.timestamp.timestamp_millis() <= 0 {
            return Err(MeteringError::Validation("timestamp is required".into()));
        }
        if self.sign != SIGN_INSERT && self.sign != SIGN_DELETE {
            return Err(MeteringError::Validation(format!(
                "sign must be 1 or -1, got {}",
                self.sign
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> RawEvent {
        RawEvent::new(
            "event_1",
            "tenant_1",
            "env_1",
            "cust_1",
            "api_call",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_new_event_defaults() {
        let event = sample();
        assert_eq!(event.sign, SIGN_INSERT);
        assert_eq!(event.version, event.ingested_at.timestamp_millis() as u64);
        assert!(event.payload.is_empty());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut event = sample();
        event.event_name.clear();
        assert!(event.validate().is_err());

        let mut event = sample();
        event.external_customer_id.clear();
        assert!(event.validate().is_err());

        let mut event = sample();
        event.sign = 0;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_fields_are_one_based() {
        let event = sample().with_field(1, "a").with_field(10, "j").with_field(11, "x");
        assert_eq!(event.fields[0].as_deref(), Some("a"));
        assert_eq!(event.fields[9].as_deref(), Some("j"));
        assert_eq!(event.fields.iter().flatten().count(), 2);
    }

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = generate_event_id();
        let b = generate_event_id();
        assert!(a.starts_with("event_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_tombstone() {
        let event = sample().with_property("tokens", 12);
        let dead = event.tombstone(event.version + 1);
        assert!(dead.is_tombstone());
        assert_eq!(dead.id, event.id);
        assert!(dead.version > event.version);
    }
}
