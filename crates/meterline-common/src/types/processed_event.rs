//! Processed events
//!
//! One processed row per raw event once its quantity and cost are computed.
//! Rewrites of the same id are logical replaces resolved by `version`.

use crate::error::{MeteringError, Result};
use crate::types::raw_event::{RawEvent, SIGN_INSERT};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Processing state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    /// Processed and failed are terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(MeteringError::Validation(format!(
                "invalid event status: {}",
                other
            ))),
        }
    }
}

/// Event with computed billing quantity and cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub external_customer_id: String,
    /// Internal customer id
    pub customer_id: String,
    pub event_name: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub subscription_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub feature_id: String,
    pub aggregation_field: String,
    pub aggregation_field_value: String,
    pub quantity: Decimal,
    pub cost: Decimal,
    pub currency: String,
    pub event_status: EventStatus,
    /// Properties carried over from the raw payload
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub version: u64,
    pub sign: i8,
}

impl ProcessedEvent {
    /// Pending processed row derived from a raw event
    pub fn from_raw(raw: &RawEvent) -> Self {
        let processed_at = Utc::now();
        Self {
            id: raw.id.clone(),
            tenant_id: raw.tenant_id.clone(),
            environment_id: raw.environment_id.clone(),
            external_customer_id: raw.external_customer_id.clone(),
            customer_id: String::new(),
            event_name: raw.event_name.clone(),
            source: raw.source.clone(),
            timestamp: raw.timestamp,
            ingested_at: raw.ingested_at,
            processed_at,
            subscription_id: String::new(),
            price_id: String::new(),
            meter_id: String::new(),
            feature_id: String::new(),
            aggregation_field: String::new(),
            aggregation_field_value: String::new(),
            quantity: Decimal::ZERO,
            cost: Decimal::ZERO,
            currency: String::new(),
            event_status: EventStatus::Pending,
            properties: raw.payload.clone(),
            version: processed_at.timestamp_millis().max(0) as u64,
            sign: SIGN_INSERT,
        }
    }

    /// Mark as processed with the computed quantity and cost
    pub fn complete(mut self, quantity: Decimal, cost: Decimal) -> Self {
        self.quantity = quantity;
        self.cost = cost;
        self.event_status = EventStatus::Processed;
        self
    }

    pub fn fail(mut self) -> Self {
        self.quantity = Decimal::ZERO;
        self.cost = Decimal::ZERO;
        self.event_status = EventStatus::Failed;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

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
        if self.customer_id.is_empty() && self.external_customer_id.is_empty() {
            return Err(MeteringError::Validation(
                "customer_id or external_customer_id is required".into(),
            ));
        }
        if self.quantity < Decimal::ZERO {
            return Err(MeteringError::Validation(
                "quantity cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn raw() -> RawEvent {
        RawEvent::new(
            "event_1",
            "tenant_1",
            "env_1",
            "cust_1",
            "api_call",
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
        .with_property("tokens", 40)
    }

    #[test]
    fn test_from_raw_is_pending() {
        let processed = ProcessedEvent::from_raw(&raw());
        assert_eq!(processed.event_status, EventStatus::Pending);
        assert_eq!(processed.quantity, Decimal::ZERO);
        assert_eq!(processed.properties.get("tokens"), Some(&Value::from(40)));
        assert_eq!(processed.sign, SIGN_INSERT);
        assert!(processed.validate().is_ok());
    }

    #[test]
    fn test_complete_and_fail() {
        let done = ProcessedEvent::from_raw(&raw()).complete(dec!(40), dec!(0.8));
        assert_eq!(done.event_status, EventStatus::Processed);
        assert_eq!(done.cost, dec!(0.8));

        let failed = done.fail();
        assert_eq!(failed.event_status, EventStatus::Failed);
        assert_eq!(failed.cost, Decimal::ZERO);
        assert!(failed.event_status.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("processed".parse::<EventStatus>().unwrap(), EventStatus::Processed);
        assert!("done".parse::<EventStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&EventStatus::Failed).unwrap(),
            "\"failed\""
        );
    }
}
