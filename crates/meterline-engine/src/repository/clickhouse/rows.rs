//! RowBinary shapes of the event tables and query results
//!
//! `DateTime64(3)` columns travel as epoch milliseconds, `DateTime` as epoch
//! seconds and `Decimal128(15)` as the scaled mantissa.

use ::clickhouse::Row;
use chrono::{DateTime, TimeZone, Utc};
use meterline_common::{FeatureUsageTotal, MeteringError, ProcessedEvent, RawEvent, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scale of the quantity and cost columns
pub const DECIMAL_SCALE: u32 = 15;

/// Column list of `raw_events`, in [`RawEventRow`] field order
pub const RAW_EVENT_COLUMNS: &str = "id, tenant_id, environment_id, external_customer_id, \
    event_name, source, payload, field1, field2, field3, field4, field5, field6, field7, \
    field8, field9, field10, timestamp, ingested_at, version, sign";

/// Column list of `events_processed`, in [`ProcessedEventRow`] field order
pub const PROCESSED_EVENT_COLUMNS: &str = "id, tenant_id, environment_id, \
    external_customer_id, customer_id, event_name, source, timestamp, ingested_at, \
    processed_at, subscription_id, price_id, meter_id, feature_id, aggregation_field, \
    aggregation_field_value, quantity, cost, currency, event_status, properties, version, sign";

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct RawEventRow {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub external_customer_id: String,
    pub event_name: String,
    pub source: String,
    pub payload: String,
    pub field1: Option<String>,
    pub field2: Option<String>,
    pub field3: Option<String>,
    pub field4: Option<String>,
    pub field5: Option<String>,
    pub field6: Option<String>,
    pub field7: Option<String>,
    pub field8: Option<String>,
    pub field9: Option<String>,
    pub field10: Option<String>,
    pub timestamp: i64,
    pub ingested_at: i64,
    pub version: u64,
    pub sign: i8,
}

impl TryFrom<&RawEvent> for RawEventRow {
    type Error = MeteringError;

    fn try_from(event: &RawEvent) -> Result<Self> {
        let [field1, field2, field3, field4, field5, field6, field7, field8, field9, field10] =
            event.fields.clone();
        Ok(Self {
            id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            environment_id: event.environment_id.clone(),
            external_customer_id: event.external_customer_id.clone(),
            event_name: event.event_name.clone(),
            source: event.source.clone(),
            payload: serde_json::to_string(&event.payload)?,
            field1,
            field2,
            field3,
            field4,
            field5,
            field6,
            field7,
            field8,
            field9,
            field10,
            timestamp: event.timestamp.timestamp_millis(),
            ingested_at: event.ingested_at.timestamp_millis(),
            version: event.version,
            sign: event.sign,
        })
    }
}

impl TryFrom<RawEventRow> for RawEvent {
    type Error = MeteringError;

    fn try_from(row: RawEventRow) -> Result<Self> {
        Ok(Self {
            payload: parse_object(&row.payload)?,
            timestamp: from_millis(row.timestamp)?,
            ingested_at: from_millis(row.ingested_at)?,
            fields: [
                row.field1, row.field2, row.field3, row.field4, row.field5, row.field6,
                row.field7, row.field8, row.field9, row.field10,
            ],
            id: row.id,
            tenant_id: row.tenant_id,
            environment_id: row.environment_id,
            external_customer_id: row.external_customer_id,
            event_name: row.event_name,
            source: row.source,
            version: row.version,
            sign: row.sign,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct ProcessedEventRow {
    pub id: String,
    pub tenant_id: String,
    pub environment_id: String,
    pub external_customer_id: String,
    pub customer_id: String,
    pub event_name: String,
    pub source: String,
    pub timestamp: i64,
    pub ingested_at: i64,
    pub processed_at: i64,
    pub subscription_id: String,
    pub price_id: String,
    pub meter_id: String,
    pub feature_id: String,
    pub aggregation_field: String,
    pub aggregation_field_value: String,
    pub quantity: i128,
    pub cost: i128,
    pub currency: String,
    pub event_status: String,
    pub properties: String,
    pub version: u64,
    pub sign: i8,
}

impl TryFrom<&ProcessedEvent> for ProcessedEventRow {
    type Error = MeteringError;

    fn try_from(event: &ProcessedEvent) -> Result<Self> {
        Ok(Self {
            id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            environment_id: event.environment_id.clone(),
            external_customer_id: event.external_customer_id.clone(),
            customer_id: event.customer_id.clone(),
            event_name: event.event_name.clone(),
            source: event.source.clone(),
            timestamp: event.timestamp.timestamp_millis(),
            ingested_at: event.ingested_at.timestamp_millis(),
            processed_at: event.processed_at.timestamp_millis(),
            subscription_id: event.subscription_id.clone(),
            price_id: event.price_id.clone(),
            meter_id: event.meter_id.clone(),
            feature_id: event.feature_id.clone(),
            aggregation_field: event.aggregation_field.clone(),
            aggregation_field_value: event.aggregation_field_value.clone(),
            quantity: to_scaled(event.quantity)?,
            cost: to_scaled(event.cost)?,
            currency: event.currency.clone(),
            event_status: event.event_status.as_str().to_string(),
            properties: serde_json::to_string(&event.properties)?,
            version: event.version,
            sign: event.sign,
        })
    }
}

impl TryFrom<ProcessedEventRow> for ProcessedEvent {
    type Error = MeteringError;

    fn try_from(row: ProcessedEventRow) -> Result<Self> {
        Ok(Self {
            timestamp: from_millis(row.timestamp)?,
            ingested_at: from_millis(row.ingested_at)?,
            processed_at: from_millis(row.processed_at)?,
            quantity: from_scaled(row.quantity)?,
            cost: from_scaled(row.cost)?,
            event_status: row.event_status.parse()?,
            properties: parse_object(&row.properties)?,
            id: row.id,
            tenant_id: row.tenant_id,
            environment_id: row.environment_id,
            external_customer_id: row.external_customer_id,
            customer_id: row.customer_id,
            event_name: row.event_name,
            source: row.source,
            subscription_id: row.subscription_id,
            price_id: row.price_id,
            meter_id: row.meter_id,
            feature_id: row.feature_id,
            aggregation_field: row.aggregation_field,
            aggregation_field_value: row.aggregation_field_value,
            currency: row.currency,
            version: row.version,
            sign: row.sign,
        })
    }
}

/// Step A projection
#[derive(Debug, Clone, Row, Deserialize)]
pub struct UnprocessedIdRow {
    pub timestamp: i64,
    pub id: String,
    pub event_name: String,
}

#[derive(Debug, Clone, Row, Deserialize)]
pub struct CountRow {
    pub value: u64,
}

#[derive(Debug, Clone, Row, Deserialize)]
pub struct FloatRow {
    pub value: f64,
}

#[derive(Debug, Clone, Row, Deserialize)]
pub struct DecimalRow {
    pub value: i128,
}

/// Per-feature sums; `quantity` and `cost` are `Decimal128(15)` mantissas
#[derive(Debug, Clone, Row, Deserialize)]
pub struct FeatureTotalRow {
    pub feature_id: String,
    pub quantity: i128,
    pub cost: i128,
    pub event_count: u64,
}

impl TryFrom<FeatureTotalRow> for FeatureUsageTotal {
    type Error = MeteringError;

    fn try_from(row: FeatureTotalRow) -> Result<Self> {
        Ok(FeatureUsageTotal {
            feature_id: row.feature_id,
            quantity: from_scaled(row.quantity)?,
            cost: from_scaled(row.cost)?,
            event_count: row.event_count,
        })
    }
}

/// Bucketed count; `window_start` is a `DateTime`
#[derive(Debug, Clone, Row, Deserialize)]
pub struct WindowCountRow {
    pub window_start: u32,
    pub value: u64,
}

#[derive(Debug, Clone, Row, Deserialize)]
pub struct WindowFloatRow {
    pub window_start: u32,
    pub value: f64,
}

#[derive(Debug, Clone, Row, Deserialize)]
pub struct GroupValueRow {
    pub filter_group_id: String,
    pub value: f64,
}

pub fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| MeteringError::Serialization(format!("invalid timestamp {}", millis)))
}

pub fn from_seconds(seconds: u32) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .ok_or_else(|| MeteringError::Serialization(format!("invalid datetime {}", seconds)))
}

/// Decimal to the `Decimal128(15)` mantissa, rounding extra digits
pub fn to_scaled(value: Decimal) -> Result<i128> {
    let value = value.round_dp(DECIMAL_SCALE);
    let mantissa = value.mantissa();
    let scale = value.scale();
    mantissa
        .checked_mul(10i128.pow(DECIMAL_SCALE - scale))
        .ok_or_else(|| MeteringError::Serialization(format!("{} overflows Decimal128({})", value, DECIMAL_SCALE)))
}

/// `Decimal128(15)` mantissa to a normalized decimal
pub fn from_scaled(mantissa: i128) -> Result<Decimal> {
    Decimal::try_from_i128_with_scale(mantissa, DECIMAL_SCALE)
        .map(|d| d.normalize())
        .map_err(|e| MeteringError::Serialization(format!("decimal {} out of range: {}", mantissa, e)))
}

fn parse_object(text: &str) -> Result<Map<String, Value>> {
    if text.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(MeteringError::Serialization(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}
