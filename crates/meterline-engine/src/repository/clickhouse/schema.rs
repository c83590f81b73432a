//! Table definitions
//!
//! Both tables are `ReplacingMergeTree(version)`: rows sharing a sorting key
//! collapse to the highest version on merge or under `FINAL`. Reads filter
//! `sign = 1` after the collapse so a tombstone hides its id.

use super::ClickHouseStore;
use crate::query::{PROCESSED_EVENTS_TABLE, RAW_EVENTS_TABLE};
use meterline_common::Result;
use tracing::info;

/// `raw_events`, ordered for the newest-first discovery scan
pub const RAW_EVENTS_DDL: &str = "CREATE TABLE IF NOT EXISTS raw_events (
    id String,
    tenant_id LowCardinality(String),
    environment_id LowCardinality(String),
    external_customer_id String,
    event_name LowCardinality(String),
    source LowCardinality(String),
    payload String CODEC(ZSTD(3)),
    field1 Nullable(String),
    field2 Nullable(String),
    field3 Nullable(String),
    field4 Nullable(String),
    field5 Nullable(String),
    field6 Nullable(String),
    field7 Nullable(String),
    field8 Nullable(String),
    field9 Nullable(String),
    field10 Nullable(String),
    timestamp DateTime64(3, 'UTC') CODEC(DoubleDelta, ZSTD(1)),
    ingested_at DateTime64(3, 'UTC'),
    version UInt64,
    sign Int8 DEFAULT 1,
    INDEX idx_external_customer_id external_customer_id TYPE bloom_filter(0.01) GRANULARITY 4,
    INDEX idx_event_name event_name TYPE set(0) GRANULARITY 4
)
ENGINE = ReplacingMergeTree(version)
PARTITION BY toYYYYMMDD(timestamp)
ORDER BY (tenant_id, environment_id, timestamp, id)
SETTINGS index_granularity = 8192";

/// `events_processed`, ordered for per-event-name usage scans
pub const PROCESSED_EVENTS_DDL: &str = "CREATE TABLE IF NOT EXISTS events_processed (
    id String,
    tenant_id LowCardinality(String),
    environment_id LowCardinality(String),
    external_customer_id String,
    customer_id String,
    event_name LowCardinality(String),
    source LowCardinality(String),
    timestamp DateTime64(3, 'UTC') CODEC(DoubleDelta, ZSTD(1)),
    ingested_at DateTime64(3, 'UTC'),
    processed_at DateTime64(3, 'UTC'),
    subscription_id String,
    price_id String,
    meter_id String,
    feature_id String,
    aggregation_field String,
    aggregation_field_value String,
    quantity Decimal128(15),
    cost Decimal128(15),
    currency LowCardinality(String),
    event_status LowCardinality(String) DEFAULT 'pending',
    properties String CODEC(ZSTD(3)),
    version UInt64,
    sign Int8 DEFAULT 1,
    INDEX idx_id id TYPE bloom_filter(0.01) GRANULARITY 4,
    INDEX idx_external_customer_id external_customer_id TYPE bloom_filter(0.01) GRANULARITY 4,
    INDEX idx_customer_id customer_id TYPE bloom_filter(0.01) GRANULARITY 4,
    INDEX idx_subscription_id subscription_id TYPE bloom_filter(0.01) GRANULARITY 4
)
ENGINE = ReplacingMergeTree(version)
PARTITION BY toYYYYMMDD(timestamp)
ORDER BY (tenant_id, environment_id, event_name, timestamp, id)
SETTINGS index_granularity = 8192";

/// Every table this engine owns, in creation order
pub fn migrations() -> [(&'static str, &'static str); 2] {
    [
        (RAW_EVENTS_TABLE, RAW_EVENTS_DDL),
        (PROCESSED_EVENTS_TABLE, PROCESSED_EVENTS_DDL),
    ]
}

impl ClickHouseStore {
    /// Create missing tables; existing tables are left untouched
    pub async fn migrate(&self) -> Result<()> {
        for (table, ddl) in migrations() {
            self.execute(ddl, &format!("Failed to create table {}", table))
                .await?;
            info!(table, "Table ready");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::clickhouse::rows::{PROCESSED_EVENT_COLUMNS, RAW_EVENT_COLUMNS};

    fn declares(ddl: &str, column: &str) -> bool {
        ddl.lines()
            .any(|line| line.trim_start().starts_with(&format!("{} ", column)))
    }

    #[test]
    fn test_ddl_declares_every_row_column() {
        for column in RAW_EVENT_COLUMNS.split(", ") {
            assert!(declares(RAW_EVENTS_DDL, column), "raw_events lacks {}", column);
        }
        for column in PROCESSED_EVENT_COLUMNS.split(", ") {
            assert!(declares(PROCESSED_EVENTS_DDL, column), "events_processed lacks {}", column);
        }
    }

    #[test]
    fn test_replacing_engine_on_version() {
        for (table, ddl) in migrations() {
            assert!(ddl.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)));
            assert!(ddl.contains("ENGINE = ReplacingMergeTree(version)"));
            assert!(ddl.contains("PARTITION BY toYYYYMMDD(timestamp)"));
        }
    }
}
