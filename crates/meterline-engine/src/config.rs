//! Engine configuration

use meterline_common::{MeteringError, Result, DEFAULT_DISCOVERY_BATCH_SIZE, DEFAULT_WRITE_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Engine service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// ClickHouse connection
    pub clickhouse: ClickHouseSettings,
    /// NATS JetStream ingestion
    pub nats: NatsSettings,
    /// Discovery and processing
    pub processing: ProcessingSettings,
}

impl EngineConfig {
    /// Defaults, overridden by `METERLINE_*` variables (a `.env` file is read first)
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Env { lookup };

        // ClickHouse
        env.string("METERLINE_CLICKHOUSE_URL", &mut cfg.clickhouse.url);
        env.string("METERLINE_CLICKHOUSE_DATABASE", &mut cfg.clickhouse.database);
        env.string("METERLINE_CLICKHOUSE_USER", &mut cfg.clickhouse.user);
        env.string("METERLINE_CLICKHOUSE_PASSWORD", &mut cfg.clickhouse.password);
        env.parse("METERLINE_CLICKHOUSE_WRITE_CHUNK_SIZE", &mut cfg.clickhouse.write_chunk_size)?;
        env.parse("METERLINE_CLICKHOUSE_QUERY_TIMEOUT_MS", &mut cfg.clickhouse.query_timeout_ms)?;

        // NATS
        env.string("METERLINE_NATS_URL", &mut cfg.nats.url);
        env.string("METERLINE_NATS_STREAM", &mut cfg.nats.stream);
        env.string("METERLINE_NATS_SUBJECT", &mut cfg.nats.subject);
        env.string("METERLINE_NATS_DURABLE_NAME", &mut cfg.nats.durable_name);
        env.parse("METERLINE_INGEST_WORKERS", &mut cfg.nats.workers)?;

        // Processing
        env.parse("METERLINE_DISCOVERY_BATCH_SIZE", &mut cfg.processing.discovery_batch_size)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clickhouse.url.is_empty() {
            return Err(MeteringError::Config("clickhouse url is required".into()));
        }
        if self.clickhouse.write_chunk_size == 0 {
            return Err(MeteringError::Config("write_chunk_size must be positive".into()));
        }
        if self.nats.workers == 0 {
            return Err(MeteringError::Config("at least one ingest worker is required".into()));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = (self.lookup)(key) {
            *target = value;
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) -> Result<()> {
        if let Some(value) = (self.lookup)(key) {
            *target = value
                .parse()
                .map_err(|_| MeteringError::Config(format!("{} has an invalid value: {}", key, value)))?;
        }
        Ok(())
    }
}

/// ClickHouse connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseSettings {
    /// HTTP endpoint
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Rows per insert round trip
    pub write_chunk_size: usize,
    /// Deadline applied to every query without a tighter one
    pub query_timeout_ms: u64,
}

impl ClickHouseSettings {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "meterline".to_string(),
            user: "default".to_string(),
            password: String::new(),
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
            query_timeout_ms: 30_000,
        }
    }
}

/// JetStream consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    pub stream: String,
    /// Subject filter for raw usage events
    pub subject: String,
    pub durable_name: String,
    /// Concurrent ingestion workers
    pub workers: usize,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            stream: "EVENTS".to_string(),
            subject: "events.raw".to_string(),
            durable_name: "meterline-ingest".to_string(),
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingSettings {
    /// Step A page size
    pub discovery_batch_size: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            discovery_batch_size: DEFAULT_DISCOVERY_BATCH_SIZE,
        }
    }
}
