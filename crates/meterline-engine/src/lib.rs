//! # Meterline Engine
//!
//! Usage metering and aggregation over ClickHouse.
//!
//! ## Pipeline
//!
//! ```text
//! subscription -> IngestConsumer -> raw_events
//!                                       |
//!              UsageProcessor <- unprocessed discovery (keyset, two-step)
//!                    |
//!              events_processed -> get_usage / get_usage_with_filters
//! ```
//!
//! Quantities come from per-meter formulas evaluated over event properties.
//! Usage reads aggregate processed events, optionally bucketed by window or
//! split across prioritized filter groups where each event counts toward its
//! single best-matching group.

pub mod config;
pub mod expression;
pub mod ingest;
pub mod metrics;
pub mod processor;
pub mod query;
pub mod repository;

pub use config::{ClickHouseSettings, EngineConfig, NatsSettings, ProcessingSettings};
pub use expression::{ExpressionEvaluator, QuantityEvaluator};
pub use ingest::{ChannelSubscription, IngestConsumer, IngestEvent, NatsSubscription, Subscription};
pub use metrics::EngineMetrics;
pub use processor::{MeterBinding, ProcessingSummary, UsageProcessor};
pub use query::{aggregator_for, best_match, Aggregator, BuiltQuery, QueryBuilder};
pub use repository::{
    ClickHouseStore, InMemoryEventStore, ProcessedEventRepository, RawEventRepository,
    UsageRepository,
};
