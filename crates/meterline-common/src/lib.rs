//! # Meterline Common
//!
//! Shared types, errors, and request context for the Meterline usage engine.
//!
//! ## Core Types
//!
//! - [`RawEvent`]: immutable ingested usage fact
//! - [`ProcessedEvent`]: per-event computed quantity and cost
//! - [`FilterGroup`]: prioritized property predicate selecting a pricing tier
//! - [`UsageParams`]/[`AggregationResult`]: usage query and answer
//! - [`KeysetCursor`]: (timestamp, id) resume token for discovery
//!
//! ## Context
//!
//! - [`RequestContext`]: tenant scope, deadline, and cancellation

pub mod context;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use context::RequestContext;
pub use error::{DatabaseError, ExpressionError, MeteringError, Result};
pub use types::{
    aggregation::{AggregationType, WindowSize},
    filter_group::FilterGroup,
    processed_event::{EventStatus, ProcessedEvent},
    raw_event::{generate_event_id, RawEvent, SIGN_DELETE, SIGN_INSERT},
    usage::{
        validate_filters, AggregationResult, FeatureUsageTotal, FilterGroupUsage,
        FindRawEventsParams, GetProcessedEventsParams, KeysetCursor, UsageParams,
        UsageSummaryParams, UsageWindow, UsageWithFiltersParams, DEFAULT_DISCOVERY_BATCH_SIZE,
    },
};

/// Meterline version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Rows per insert round trip
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 100;

/// Prefix of generated event ids
pub const EVENT_ID_PREFIX: &str = "event_";
