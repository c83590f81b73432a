//! Usage query generation
//!
//! - `fragment`: named SQL fragments carrying their own arguments
//! - `builder`: best-match filter-group query
//! - `aggregator`: per-type scalar and windowed queries
//! - `best_match`: the filter-group rule as a pure function

pub mod aggregator;
pub mod best_match;
pub mod builder;
pub mod fragment;

pub use aggregator::{aggregator_for, Aggregator};
pub use best_match::best_match;
pub use builder::QueryBuilder;
pub use fragment::{BuiltQuery, QueryFragment, SqlArg};

/// Raw ingested events
pub const RAW_EVENTS_TABLE: &str = "raw_events";

/// Events with computed quantity and cost
pub const PROCESSED_EVENTS_TABLE: &str = "events_processed";
