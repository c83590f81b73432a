//! ClickHouse backend
//!
//! - `store`: client handle, binding and phase-aware error mapping
//! - `schema`: table DDL and migration
//! - `rows`: RowBinary row shapes
//! - `raw_event`, `processed_event`, `usage`: the repository implementations

pub mod processed_event;
pub mod raw_event;
pub mod rows;
pub mod schema;
mod store;
pub mod usage;

pub use store::ClickHouseStore;
