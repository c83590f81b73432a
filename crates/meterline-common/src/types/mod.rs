//! Core data types for the Meterline engine

pub mod aggregation;
pub mod filter_group;
pub mod processed_event;
pub mod raw_event;
pub mod usage;
