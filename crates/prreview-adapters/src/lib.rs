//! Runtime adapters for prreview (config, persistence, diff ingestion, job transport).

pub mod config;
pub mod diff;
pub mod queue;
pub mod store;
