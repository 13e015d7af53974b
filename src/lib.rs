//! tickfeed library
//!
//! Exposes the ingestion modules for use by the binary and tests.

pub mod coalesce;
pub mod config;
pub mod live;
pub mod models;
pub mod pipeline;
pub mod replay;
pub mod sink;
pub mod storage;
