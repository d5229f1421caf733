//! Production line monitor: fuses IO-Link bus samples and polled analyzer
//! readings, tracks production cycles and changeovers from impulse events,
//! and publishes OEE, flow, measurement and meter snapshots.

pub mod aggregate;
pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod conversion;
pub mod cycle;
pub mod error;
pub mod fusion;
pub mod ingest;
pub mod mqtt;
pub mod publisher;
pub mod snapshot;
pub mod stats;
pub mod storage;

pub use error::{EngineError, EngineResult};
pub use ingest::LineEngine;
