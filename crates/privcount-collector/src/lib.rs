//! PrivCount Data Collector.
//!
//! Connects to one event source, maintains a `SecureCounters` instance,
//! increments bins on events, and at round end emits its blinded, noisy
//! counts plus the encrypted blinding shares sent to each share keeper at
//! round start.

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod error;

pub use aggregator::Aggregator;
pub use collector::DataCollector;
pub use config::DataCollectorConfig;
pub use error::{Error, Result};
