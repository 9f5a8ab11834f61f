//! Concrete agents.
//!
//! Lead Scoring, Property Watcher and Campaign Optimizer follow the same
//! shape as [`MarketMonitorAgent`]: a struct implementing
//! [`Agent`](crate::runtime::Agent) with its own state behind a mutex.

pub mod market_monitor;

pub use market_monitor::{MARKET_MONITOR_NAME, MarketMonitorAgent};
