//! OKX Feed Client Library
//!
//! A minimal reconnecting WebSocket client for the OKX public market-data feed.
//! It subscribes to a single channel, logs every payload unparsed, and reports
//! per-interval latency and payload-size statistics.
//!
//! # Modules
//!
//! - `config`: Static endpoint/subscription defaults with optional properties-file overrides
//! - `protocol`: Subscribe frame construction
//! - `stats`: Constant-memory interval statistics (min/max/avg/count, latency percentiles)
//! - `manager`: Connection lifecycle state machine with retry backoff
//! - `client`: Event loop, timers and WebSocket transport driving the manager

pub mod config;
pub mod protocol;
pub mod stats;
pub mod manager;
pub mod client;

// Re-export main types for convenience
pub use config::Config;
pub use client::{ClientError, ConnectionStatus, FeedClient};
pub use manager::{Action, ConnectionManager, ConnectionState, Event, RetryPolicy, TimerKind};
pub use stats::StatsAggregator;
