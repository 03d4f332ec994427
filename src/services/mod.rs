//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `token_store` - Token records and per-service label sequence
//! - `scheduler` - Queue ordering, positions and wait estimates
//! - `dispatcher` - Counter binding and the token state machine
//! - `no_show` - Deadlines for unanswered calls
//! - `notifier` - Notification intent rendering
//! - `stats` - Live counts and the pluggable wait-time estimator
//! - `engine` - Facade serializing operations per service

pub mod dispatcher;
pub mod engine;
pub mod no_show;
pub mod notifier;
pub mod scheduler;
pub mod stats;
pub mod token_store;

// Re-export commonly used types
pub use engine::{LiveCounts, QueueEngine};
pub use stats::{StatsSnapshot, WaitTimeEstimator};
