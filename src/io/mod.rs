//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `intent_channel` - Typed channel for outbound notification intents
//! - `intent_log` - Intent output to file (JSONL format)
//! - `estimator` - HTTP client for the wait-time prediction service
//! - `snapshot` - Engine state persistence (JSON)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod estimator;
pub mod intent_channel;
pub mod intent_log;
pub mod prometheus;
pub mod snapshot;

// Re-export commonly used types
pub use estimator::HttpWaitTimeEstimator;
pub use intent_channel::{create_intent_channel, IntentKind, IntentSender, NotificationIntent};
pub use intent_log::IntentLogWriter;
pub use snapshot::EngineSnapshot;
