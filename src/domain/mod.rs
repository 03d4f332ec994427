//! Domain models - core queue types
//!
//! This module contains the canonical data types used throughout the engine:
//! - `Token` - a citizen's claim on a position in a service queue
//! - `TokenEvent` - audit trail entries recorded on a token
//! - `Service`, `Counter` - reference data the engine schedules against
//! - `QueueError` - the engine's error taxonomy

pub mod error;
pub mod token;
pub mod types;

pub use error::{ErrorKind, QueueError};
pub use token::{Token, TokenEvent, TokenEventType};
pub use types::{
    CitizenId, Counter, CounterId, PriorityClass, Service, ServiceId, StaffId, TokenId,
    TokenStatus,
};
