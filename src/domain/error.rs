//! Engine error taxonomy
//!
//! Every variant is raised before any state is written, so a failed
//! operation never leaves a partial mutation behind.

use crate::domain::types::{CounterId, ServiceId, TokenId, TokenStatus};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Broad class of a [`QueueError`], used by transports to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input (inactive service/counter); safe to retry once fixed
    Validation,
    /// Conflicts with current state; inspect state before retrying
    Conflict,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueueError {
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(ServiceId),

    #[error("counter not found: {0}")]
    CounterNotFound(CounterId),

    #[error("counter inactive: {0}")]
    CounterInactive(CounterId),

    /// Counter still holds a token that has not reached a terminal state.
    #[error("counter {counter} is still bound to token {token}")]
    CounterBusy { counter: CounterId, token: TokenId },

    #[error("token not found: {0}")]
    TokenNotFound(TokenId),

    #[error("citizen already holds active token {existing} for service {service}")]
    DuplicateActiveToken { service: ServiceId, existing: TokenId },

    #[error("invalid transition {from} -> {to} for token {token}")]
    InvalidTransition { token: TokenId, from: TokenStatus, to: TokenStatus },

    #[error("token {0} is not owned by the requesting citizen")]
    NotOwner(TokenId),

    #[error("token {token} is already final ({status})")]
    AlreadyFinal { token: TokenId, status: TokenStatus },
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::ServiceUnavailable(_) | QueueError::CounterInactive(_) => {
                ErrorKind::Validation
            }
            QueueError::CounterBusy { .. }
            | QueueError::DuplicateActiveToken { .. }
            | QueueError::InvalidTransition { .. }
            | QueueError::NotOwner(_)
            | QueueError::AlreadyFinal { .. } => ErrorKind::Conflict,
            QueueError::ServiceNotFound(_)
            | QueueError::CounterNotFound(_)
            | QueueError::TokenNotFound(_) => ErrorKind::NotFound,
        }
    }
}
