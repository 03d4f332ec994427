//! Token data model: a citizen's claim on a position in a service queue

use crate::domain::types::{CitizenId, CounterId, PriorityClass, ServiceId, TokenId, TokenStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Audit event types recorded on a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEventType {
    Created,
    Rescheduled,
    Called,
    Transferred,
    Serving,
    Completed,
    NoShow,
    Cancelled,
}

impl TokenEventType {
    /// Audit event recorded when a token enters `status`
    pub fn for_status(status: TokenStatus) -> Self {
        match status {
            TokenStatus::Waiting => TokenEventType::Created,
            TokenStatus::Called => TokenEventType::Called,
            TokenStatus::Serving => TokenEventType::Serving,
            TokenStatus::Completed => TokenEventType::Completed,
            TokenStatus::NoShow => TokenEventType::NoShow,
            TokenStatus::Cancelled => TokenEventType::Cancelled,
        }
    }
}

/// A single entry in a token's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenEvent {
    pub t: TokenEventType,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TokenEvent {
    pub fn new(event_type: TokenEventType, at: DateTime<Utc>) -> Self {
        Self { t: event_type, at, detail: None }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Queue token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    /// `{PREFIX}-{seq}`, unique within the service forever
    pub label: String,
    /// Numeric label suffix; arrival order within the service
    pub seq: u64,
    pub citizen_id: CitizenId,
    pub service_id: ServiceId,
    pub counter_id: Option<CounterId>,
    pub priority: PriorityClass,
    pub status: TokenStatus,
    /// 1-based rank among WAITING tokens; `None` once the token leaves WAITING
    pub queue_position: Option<usize>,
    pub estimated_wait_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescheduled_from: Option<TokenId>,
    /// "timeout" or "staff:{id}"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_show_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub called_at: Option<DateTime<Utc>>,
    pub serving_at: Option<DateTime<Utc>>,
    /// Set on entry into any terminal state
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: SmallVec<[TokenEvent; 4]>,
}

impl Token {
    /// Create a WAITING token. Position is assigned by the scheduler.
    pub fn new(
        label: String,
        seq: u64,
        citizen_id: CitizenId,
        service_id: ServiceId,
        priority: PriorityClass,
        contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut history = SmallVec::new();
        history.push(
            TokenEvent::new(TokenEventType::Created, now).with_detail(format!(
                "priority={},weight={}",
                priority.as_str(),
                priority.weight()
            )),
        );
        Self {
            id: TokenId::new(),
            label,
            seq,
            citizen_id,
            service_id,
            counter_id: None,
            priority,
            status: TokenStatus::Waiting,
            queue_position: None,
            estimated_wait_minutes: 0,
            contact,
            rescheduled_from: None,
            no_show_reason: None,
            notes: None,
            created_at: now,
            called_at: None,
            serving_at: None,
            completed_at: None,
            history,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.priority.weight()
    }

    pub fn add_event(&mut self, event: TokenEvent) {
        self.history.push(event);
    }

    /// Minutes between creation and being called, if called
    pub fn wait_minutes(&self) -> Option<f64> {
        self.called_at
            .map(|called| (called - self.created_at).num_milliseconds().max(0) as f64 / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(now: DateTime<Utc>) -> Token {
        Token::new(
            "GEN-001".to_string(),
            1,
            "citizen-1".into(),
            "general".into(),
            PriorityClass::Senior,
            None,
            now,
        )
    }

    #[test]
    fn test_new_token_is_waiting_with_created_event() {
        let token = token(Utc::now());
        assert_eq!(token.status, TokenStatus::Waiting);
        assert!(token.is_active());
        assert_eq!(token.history.len(), 1);
        assert_eq!(token.history[0].t, TokenEventType::Created);
        assert_eq!(token.history[0].detail.as_deref(), Some("priority=senior,weight=50"));
    }

    #[test]
    fn test_wait_minutes() {
        let now = Utc::now();
        let mut token = token(now);
        assert_eq!(token.wait_minutes(), None);
        token.called_at = Some(now + Duration::seconds(90));
        assert_eq!(token.wait_minutes(), Some(1.5));
    }

    #[test]
    fn test_token_json_shape() {
        let token = token(Utc::now());
        let value = serde_json::to_value(&token).unwrap();
        assert_eq!(value["label"], "GEN-001");
        assert_eq!(value["status"], "WAITING");
        assert_eq!(value["priority"], "SENIOR");
        assert_eq!(value["history"][0]["t"], "created");
        assert!(value.get("contact").is_none());
    }
}
