//! Translates engine transitions into notification intents
//!
//! Rendering is pure so the engine can build intents while it holds a
//! service lock and publish them after releasing it.

use crate::domain::token::Token;
use crate::domain::types::{PriorityClass, TokenStatus};
use crate::io::intent_channel::{
    IntentKind, IntentPayload, IntentSender, NotificationIntent, NotifyPriority,
};
use chrono::Utc;
use tracing::debug;

pub struct EventNotifier {
    sender: Option<IntentSender>,
}

impl EventNotifier {
    pub fn new(sender: Option<IntentSender>) -> Self {
        Self { sender }
    }

    /// Send rendered intents. No-op when no sender is configured.
    pub fn publish(&self, intents: Vec<NotificationIntent>) {
        let Some(ref sender) = self.sender else {
            return;
        };
        for intent in intents {
            debug!(token_id = %intent.token_id, kind = %intent.kind.as_str(), "intent_published");
            sender.send(intent);
        }
    }

    /// Intents for a freshly created token
    pub fn on_created(token: &Token) -> Vec<NotificationIntent> {
        let position = token.queue_position.unwrap_or(0);
        let mut intents = vec![intent(
            token,
            IntentKind::Created,
            format!("Token {} issued", token.label),
            format!(
                "You are number {} in line. Estimated wait: {} min.",
                position, token.estimated_wait_minutes
            ),
            NotifyPriority::Normal,
            None,
        )];
        if token.priority != PriorityClass::Normal {
            intents.push(intent(
                token,
                IntentKind::PriorityDecided,
                "Priority confirmed".to_string(),
                format!("{} is queued with {} priority.", token.label, token.priority.as_str()),
                NotifyPriority::Normal,
                None,
            ));
        }
        intents
    }

    /// Intent for a token that just entered its current status
    pub fn on_status(token: &Token, counter_label: Option<u32>) -> Option<NotificationIntent> {
        let label = &token.label;
        let rendered = match token.status {
            TokenStatus::Waiting => return None,
            TokenStatus::Called => (
                IntentKind::Called,
                format!("Your turn: {label}"),
                called_body(counter_label),
                NotifyPriority::High,
            ),
            TokenStatus::Serving => (
                IntentKind::Serving,
                format!("Now serving {label}"),
                "Your service has started.".to_string(),
                NotifyPriority::Low,
            ),
            TokenStatus::Completed => (
                IntentKind::Completed,
                "Service completed".to_string(),
                format!("Thank you. {label} is complete."),
                NotifyPriority::Low,
            ),
            TokenStatus::NoShow => (
                IntentKind::NoShow,
                "Missed your turn".to_string(),
                format!("{label} was not answered in time and has been closed."),
                NotifyPriority::Normal,
            ),
            TokenStatus::Cancelled => (
                IntentKind::Cancelled,
                "Token cancelled".to_string(),
                format!("{label} has been cancelled."),
                NotifyPriority::Low,
            ),
        };
        let (kind, title, body, priority) = rendered;
        Some(intent(token, kind, title, body, priority, counter_label))
    }

    /// A CALLED token was sent to a different counter
    pub fn on_transfer(token: &Token, counter_label: Option<u32>) -> NotificationIntent {
        intent(
            token,
            IntentKind::Called,
            format!("Counter changed for {}", token.label),
            called_body(counter_label),
            NotifyPriority::High,
            counter_label,
        )
    }

    pub fn on_nearly_up(token: &Token) -> NotificationIntent {
        intent(
            token,
            IntentKind::NearlyUpToTurn,
            "Almost your turn".to_string(),
            format!(
                "{} is number {} in line. Please stay nearby.",
                token.label,
                token.queue_position.unwrap_or(0)
            ),
            NotifyPriority::High,
            None,
        )
    }
}

fn called_body(counter_label: Option<u32>) -> String {
    match counter_label {
        Some(n) => format!("Please proceed to counter {n}."),
        None => "Please proceed to the service desk.".to_string(),
    }
}

fn intent(
    token: &Token,
    kind: IntentKind,
    title: String,
    body: String,
    priority: NotifyPriority,
    counter: Option<u32>,
) -> NotificationIntent {
    let waiting = token.status == TokenStatus::Waiting;
    NotificationIntent {
        site: None,
        ts: Utc::now(),
        user_id: token.citizen_id.clone(),
        token_id: token.id,
        kind,
        payload: IntentPayload {
            title,
            body,
            priority,
            label: token.label.clone(),
            service_id: token.service_id.clone(),
            position: token.queue_position,
            counter,
            estimated_wait_minutes: waiting.then_some(token.estimated_wait_minutes),
            contact: token.contact.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::CitizenId;

    fn token(priority: PriorityClass) -> Token {
        let mut token = Token::new(
            "LIC-007".into(),
            7,
            "citizen-9".into(),
            "licensing".into(),
            priority,
            Some("+3545550000".into()),
            Utc::now(),
        );
        token.queue_position = Some(2);
        token.estimated_wait_minutes = 8;
        token
    }

    #[test]
    fn test_created_normal_has_single_intent() {
        let intents = EventNotifier::on_created(&token(PriorityClass::Normal));
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::Created);
        assert_eq!(intents[0].payload.body, "You are number 2 in line. Estimated wait: 8 min.");
        assert_eq!(intents[0].payload.contact.as_deref(), Some("+3545550000"));
    }

    #[test]
    fn test_created_priority_emits_priority_decided() {
        let intents = EventNotifier::on_created(&token(PriorityClass::Disabled));
        let kinds: Vec<IntentKind> = intents.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![IntentKind::Created, IntentKind::PriorityDecided]);
        assert!(intents[1].payload.body.contains("disabled"));
    }

    #[test]
    fn test_called_intent_carries_counter() {
        let mut t = token(PriorityClass::Normal);
        t.status = TokenStatus::Called;
        t.queue_position = None;
        let intent = EventNotifier::on_status(&t, Some(3)).unwrap();
        assert_eq!(intent.kind, IntentKind::Called);
        assert_eq!(intent.payload.priority, NotifyPriority::High);
        assert_eq!(intent.payload.counter, Some(3));
        assert_eq!(intent.payload.body, "Please proceed to counter 3.");
        assert_eq!(intent.payload.estimated_wait_minutes, None);
    }

    #[test]
    fn test_waiting_status_has_no_intent() {
        assert!(EventNotifier::on_status(&token(PriorityClass::Normal), None).is_none());
    }

    #[test]
    fn test_nearly_up_mentions_position() {
        let intent = EventNotifier::on_nearly_up(&token(PriorityClass::Senior));
        assert_eq!(intent.kind, IntentKind::NearlyUpToTurn);
        assert_eq!(intent.user_id, CitizenId::from("citizen-9"));
        assert!(intent.payload.body.starts_with("LIC-007 is number 2"));
    }
}
