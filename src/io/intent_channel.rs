//! Typed channel for outbound notification intents
//!
//! The engine decides *that* and *what* to notify; delivery belongs to an
//! external notifier reading the other end of this channel. Sends never
//! block the engine: when the channel is full the intent is dropped and
//! counted.

use crate::domain::types::{CitizenId, ServiceId, TokenId};
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// What happened to the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Created,
    PriorityDecided,
    NearlyUpToTurn,
    Called,
    Serving,
    Completed,
    NoShow,
    Cancelled,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Created => "created",
            IntentKind::PriorityDecided => "priority_decided",
            IntentKind::NearlyUpToTurn => "nearly_up_to_turn",
            IntentKind::Called => "called",
            IntentKind::Serving => "serving",
            IntentKind::Completed => "completed",
            IntentKind::NoShow => "no_show",
            IntentKind::Cancelled => "cancelled",
        }
    }
}

/// Delivery urgency hint for the external notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPriority {
    High,
    Normal,
    Low,
}

/// Human-facing content plus the token facts it was rendered from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPayload {
    pub title: String,
    pub body: String,
    pub priority: NotifyPriority,
    pub label: String,
    pub service_id: ServiceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Counter label (CALLED)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_minutes: Option<u32>,
    /// Opaque contact info captured at join
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// `{user_id, token_id, kind, payload}` handed to the external notifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationIntent {
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    pub ts: DateTime<Utc>,
    pub user_id: CitizenId,
    pub token_id: TokenId,
    pub kind: IntentKind,
    pub payload: IntentPayload,
}

/// Sender handle for notification intents
///
/// Clone this to share across multiple producers.
#[derive(Clone)]
pub struct IntentSender {
    tx: mpsc::Sender<NotificationIntent>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl IntentSender {
    pub fn new(tx: mpsc::Sender<NotificationIntent>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    /// Send an intent, injecting the site id. Returns false if dropped.
    pub fn send(&self, mut intent: NotificationIntent) -> bool {
        intent.site = Some(self.site_id.clone());
        match self.tx.try_send(intent) {
            Ok(()) => {
                self.metrics.record_intent_sent();
                true
            }
            Err(TrySendError::Full(intent)) => {
                self.metrics.record_intent_dropped();
                warn!(
                    token_id = %intent.token_id,
                    kind = %intent.kind.as_str(),
                    "intent_dropped_channel_full"
                );
                false
            }
            Err(TrySendError::Closed(intent)) => {
                self.metrics.record_intent_dropped();
                warn!(
                    token_id = %intent.token_id,
                    kind = %intent.kind.as_str(),
                    "intent_dropped_channel_closed"
                );
                false
            }
        }
    }
}

/// Create a new intent channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
pub fn create_intent_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (IntentSender, mpsc::Receiver<NotificationIntent>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (IntentSender::new(tx, site_id, metrics), rx)
}
