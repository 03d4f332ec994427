//! Token records and per-service label sequence
//!
//! One `TokenStore` exists per service and is only reachable through that
//! service's lock, so the label sequence is serialized structurally: two
//! joins for the same service can never observe the same `last_seq`.

use crate::domain::error::{QueueError, Result};
use crate::domain::token::{Token, TokenEvent, TokenEventType};
use crate::domain::types::{CitizenId, CounterId, PriorityClass, Service, TokenId, TokenStatus};
use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, info};

/// Optional fields written alongside a status change
#[derive(Debug, Clone, Default)]
pub struct StatusOpts {
    /// Counter to bind (CALLED)
    pub counter: Option<CounterId>,
    pub notes: Option<String>,
    /// Free-text reason recorded in the audit trail
    pub reason: Option<String>,
}

impl StatusOpts {
    pub fn counter(counter: CounterId) -> Self {
        Self { counter: Some(counter), ..Default::default() }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Token records for a single service
pub struct TokenStore {
    service: Service,
    tokens: FxHashMap<TokenId, Token>,
    /// Highest label suffix ever issued for this service
    last_seq: u64,
    /// Non-terminal tokens per citizen (more than one only via reschedule)
    active_by_citizen: FxHashMap<CitizenId, SmallVec<[TokenId; 1]>>,
    /// Originals that already produced a rescheduled token
    rescheduled: FxHashSet<TokenId>,
}

impl TokenStore {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            tokens: FxHashMap::default(),
            last_seq: 0,
            active_by_citizen: FxHashMap::default(),
            rescheduled: FxHashSet::default(),
        }
    }

    /// Rebuild a store from persisted tokens. The label sequence resumes at
    /// the highest persisted suffix.
    pub fn restore(service: Service, tokens: impl IntoIterator<Item = Token>) -> Self {
        let mut store = Self::new(service);
        for token in tokens {
            store.last_seq = store.last_seq.max(token.seq);
            if token.is_active() {
                store
                    .active_by_citizen
                    .entry(token.citizen_id.clone())
                    .or_default()
                    .push(token.id);
            }
            if let Some(original) = token.rescheduled_from {
                store.rescheduled.insert(original);
            }
            store.tokens.insert(token.id, token);
        }
        info!(
            service_id = %store.service.id,
            tokens = %store.tokens.len(),
            last_seq = %store.last_seq,
            "token_store_restored"
        );
        store
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut Service {
        &mut self.service
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Create a WAITING token for `citizen`.
    ///
    /// Fails with `ServiceUnavailable` if the service is inactive and with
    /// `DuplicateActiveToken` if the citizen already holds a non-terminal
    /// token here. Nothing is written on failure.
    pub fn create_token(
        &mut self,
        citizen: CitizenId,
        priority: PriorityClass,
        contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&Token> {
        self.check_available()?;
        if let Some(existing) = self.active_token_for(&citizen) {
            return Err(QueueError::DuplicateActiveToken {
                service: self.service.id.clone(),
                existing,
            });
        }
        let token = self.issue(citizen, priority, contact, now);
        Ok(self.insert(token))
    }

    /// Re-insert a NO_SHOW token as a fresh WAITING token with the same
    /// citizen and priority. Bypasses the duplicate-active guard, once per
    /// original.
    pub fn create_rescheduled(
        &mut self,
        original: TokenId,
        citizen: &CitizenId,
        now: DateTime<Utc>,
    ) -> Result<&Token> {
        self.check_available()?;
        let source = self.get(original)?;
        if &source.citizen_id != citizen {
            return Err(QueueError::NotOwner(original));
        }
        if source.status != TokenStatus::NoShow || self.rescheduled.contains(&original) {
            return Err(QueueError::InvalidTransition {
                token: original,
                from: source.status,
                to: TokenStatus::Waiting,
            });
        }
        let (citizen, priority, contact) =
            (source.citizen_id.clone(), source.priority, source.contact.clone());

        let mut token = self.issue(citizen, priority, contact, now);
        token.rescheduled_from = Some(original);
        token.add_event(
            TokenEvent::new(TokenEventType::Rescheduled, now).with_detail(format!("from={original}")),
        );
        self.rescheduled.insert(original);
        Ok(self.insert(token))
    }

    fn check_available(&self) -> Result<()> {
        if self.service.active {
            Ok(())
        } else {
            Err(QueueError::ServiceUnavailable(self.service.id.clone()))
        }
    }

    fn issue(
        &mut self,
        citizen: CitizenId,
        priority: PriorityClass,
        contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Token {
        self.last_seq += 1;
        let seq = self.last_seq;
        let label = format!("{}-{:03}", self.service.label_prefix(), seq);
        Token::new(label, seq, citizen, self.service.id.clone(), priority, contact, now)
    }

    fn insert(&mut self, token: Token) -> &Token {
        let id = token.id;
        debug!(
            token_id = %id,
            label = %token.label,
            citizen_id = %token.citizen_id,
            priority = %token.priority.as_str(),
            "token_stored"
        );
        self.active_by_citizen.entry(token.citizen_id.clone()).or_default().push(id);
        self.tokens.entry(id).or_insert(token)
    }

    /// Apply a state-machine transition. Validates before writing.
    pub fn set_status(
        &mut self,
        id: TokenId,
        next: TokenStatus,
        opts: StatusOpts,
        now: DateTime<Utc>,
    ) -> Result<&Token> {
        let token = self.tokens.get_mut(&id).ok_or(QueueError::TokenNotFound(id))?;
        if !token.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition { token: id, from: token.status, to: next });
        }

        let prev = token.status;
        token.status = next;
        token.queue_position = None;
        match next {
            TokenStatus::Called => {
                token.called_at = Some(now);
                token.counter_id = opts.counter.clone();
            }
            TokenStatus::Serving => token.serving_at = Some(now),
            TokenStatus::NoShow => {
                token.completed_at = Some(now);
                token.no_show_reason = opts.reason.clone();
            }
            TokenStatus::Completed | TokenStatus::Cancelled => token.completed_at = Some(now),
            TokenStatus::Waiting => {}
        }
        if opts.notes.is_some() {
            token.notes = opts.notes;
        }

        let mut event = TokenEvent::new(TokenEventType::for_status(next), now);
        let detail = match (&opts.counter, &opts.reason) {
            (Some(counter), Some(reason)) => Some(format!("counter={counter},reason={reason}")),
            (Some(counter), None) => Some(format!("counter={counter}")),
            (None, Some(reason)) => Some(format!("reason={reason}")),
            (None, None) => None,
        };
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        token.add_event(event);

        debug!(
            token_id = %id,
            label = %token.label,
            from = %prev,
            to = %next,
            "token_status_changed"
        );

        if next.is_terminal() {
            let citizen = token.citizen_id.clone();
            self.release_citizen(&citizen, id);
        }
        self.get(id)
    }

    /// Move a CALLED token's counter binding
    pub fn set_counter(&mut self, id: TokenId, counter: CounterId, now: DateTime<Utc>) -> Result<&Token> {
        let token = self.tokens.get_mut(&id).ok_or(QueueError::TokenNotFound(id))?;
        if token.status != TokenStatus::Called {
            return Err(QueueError::InvalidTransition {
                token: id,
                from: token.status,
                to: TokenStatus::Called,
            });
        }
        let from = token.counter_id.replace(counter.clone());
        let detail = match from {
            Some(from) => format!("from={from},to={counter}"),
            None => format!("to={counter}"),
        };
        token.add_event(TokenEvent::new(TokenEventType::Transferred, now).with_detail(detail));
        Ok(&*token)
    }

    /// Write a recomputed position and estimate. Only WAITING tokens carry one.
    pub(crate) fn set_position(&mut self, id: TokenId, position: usize, estimated_wait_minutes: u32) {
        if let Some(token) = self.tokens.get_mut(&id) {
            if token.status == TokenStatus::Waiting {
                token.queue_position = Some(position);
                token.estimated_wait_minutes = estimated_wait_minutes;
            }
        }
    }

    fn release_citizen(&mut self, citizen: &CitizenId, id: TokenId) {
        if let Some(active) = self.active_by_citizen.get_mut(citizen) {
            active.retain(|t| *t != id);
            if active.is_empty() {
                self.active_by_citizen.remove(citizen);
            }
        }
    }

    pub fn get(&self, id: TokenId) -> Result<&Token> {
        self.tokens.get(&id).ok_or(QueueError::TokenNotFound(id))
    }

    /// First non-terminal token the citizen holds for this service
    pub fn active_token_for(&self, citizen: &CitizenId) -> Option<TokenId> {
        self.active_by_citizen.get(citizen).and_then(|ids| ids.first().copied())
    }

    /// WAITING tokens in no particular order
    pub fn get_waiting(&self) -> Vec<&Token> {
        self.tokens.values().filter(|t| t.status == TokenStatus::Waiting).collect()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }
}
