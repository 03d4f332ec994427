//! Counter dispatch and the token state machine
//!
//! All functions here take `&mut ServiceQueue`, which the engine only hands
//! out while holding that service's lock. Every successful call returns a
//! [`Dispatch`] describing what changed, from which the engine renders
//! intents and records metrics.

use crate::domain::error::{QueueError, Result};
use crate::domain::token::Token;
use crate::domain::types::{CitizenId, Counter, CounterId, StaffId, TokenId, TokenStatus};
use crate::services::scheduler::{self, queue_order, Recompute};
use crate::services::token_store::{StatusOpts, TokenStore};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

/// State owned by one service: its tokens and the counters bound to it
pub struct ServiceQueue {
    pub store: TokenStore,
    pub counters: FxHashMap<CounterId, Counter>,
}

impl ServiceQueue {
    pub fn new(store: TokenStore) -> Self {
        Self { store, counters: FxHashMap::default() }
    }

    pub fn active_counters(&self) -> usize {
        self.counters.values().filter(|c| c.active).count()
    }

    fn counter(&self, id: &CounterId) -> Result<&Counter> {
        self.counters.get(id).ok_or_else(|| QueueError::CounterNotFound(id.clone()))
    }

    /// Token the counter is bound to, if that token is still non-terminal
    fn bound_token(&self, counter: &Counter) -> Option<TokenId> {
        counter
            .current_token
            .filter(|id| self.store.get(*id).map(|t| t.is_active()).unwrap_or(false))
    }

    /// Clear the token and staff binding on whichever counter holds `token`
    fn release(&mut self, token: TokenId) -> Option<CounterId> {
        let counter = self.counters.values_mut().find(|c| c.current_token == Some(token))?;
        counter.current_token = None;
        counter.staff_id = None;
        debug!(counter_id = %counter.id, token_id = %token, "counter_released");
        Some(counter.id.clone())
    }
}

/// Outcome of a successful dispatcher operation
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Token after the change
    pub token: Token,
    pub prev_status: TokenStatus,
    /// Counter the token is bound to after the change
    pub counter_label: Option<u32>,
    /// Counter whose binding was cleared by this change
    pub released: Option<CounterId>,
    pub recompute: Recompute,
}

/// Applies state-machine transitions and maintains counter bindings
#[derive(Debug, Clone)]
pub struct CounterDispatcher {
    nearly_up_position: usize,
}

impl CounterDispatcher {
    pub fn new(nearly_up_position: usize) -> Self {
        Self { nearly_up_position }
    }

    pub fn recompute(&self, queue: &mut ServiceQueue) -> Recompute {
        let counters = queue.active_counters();
        scheduler::recompute(&mut queue.store, counters, self.nearly_up_position)
    }

    fn finish(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        prev_status: TokenStatus,
        released: Option<CounterId>,
    ) -> Result<Dispatch> {
        let recompute = self.recompute(queue);
        let token = queue.store.get(token)?.clone();
        let counter_label = token
            .counter_id
            .as_ref()
            .and_then(|id| queue.counters.get(id))
            .map(|c| c.label);
        Ok(Dispatch { token, prev_status, counter_label, released, recompute })
    }

    /// Bind the highest-priority WAITING token to `counter_id`.
    ///
    /// Returns `Ok(None)` when the waiting set is empty.
    pub fn call_next(
        &self,
        queue: &mut ServiceQueue,
        counter_id: &CounterId,
        staff: &StaffId,
        now: DateTime<Utc>,
    ) -> Result<Option<Dispatch>> {
        let counter = queue.counter(counter_id)?;
        if !counter.active {
            return Err(QueueError::CounterInactive(counter_id.clone()));
        }
        if let Some(token) = queue.bound_token(counter) {
            return Err(QueueError::CounterBusy { counter: counter_id.clone(), token });
        }

        let Some(next) = queue.store.get_waiting().into_iter().min_by(|a, b| queue_order(a, b)).map(|t| t.id)
        else {
            debug!(counter_id = %counter_id, "call_next_empty");
            return Ok(None);
        };

        queue.store.set_status(next, TokenStatus::Called, StatusOpts::counter(counter_id.clone()), now)?;
        if let Some(counter) = queue.counters.get_mut(counter_id) {
            counter.current_token = Some(next);
            counter.staff_id = Some(staff.clone());
        }

        info!(
            token_id = %next,
            counter_id = %counter_id,
            staff_id = %staff,
            "token_called"
        );
        self.finish(queue, next, TokenStatus::Waiting, None).map(Some)
    }

    /// CALLED -> SERVING
    pub fn mark_serving(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Dispatch> {
        queue.store.set_status(token, TokenStatus::Serving, StatusOpts::default().with_notes(notes), now)?;
        self.finish(queue, token, TokenStatus::Called, None)
    }

    /// SERVING -> COMPLETED, releasing the counter
    pub fn complete(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Dispatch> {
        queue.store.set_status(token, TokenStatus::Completed, StatusOpts::default().with_notes(notes), now)?;
        let released = queue.release(token);
        self.finish(queue, token, TokenStatus::Serving, released)
    }

    /// CALLED -> NO_SHOW, releasing the counter
    pub fn mark_no_show(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        reason: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Dispatch> {
        let opts = StatusOpts::default().with_notes(notes).with_reason(reason);
        queue.store.set_status(token, TokenStatus::NoShow, opts, now)?;
        let released = queue.release(token);
        self.finish(queue, token, TokenStatus::Called, released)
    }

    /// WAITING -> CANCELLED, citizen-initiated
    pub fn cancel(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        citizen: &CitizenId,
        now: DateTime<Utc>,
    ) -> Result<Dispatch> {
        let current = queue.store.get(token)?;
        if &current.citizen_id != citizen {
            return Err(QueueError::NotOwner(token));
        }
        if current.status.is_terminal() {
            return Err(QueueError::AlreadyFinal { token, status: current.status });
        }
        queue.store.set_status(token, TokenStatus::Cancelled, StatusOpts::default().with_reason("citizen"), now)?;
        self.finish(queue, token, TokenStatus::Waiting, None)
    }

    /// Move a CALLED token to another counter of the same service
    pub fn transfer(
        &self,
        queue: &mut ServiceQueue,
        token: TokenId,
        new_counter: &CounterId,
        staff: &StaffId,
        now: DateTime<Utc>,
    ) -> Result<Dispatch> {
        let current = queue.store.get(token)?;
        let from = current.counter_id.clone();
        if current.status != TokenStatus::Called || from.as_ref() == Some(new_counter) {
            return Err(QueueError::InvalidTransition {
                token,
                from: current.status,
                to: TokenStatus::Called,
            });
        }

        let target = queue.counter(new_counter)?;
        if !target.active {
            return Err(QueueError::CounterInactive(new_counter.clone()));
        }
        if let Some(bound) = queue.bound_token(target) {
            return Err(QueueError::CounterBusy { counter: new_counter.clone(), token: bound });
        }

        queue.store.set_counter(token, new_counter.clone(), now)?;
        let released = queue.release(token);
        if let Some(counter) = queue.counters.get_mut(new_counter) {
            counter.current_token = Some(token);
            counter.staff_id = Some(staff.clone());
        }

        info!(
            token_id = %token,
            from = ?from,
            to = %new_counter,
            staff_id = %staff,
            "token_transferred"
        );
        self.finish(queue, token, TokenStatus::Called, released)
    }
}
