//! Citizen and staff operations
//!
//! Every operation follows the same shape: resolve the service queue through
//! an index, mutate it under its lock, render intents, unlock, then update
//! deadlines, metrics and the notifier.

use super::QueueEngine;
use crate::domain::error::{QueueError, Result};
use crate::domain::token::Token;
use crate::domain::types::{
    CitizenId, CounterId, PriorityClass, ServiceId, StaffId, TokenId, TokenStatus,
};
use crate::io::intent_channel::NotificationIntent;
use crate::services::dispatcher::{CounterDispatcher, Dispatch, ServiceQueue};
use crate::services::no_show;
use crate::services::notifier::EventNotifier;
use crate::services::stats::{StatsSnapshot, WaitEstimateRequest};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};

impl QueueEngine {
    /// Issue a WAITING token for `citizen` in `service`.
    pub async fn join(
        &self,
        citizen: CitizenId,
        service: &ServiceId,
        priority: PriorityClass,
        contact: Option<String>,
    ) -> Result<Token> {
        let queue = self.queue(service)?;
        let (token, request, nearly_up) = {
            let mut q = queue.lock();
            let id = q.store.create_token(citizen, priority, contact, Utc::now())?.id;
            // Indexed before unlock; call-next can hand the token out immediately
            self.token_index.write().insert(id, service.clone());
            let recompute = self.dispatcher.recompute(&mut q);
            let token = q.store.get(id)?.clone();
            let nearly_up = self.render_nearly_up(&recompute.nearly_up, &q);
            let request = estimate_request(&token, &q);
            (token, request, nearly_up)
        };
        self.metrics.record_token_created(token.priority);

        let token = self.refine_estimate(token, request).await;
        info!(
            token_id = %token.id,
            label = %token.label,
            service_id = %service,
            priority = %token.priority.as_str(),
            position = ?token.queue_position,
            estimated_wait_minutes = %token.estimated_wait_minutes,
            "token_created"
        );

        let mut intents = EventNotifier::on_created(&token);
        intents.extend(nearly_up);
        self.notifier.publish(intents);
        Ok(token)
    }

    /// Put a NO_SHOW token back in line as a new WAITING token. Allowed once
    /// per original token, and only for the citizen holding it.
    pub async fn reschedule(&self, original: TokenId, citizen: &CitizenId) -> Result<Token> {
        let (service, queue) = self.queue_for_token(original)?;
        let (token, request, nearly_up) = {
            let mut q = queue.lock();
            let id = q.store.create_rescheduled(original, citizen, Utc::now())?.id;
            self.token_index.write().insert(id, service.clone());
            let recompute = self.dispatcher.recompute(&mut q);
            let token = q.store.get(id)?.clone();
            let nearly_up = self.render_nearly_up(&recompute.nearly_up, &q);
            let request = estimate_request(&token, &q);
            (token, request, nearly_up)
        };
        self.metrics.record_rescheduled();

        let token = self.refine_estimate(token, request).await;
        info!(
            token_id = %token.id,
            label = %token.label,
            original = %original,
            service_id = %service,
            position = ?token.queue_position,
            "token_rescheduled"
        );

        let mut intents = EventNotifier::on_created(&token);
        intents.extend(nearly_up);
        self.notifier.publish(intents);
        Ok(token)
    }

    /// Bind the next token to `counter`. `Ok(None)` when nobody is waiting.
    pub fn call_next(&self, counter: &CounterId, staff: &StaffId) -> Result<Option<Token>> {
        let (service, queue) = self.queue_for_counter(counter)?;
        let (dispatch, intents) = {
            let mut q = queue.lock();
            let Some(dispatch) = self.dispatcher.call_next(&mut q, counter, staff, Utc::now())? else {
                return Ok(None);
            };
            self.no_show.arm(dispatch.token.id, service, no_show::now());
            let intents = self.render(&dispatch, &q);
            (dispatch, intents)
        };

        let token = &dispatch.token;
        self.metrics.record_called(token.wait_minutes().unwrap_or(0.0) * 60.0);
        self.notifier.publish(intents);
        Ok(Some(dispatch.token))
    }

    /// CALLED -> SERVING
    pub fn mark_serving(&self, token: TokenId, staff: &StaffId, notes: Option<String>) -> Result<Token> {
        let dispatch =
            self.apply(token, |d, q| d.mark_serving(q, token, notes, Utc::now()))?;
        self.no_show.disarm(token);
        self.metrics.record_serving();
        info!(token_id = %token, staff_id = %staff, "token_serving");
        Ok(dispatch.token)
    }

    /// SERVING -> COMPLETED
    pub fn complete(&self, token: TokenId, staff: &StaffId, notes: Option<String>) -> Result<Token> {
        let dispatch = self.apply(token, |d, q| d.complete(q, token, notes, Utc::now()))?;
        self.metrics.record_completed();
        info!(
            token_id = %token,
            staff_id = %staff,
            released = ?dispatch.released,
            "token_completed"
        );
        Ok(dispatch.token)
    }

    /// Staff-initiated CALLED -> NO_SHOW
    pub fn mark_no_show(&self, token: TokenId, staff: &StaffId, notes: Option<String>) -> Result<Token> {
        let reason = format!("staff:{staff}");
        let dispatch =
            self.apply(token, |d, q| d.mark_no_show(q, token, &reason, notes, Utc::now()))?;
        self.no_show.disarm(token);
        self.metrics.record_no_show(false);
        info!(token_id = %token, staff_id = %staff, "token_no_show");
        Ok(dispatch.token)
    }

    /// Citizen-initiated WAITING -> CANCELLED
    pub fn cancel(&self, token: TokenId, citizen: &CitizenId) -> Result<Token> {
        let dispatch = self.apply(token, |d, q| d.cancel(q, token, citizen, Utc::now()))?;
        self.metrics.record_cancelled();
        info!(token_id = %token, citizen_id = %citizen, "token_cancelled");
        Ok(dispatch.token)
    }

    /// Move a CALLED token to another counter of its service. The no-show
    /// window restarts at the new counter.
    pub fn transfer(&self, token: TokenId, new_counter: &CounterId, staff: &StaffId) -> Result<Token> {
        let (service, _) = self.queue_for_token(token)?;
        let target_service = self
            .counter_index
            .read()
            .get(new_counter)
            .cloned()
            .ok_or_else(|| QueueError::CounterNotFound(new_counter.clone()))?;
        if target_service != service {
            let status = self.get_token(token)?.status;
            return Err(QueueError::InvalidTransition { token, from: status, to: TokenStatus::Called });
        }

        // Deadline is re-armed under the queue lock
        let dispatch = self.apply(token, |d, q| {
            let dispatch = d.transfer(q, token, new_counter, staff, Utc::now())?;
            self.no_show.arm(token, service, no_show::now());
            Ok(dispatch)
        })?;
        self.metrics.record_transfer();
        Ok(dispatch.token)
    }

    /// Live counts for `service`, with the estimator consulted for the
    /// new-join estimate when one is configured.
    pub async fn stats(&self, service: &ServiceId) -> Result<StatsSnapshot> {
        let (snapshot, avg) = self.stats_counts(service)?;
        Ok(self.stats.finish(snapshot, avg).await)
    }

    /// Counts and formula estimate only
    pub fn stats_sync(&self, service: &ServiceId) -> Result<StatsSnapshot> {
        self.stats_counts(service).map(|(snapshot, _)| snapshot)
    }

    fn stats_counts(&self, service: &ServiceId) -> Result<(StatsSnapshot, u32)> {
        let queue = self.queue(service)?;
        let q = queue.lock();
        let snapshot = StatsSnapshot::from_queue(&q, Utc::now().date_naive());
        Ok((snapshot, q.store.service().avg_handle_minutes))
    }

    /// Expire every no-show deadline due at or before `now`. Returns how
    /// many tokens actually moved to NO_SHOW.
    pub fn sweep_no_shows(&self, now: Instant) -> usize {
        let due = self.no_show.take_due(now);
        if due.is_empty() {
            return 0;
        }
        let mut fired = 0;
        for (token, service) in due {
            if self.expire_no_show(token, &service) {
                fired += 1;
            }
        }
        debug!(fired = %fired, pending = %self.no_show.pending(), "no_show_sweep");
        fired
    }

    fn expire_no_show(&self, token: TokenId, service: &ServiceId) -> bool {
        let Ok(queue) = self.queue(service) else {
            warn!(token_id = %token, service_id = %service, "no_show_service_missing");
            return false;
        };
        let (dispatch, intents) = {
            let mut q = queue.lock();
            let still_called = q.store.get(token).map(|t| t.status == TokenStatus::Called).unwrap_or(false);
            if !still_called {
                debug!(token_id = %token, "no_show_stale_deadline");
                return false;
            }
            match self.dispatcher.mark_no_show(&mut q, token, "timeout", None, Utc::now()) {
                Ok(dispatch) => {
                    let intents = self.render(&dispatch, &q);
                    (dispatch, intents)
                }
                Err(e) => {
                    warn!(token_id = %token, error = %e, "no_show_expire_failed");
                    return false;
                }
            }
        };

        self.metrics.record_no_show(true);
        info!(
            token_id = %token,
            label = %dispatch.token.label,
            service_id = %service,
            released = ?dispatch.released,
            "no_show_fired"
        );
        self.notifier.publish(intents);
        true
    }

    /// Run one dispatcher transition on the token's queue and publish its
    /// intents once the lock is released
    fn apply<F>(&self, token: TokenId, op: F) -> Result<Dispatch>
    where
        F: FnOnce(&CounterDispatcher, &mut ServiceQueue) -> Result<Dispatch>,
    {
        let (_, queue) = self.queue_for_token(token)?;
        let (dispatch, intents): (Dispatch, Vec<NotificationIntent>) = {
            let mut q = queue.lock();
            let dispatch = op(&self.dispatcher, &mut q)?;
            let intents = self.render(&dispatch, &q);
            (dispatch, intents)
        };
        self.notifier.publish(intents);
        Ok(dispatch)
    }

    /// Ask the external estimator for the new token's wait. The stored
    /// estimate stays formula-based; only the returned copy is refined.
    async fn refine_estimate(&self, mut token: Token, request: Option<WaitEstimateRequest>) -> Token {
        let Some(request) = request else {
            return token;
        };
        let (minutes, _) = self.stats.estimate(&request, token.estimated_wait_minutes).await;
        token.estimated_wait_minutes = minutes;
        token
    }
}

fn estimate_request(token: &Token, queue: &ServiceQueue) -> Option<WaitEstimateRequest> {
    let position = token.queue_position?;
    let service = queue.store.service();
    Some(WaitEstimateRequest {
        service_id: service.id.clone(),
        queue_position: position,
        current_time: Utc::now(),
        priority: token.priority,
        active_counters: queue.active_counters(),
        avg_handle_minutes: service.avg_handle_minutes,
    })
}
