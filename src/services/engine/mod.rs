//! Queue engine facade
//!
//! The QueueEngine is the only object other subsystems call into. It owns:
//! - one `ServiceQueue` per service, each behind its own lock
//! - read-mostly indexes from counter and token ids to their service
//! - the no-show deadline map, notifier and stats aggregator
//!
//! Lock order: an index read lock is released before a service queue is
//! locked. Under a queue lock only the token index write lock and the
//! no-show deadline map may be taken, both as leaves. No lock is held across
//! an `.await`.

mod operations;
#[cfg(test)]
mod tests;

use crate::domain::error::{QueueError, Result};
use crate::domain::token::Token;
use crate::domain::types::{Counter, CounterId, Service, ServiceId, TokenId, TokenStatus};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::intent_channel::{IntentSender, NotificationIntent};
use crate::io::snapshot::EngineSnapshot;
use crate::services::dispatcher::{CounterDispatcher, Dispatch, ServiceQueue};
use crate::services::no_show::{self, NoShowMonitor};
use crate::services::notifier::EventNotifier;
use crate::services::stats::{StatsAggregator, WaitTimeEstimator};
use crate::services::token_store::TokenStore;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type SharedQueue = Arc<Mutex<ServiceQueue>>;

/// Live per-service counts for gauges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveCounts {
    pub service_id: ServiceId,
    pub waiting: usize,
    pub called: usize,
    pub serving: usize,
    pub active_counters: usize,
}

pub struct QueueEngine {
    queues: RwLock<FxHashMap<ServiceId, SharedQueue>>,
    counter_index: RwLock<FxHashMap<CounterId, ServiceId>>,
    token_index: RwLock<FxHashMap<TokenId, ServiceId>>,
    dispatcher: CounterDispatcher,
    no_show: NoShowMonitor,
    notifier: EventNotifier,
    stats: StatsAggregator,
    metrics: Arc<Metrics>,
}

impl QueueEngine {
    pub fn new(
        config: &Config,
        metrics: Arc<Metrics>,
        intents: Option<IntentSender>,
        estimator: Option<Arc<dyn WaitTimeEstimator>>,
    ) -> Self {
        let stats = StatsAggregator::new(
            estimator,
            Duration::from_millis(config.estimator_timeout_ms()),
            metrics.clone(),
        );
        Self {
            queues: RwLock::new(FxHashMap::default()),
            counter_index: RwLock::new(FxHashMap::default()),
            token_index: RwLock::new(FxHashMap::default()),
            dispatcher: CounterDispatcher::new(config.nearly_up_position()),
            no_show: NoShowMonitor::new(Duration::from_secs(config.no_show_timeout_secs())),
            notifier: EventNotifier::new(intents),
            stats,
            metrics,
        }
    }

    /// Build an engine and register the services and counters in `config`
    pub fn from_config(
        config: &Config,
        metrics: Arc<Metrics>,
        intents: Option<IntentSender>,
        estimator: Option<Arc<dyn WaitTimeEstimator>>,
    ) -> Result<Self> {
        let engine = Self::new(config, metrics, intents, estimator);
        for service in config.services() {
            engine.register_service(service.clone());
        }
        for counter in config.counters() {
            engine.register_counter(counter.clone())?;
        }
        Ok(engine)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn no_show_monitor(&self) -> &NoShowMonitor {
        &self.no_show
    }

    // ---------------------------------------------------------------------
    // Reference data
    // ---------------------------------------------------------------------

    /// Insert or update a service definition
    pub fn register_service(&self, service: Service) {
        let existing = self.queues.read().get(&service.id).cloned();
        match existing {
            Some(queue) => {
                let mut q = queue.lock();
                let current = q.store.service_mut();
                current.name = service.name;
                current.avg_handle_minutes = service.avg_handle_minutes;
                current.active = service.active;
                debug!(service_id = %current.id, "service_updated");
                self.dispatcher.recompute(&mut q);
            }
            None => {
                info!(
                    service_id = %service.id,
                    name = %service.name,
                    avg_handle_minutes = %service.avg_handle_minutes,
                    "service_registered"
                );
                let id = service.id.clone();
                let queue = Arc::new(Mutex::new(ServiceQueue::new(TokenStore::new(service))));
                self.queues.write().entry(id).or_insert(queue);
            }
        }
    }

    /// Insert or update a counter. A counter may only move to another
    /// service while it holds no token.
    pub fn register_counter(&self, mut counter: Counter) -> Result<()> {
        let target = self.queue(&counter.service_id)?;
        let previous = self.counter_index.read().get(&counter.id).cloned();

        if let Some(prev_service) = previous.filter(|s| *s != counter.service_id) {
            let old = self.queue(&prev_service)?;
            let mut q = old.lock();
            if let Some(token) = q.counters.get(&counter.id).and_then(|c| c.current_token) {
                if q.store.get(token).map(|t| t.is_active()).unwrap_or(false) {
                    return Err(QueueError::CounterBusy { counter: counter.id.clone(), token });
                }
            }
            q.counters.remove(&counter.id);
            self.dispatcher.recompute(&mut q);
        }

        let mut q = target.lock();
        if let Some(existing) = q.counters.get(&counter.id) {
            counter.current_token = existing.current_token;
            counter.staff_id = counter.staff_id.or_else(|| existing.staff_id.clone());
        }
        info!(
            counter_id = %counter.id,
            label = %counter.label,
            service_id = %counter.service_id,
            active = %counter.active,
            "counter_registered"
        );
        self.counter_index.write().insert(counter.id.clone(), counter.service_id.clone());
        q.counters.insert(counter.id.clone(), counter);
        self.dispatcher.recompute(&mut q);
        Ok(())
    }

    pub fn set_service_active(&self, service: &ServiceId, active: bool) -> Result<()> {
        let queue = self.queue(service)?;
        queue.lock().store.service_mut().active = active;
        info!(service_id = %service, active = %active, "service_active_changed");
        Ok(())
    }

    /// Toggle a counter. A disabled counter keeps its current binding until
    /// that token finishes; it just stops receiving new calls.
    pub fn set_counter_active(&self, counter: &CounterId, active: bool) -> Result<()> {
        let (_, queue) = self.queue_for_counter(counter)?;
        let mut q = queue.lock();
        let entry =
            q.counters.get_mut(counter).ok_or_else(|| QueueError::CounterNotFound(counter.clone()))?;
        entry.active = active;
        self.dispatcher.recompute(&mut q);
        info!(counter_id = %counter, active = %active, "counter_active_changed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn get_token(&self, token: TokenId) -> Result<Token> {
        let (_, queue) = self.queue_for_token(token)?;
        let q = queue.lock();
        q.store.get(token).cloned()
    }

    /// WAITING tokens in queue order
    pub fn get_waiting(&self, service: &ServiceId) -> Result<Vec<Token>> {
        let queue = self.queue(service)?;
        let q = queue.lock();
        let mut waiting: Vec<Token> = q.store.get_waiting().into_iter().cloned().collect();
        waiting.sort_by_key(|t| t.queue_position);
        Ok(waiting)
    }

    pub fn get_counter(&self, counter: &CounterId) -> Result<Counter> {
        let (_, queue) = self.queue_for_counter(counter)?;
        let q = queue.lock();
        q.counters.get(counter).cloned().ok_or_else(|| QueueError::CounterNotFound(counter.clone()))
    }

    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.queues.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-service gauges, sorted by service id
    pub fn live_counts(&self) -> Vec<LiveCounts> {
        let mut queues: Vec<(ServiceId, SharedQueue)> =
            self.queues.read().iter().map(|(id, q)| (id.clone(), q.clone())).collect();
        queues.sort_by(|a, b| a.0.cmp(&b.0));

        queues
            .into_iter()
            .map(|(service_id, queue)| {
                let q = queue.lock();
                let mut counts = LiveCounts {
                    service_id,
                    waiting: 0,
                    called: 0,
                    serving: 0,
                    active_counters: q.active_counters(),
                };
                for token in q.store.tokens() {
                    match token.status {
                        TokenStatus::Waiting => counts.waiting += 1,
                        TokenStatus::Called => counts.called += 1,
                        TokenStatus::Serving => counts.serving += 1,
                        _ => {}
                    }
                }
                counts
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Snapshot / restore
    // ---------------------------------------------------------------------

    /// Copy of every service, counter and token
    pub fn snapshot(&self) -> EngineSnapshot {
        let queues: Vec<SharedQueue> = self.queues.read().values().cloned().collect();
        let mut snapshot = EngineSnapshot::default();
        for queue in queues {
            let q = queue.lock();
            snapshot.services.push(q.store.service().clone());
            snapshot.counters.extend(q.counters.values().cloned());
            snapshot.tokens.extend(q.store.tokens().cloned());
        }
        snapshot.services.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.counters.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot.tokens.sort_by(|a, b| (&a.service_id, a.seq).cmp(&(&b.service_id, b.seq)));
        snapshot
    }

    /// Replace engine state with `snapshot`, re-arming no-show deadlines for
    /// CALLED tokens from their `called_at`.
    pub fn restore(&self, snapshot: EngineSnapshot) {
        let EngineSnapshot { services, counters, tokens } = snapshot;

        let mut by_service: FxHashMap<ServiceId, Vec<Token>> = FxHashMap::default();
        for token in tokens {
            by_service.entry(token.service_id.clone()).or_default().push(token);
        }

        let mut queues = FxHashMap::default();
        let mut token_index = FxHashMap::default();
        let mut counter_index = FxHashMap::default();
        let now = Utc::now();
        let now_instant = no_show::now();
        let mut rearmed = 0usize;

        for service in services {
            let tokens = by_service.remove(&service.id).unwrap_or_default();
            for token in &tokens {
                token_index.insert(token.id, service.id.clone());
                if token.status == TokenStatus::Called {
                    let elapsed = token
                        .called_at
                        .and_then(|at| (now - at).to_std().ok())
                        .unwrap_or_default();
                    let remaining = self.no_show.timeout().saturating_sub(elapsed);
                    self.no_show.arm_at(token.id, service.id.clone(), now_instant + remaining);
                    rearmed += 1;
                }
            }
            let id = service.id.clone();
            queues.insert(id, ServiceQueue::new(TokenStore::restore(service, tokens)));
        }
        for (service_id, orphaned) in by_service {
            warn!(service_id = %service_id, tokens = %orphaned.len(), "snapshot_tokens_without_service");
        }
        for counter in counters {
            match queues.get_mut(&counter.service_id) {
                Some(queue) => {
                    counter_index.insert(counter.id.clone(), counter.service_id.clone());
                    queue.counters.insert(counter.id.clone(), counter);
                }
                None => warn!(counter_id = %counter.id, "snapshot_counter_without_service"),
            }
        }

        let queues: FxHashMap<ServiceId, SharedQueue> = queues
            .into_iter()
            .map(|(id, mut queue)| {
                self.dispatcher.recompute(&mut queue);
                (id, Arc::new(Mutex::new(queue)))
            })
            .collect();

        info!(
            services = %queues.len(),
            tokens = %token_index.len(),
            counters = %counter_index.len(),
            no_show_rearmed = %rearmed,
            "engine_restored"
        );
        *self.queues.write() = queues;
        *self.token_index.write() = token_index;
        *self.counter_index.write() = counter_index;
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn queue(&self, service: &ServiceId) -> Result<SharedQueue> {
        self.queues
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| QueueError::ServiceNotFound(service.clone()))
    }

    fn queue_for_counter(&self, counter: &CounterId) -> Result<(ServiceId, SharedQueue)> {
        let service = self
            .counter_index
            .read()
            .get(counter)
            .cloned()
            .ok_or_else(|| QueueError::CounterNotFound(counter.clone()))?;
        let queue = self.queue(&service)?;
        Ok((service, queue))
    }

    fn queue_for_token(&self, token: TokenId) -> Result<(ServiceId, SharedQueue)> {
        let service =
            self.token_index.read().get(&token).cloned().ok_or(QueueError::TokenNotFound(token))?;
        let queue = self.queue(&service)?;
        Ok((service, queue))
    }

    /// Intents for a dispatch, rendered while the queue is still locked
    fn render(&self, dispatch: &Dispatch, queue: &ServiceQueue) -> Vec<NotificationIntent> {
        let token = &dispatch.token;
        let mut intents = Vec::with_capacity(1 + dispatch.recompute.nearly_up.len());
        let transferred =
            dispatch.prev_status == TokenStatus::Called && token.status == TokenStatus::Called;
        if transferred {
            intents.push(EventNotifier::on_transfer(token, dispatch.counter_label));
        } else if let Some(intent) = EventNotifier::on_status(token, dispatch.counter_label) {
            intents.push(intent);
        }
        intents.extend(self.render_nearly_up(&dispatch.recompute.nearly_up, queue));
        intents
    }

    fn render_nearly_up(&self, ids: &[TokenId], queue: &ServiceQueue) -> Vec<NotificationIntent> {
        ids.iter()
            .filter_map(|id| queue.store.get(*id).ok())
            .map(EventNotifier::on_nearly_up)
            .collect()
    }
}
