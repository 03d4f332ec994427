//! No-show deadlines for CALLED tokens
//!
//! Each successful call-next arms a deadline keyed by token id. A periodic
//! sweep collects expired deadlines and hands them back to the engine, which
//! re-reads the token under the service lock and only transitions it if it
//! is still CALLED. Disarming on every other transition keeps the map small;
//! correctness only depends on the re-read.

use crate::domain::types::{ServiceId, TokenId};
use crate::services::engine::QueueEngine;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Deadline {
    service_id: ServiceId,
    due_at: Instant,
}

/// Current instant on the runtime clock (follows paused time in tests)
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Cancellable deadlines keyed by token id
pub struct NoShowMonitor {
    timeout: Duration,
    deadlines: Mutex<FxHashMap<TokenId, Deadline>>,
}

impl NoShowMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, deadlines: Mutex::new(FxHashMap::default()) }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm (or re-arm) a full timeout window starting at `now`
    pub fn arm(&self, token: TokenId, service_id: ServiceId, now: Instant) {
        self.arm_at(token, service_id, now + self.timeout);
    }

    /// Arm with an explicit deadline (used when re-arming after a restart)
    pub fn arm_at(&self, token: TokenId, service_id: ServiceId, due_at: Instant) {
        debug!(token_id = %token, service_id = %service_id, "no_show_armed");
        self.deadlines.lock().insert(token, Deadline { service_id, due_at });
    }

    /// Returns true if a deadline was pending
    pub fn disarm(&self, token: TokenId) -> bool {
        self.deadlines.lock().remove(&token).is_some()
    }

    /// Remove and return every deadline due at or before `now`
    pub fn take_due(&self, now: Instant) -> Vec<(TokenId, ServiceId)> {
        let mut due = Vec::new();
        self.deadlines.lock().retain(|token, deadline| {
            if deadline.due_at <= now {
                due.push((*token, deadline.service_id.clone()));
                false
            } else {
                true
            }
        });
        due
    }

    pub fn pending(&self) -> usize {
        self.deadlines.lock().len()
    }

    pub fn is_armed(&self, token: TokenId) -> bool {
        self.deadlines.lock().contains_key(&token)
    }
}

/// Periodic sweep driving automatic no-shows until shutdown
pub async fn run_sweeper(engine: Arc<QueueEngine>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_ms = %interval.as_millis(), "no_show_sweeper_started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                engine.sweep_no_shows(now());
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("no_show_sweeper_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_due_only_returns_expired() {
        let monitor = NoShowMonitor::new(Duration::from_secs(300));
        let start = Instant::now();
        let early = TokenId::new();
        let late = TokenId::new();
        monitor.arm(early, "s".into(), start);
        monitor.arm(late, "s".into(), start + Duration::from_secs(60));

        assert!(monitor.take_due(start + Duration::from_secs(299)).is_empty());

        let due = monitor.take_due(start + Duration::from_secs(300));
        assert_eq!(due, vec![(early, ServiceId::from("s"))]);
        assert_eq!(monitor.pending(), 1);

        // Already taken deadlines never fire twice
        assert_eq!(monitor.take_due(start + Duration::from_secs(360)).len(), 1);
        assert!(monitor.take_due(start + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_disarm_cancels() {
        let monitor = NoShowMonitor::new(Duration::from_secs(1));
        let token = TokenId::new();
        let start = Instant::now();
        monitor.arm(token, "s".into(), start);
        assert!(monitor.is_armed(token));

        assert!(monitor.disarm(token));
        assert!(!monitor.disarm(token));
        assert!(monitor.take_due(start + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn test_rearm_extends_deadline() {
        let monitor = NoShowMonitor::new(Duration::from_secs(10));
        let token = TokenId::new();
        let start = Instant::now();
        monitor.arm(token, "s".into(), start);
        monitor.arm(token, "s".into(), start + Duration::from_secs(8));

        assert!(monitor.take_due(start + Duration::from_secs(12)).is_empty());
        assert_eq!(monitor.take_due(start + Duration::from_secs(18)).len(), 1);
    }
}
