//! Read-only projections over a service queue
//!
//! Counts are taken under the service lock; the optional external
//! estimator is consulted afterwards, bounded by a timeout, and the
//! deterministic formula is used whenever it fails.

use crate::domain::types::{PriorityClass, ServiceId, TokenStatus};
use crate::infra::metrics::Metrics;
use crate::services::dispatcher::ServiceQueue;
use crate::services::scheduler::fallback_wait_minutes;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Input handed to an external wait-time estimator
#[derive(Debug, Clone, PartialEq)]
pub struct WaitEstimateRequest {
    pub service_id: ServiceId,
    /// Position the estimate is for (waiting + 1 for a new join)
    pub queue_position: usize,
    pub current_time: DateTime<Utc>,
    pub priority: PriorityClass,
    pub active_counters: usize,
    pub avg_handle_minutes: u32,
}

/// Pluggable wait-time estimator (e.g. an ML prediction service)
#[async_trait]
pub trait WaitTimeEstimator: Send + Sync {
    /// Predicted wait in whole minutes
    async fn estimate(&self, request: &WaitEstimateRequest) -> anyhow::Result<u32>;

    fn name(&self) -> &str {
        "external"
    }
}

/// Where an estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Formula,
    Estimator,
}

/// Live counts for one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub service_id: ServiceId,
    pub waiting: usize,
    pub called: usize,
    pub serving: usize,
    pub completed_today: usize,
    pub no_show_today: usize,
    pub cancelled_today: usize,
    /// Mean join-to-call time of tokens called today
    pub average_wait_minutes: f64,
    pub active_counters: usize,
    pub estimated_wait_for_new_join: u32,
    pub estimate_source: EstimateSource,
}

impl StatsSnapshot {
    /// Counts from the current token set, with the formula estimate
    pub fn from_queue(queue: &ServiceQueue, today: NaiveDate) -> Self {
        let service = queue.store.service();
        let mut snapshot = Self {
            service_id: service.id.clone(),
            waiting: 0,
            called: 0,
            serving: 0,
            completed_today: 0,
            no_show_today: 0,
            cancelled_today: 0,
            average_wait_minutes: 0.0,
            active_counters: queue.active_counters(),
            estimated_wait_for_new_join: 0,
            estimate_source: EstimateSource::Formula,
        };

        let mut wait_sum = 0.0;
        let mut wait_count = 0usize;
        for token in queue.store.tokens() {
            let ended_today = token.completed_at.is_some_and(|at| at.date_naive() == today);
            match token.status {
                TokenStatus::Waiting => snapshot.waiting += 1,
                TokenStatus::Called => snapshot.called += 1,
                TokenStatus::Serving => snapshot.serving += 1,
                TokenStatus::Completed if ended_today => snapshot.completed_today += 1,
                TokenStatus::NoShow if ended_today => snapshot.no_show_today += 1,
                TokenStatus::Cancelled if ended_today => snapshot.cancelled_today += 1,
                _ => {}
            }
            if token.called_at.is_some_and(|at| at.date_naive() == today) {
                if let Some(minutes) = token.wait_minutes() {
                    wait_sum += minutes;
                    wait_count += 1;
                }
            }
        }
        if wait_count > 0 {
            snapshot.average_wait_minutes = wait_sum / wait_count as f64;
        }
        snapshot.estimated_wait_for_new_join = fallback_wait_minutes(
            snapshot.waiting,
            service.avg_handle_minutes,
            snapshot.active_counters,
        );
        snapshot
    }
}

/// Wraps the optional external estimator with timeout and fallback
pub struct StatsAggregator {
    estimator: Option<Arc<dyn WaitTimeEstimator>>,
    timeout: Duration,
    metrics: Arc<Metrics>,
}

impl StatsAggregator {
    pub fn new(
        estimator: Option<Arc<dyn WaitTimeEstimator>>,
        timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { estimator, timeout, metrics }
    }

    /// Ask the estimator, falling back to `fallback` on error or timeout.
    /// Never fails.
    pub async fn estimate(&self, request: &WaitEstimateRequest, fallback: u32) -> (u32, EstimateSource) {
        let Some(ref estimator) = self.estimator else {
            return (fallback, EstimateSource::Formula);
        };

        match tokio::time::timeout(self.timeout, estimator.estimate(request)).await {
            Ok(Ok(minutes)) => {
                debug!(
                    service_id = %request.service_id,
                    estimator = %estimator.name(),
                    minutes = %minutes,
                    "wait_estimated"
                );
                (minutes, EstimateSource::Estimator)
            }
            Ok(Err(e)) => {
                self.metrics.record_estimator_fallback();
                warn!(
                    service_id = %request.service_id,
                    estimator = %estimator.name(),
                    error = %e,
                    fallback = %fallback,
                    "wait_estimator_failed"
                );
                (fallback, EstimateSource::Formula)
            }
            Err(_) => {
                self.metrics.record_estimator_fallback();
                warn!(
                    service_id = %request.service_id,
                    estimator = %estimator.name(),
                    timeout_ms = %self.timeout.as_millis(),
                    fallback = %fallback,
                    "wait_estimator_timeout"
                );
                (fallback, EstimateSource::Formula)
            }
        }
    }

    /// Replace the formula estimate in `snapshot` with the estimator's, if any
    pub async fn finish(&self, mut snapshot: StatsSnapshot, avg_handle_minutes: u32) -> StatsSnapshot {
        let request = WaitEstimateRequest {
            service_id: snapshot.service_id.clone(),
            queue_position: snapshot.waiting + 1,
            current_time: Utc::now(),
            priority: PriorityClass::Normal,
            active_counters: snapshot.active_counters,
            avg_handle_minutes,
        };
        let (minutes, source) = self.estimate(&request, snapshot.estimated_wait_for_new_join).await;
        snapshot.estimated_wait_for_new_join = minutes;
        snapshot.estimate_source = source;
        snapshot
    }
}
