//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::PriorityClass;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Join-to-call wait bucket boundaries (seconds)
/// Buckets: ≤30, ≤60, ≤120, ≤300, ≤600, ≤900, ≤1800, ≤3600, ≤7200, ≤14400, >14400
const WAIT_BOUNDS: [u64; 10] = [30, 60, 120, 300, 600, 900, 1800, 3600, 7200, 14400];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a wait value using binary search
#[inline]
fn bucket_index(wait_secs: u64) -> usize {
    WAIT_BOUNDS.partition_point(|&bound| bound < wait_secs)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [30, 60, 120, 300, 600, 900, 1800, 3600, 7200, 14400, 28800];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

fn priority_slot(priority: PriorityClass) -> usize {
    match priority {
        PriorityClass::Emergency => 0,
        PriorityClass::Disabled => 1,
        PriorityClass::Senior => 2,
        PriorityClass::Normal => 3,
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps periodic counters to get a
/// consistent snapshot.
pub struct Metrics {
    /// Tokens issued, including reschedules (monotonic)
    tokens_created: AtomicU64,
    /// Tokens issued per priority class, indexed by `priority_slot`
    tokens_created_by_priority: [AtomicU64; 4],
    tokens_called: AtomicU64,
    tokens_serving: AtomicU64,
    tokens_completed: AtomicU64,
    /// No-shows fired by the deadline sweep
    no_show_auto: AtomicU64,
    /// No-shows marked by staff
    no_show_manual: AtomicU64,
    tokens_cancelled: AtomicU64,
    transfers: AtomicU64,
    rescheduled: AtomicU64,
    /// Intents accepted by the intent channel
    intents_sent: AtomicU64,
    /// Intents dropped because the channel was full or closed
    intents_dropped: AtomicU64,
    /// Estimator calls that failed or timed out
    estimator_fallbacks: AtomicU64,
    /// Join-to-call wait histogram (cumulative)
    wait_buckets: [AtomicU64; NUM_BUCKETS],
    /// Sum of join-to-call waits in seconds (cumulative)
    wait_sum_secs: AtomicU64,
    /// Max join-to-call wait since last report (reset on report)
    wait_max_secs: AtomicU64,
    /// Calls since last report (reset on report)
    calls_since_report: AtomicU64,
    /// Joins since last report (reset on report)
    created_since_report: AtomicU64,
    last_report_time: Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tokens_created: AtomicU64::new(0),
            tokens_created_by_priority: std::array::from_fn(|_| AtomicU64::new(0)),
            tokens_called: AtomicU64::new(0),
            tokens_serving: AtomicU64::new(0),
            tokens_completed: AtomicU64::new(0),
            no_show_auto: AtomicU64::new(0),
            no_show_manual: AtomicU64::new(0),
            tokens_cancelled: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            intents_sent: AtomicU64::new(0),
            intents_dropped: AtomicU64::new(0),
            estimator_fallbacks: AtomicU64::new(0),
            wait_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            wait_sum_secs: AtomicU64::new(0),
            wait_max_secs: AtomicU64::new(0),
            calls_since_report: AtomicU64::new(0),
            created_since_report: AtomicU64::new(0),
            last_report_time: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_token_created(&self, priority: PriorityClass) {
        self.tokens_created.fetch_add(1, Ordering::Relaxed);
        self.created_since_report.fetch_add(1, Ordering::Relaxed);
        self.tokens_created_by_priority[priority_slot(priority)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful call-next with the token's join-to-call wait
    #[inline]
    pub fn record_called(&self, wait_secs: f64) {
        let wait = wait_secs.max(0.0).round() as u64;
        self.tokens_called.fetch_add(1, Ordering::Relaxed);
        self.calls_since_report.fetch_add(1, Ordering::Relaxed);
        self.wait_buckets[bucket_index(wait)].fetch_add(1, Ordering::Relaxed);
        self.wait_sum_secs.fetch_add(wait, Ordering::Relaxed);
        update_atomic_max(&self.wait_max_secs, wait);
    }

    #[inline]
    pub fn record_serving(&self) {
        self.tokens_serving.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_completed(&self) {
        self.tokens_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// `auto` is true when the deadline sweep fired, false for staff
    #[inline]
    pub fn record_no_show(&self, auto: bool) {
        if auto {
            self.no_show_auto.fetch_add(1, Ordering::Relaxed);
        } else {
            self.no_show_manual.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_cancelled(&self) {
        self.tokens_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// A rescheduled token also counts as created
    #[inline]
    pub fn record_rescheduled(&self) {
        self.rescheduled.fetch_add(1, Ordering::Relaxed);
        self.tokens_created.fetch_add(1, Ordering::Relaxed);
        self.created_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_intent_sent(&self) {
        self.intents_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_intent_dropped(&self) {
        self.intents_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_estimator_fallback(&self) {
        self.estimator_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tokens_created(&self) -> u64 {
        self.tokens_created.load(Ordering::Relaxed)
    }

    pub fn tokens_called(&self) -> u64 {
        self.tokens_called.load(Ordering::Relaxed)
    }

    pub fn tokens_completed(&self) -> u64 {
        self.tokens_completed.load(Ordering::Relaxed)
    }

    pub fn no_shows(&self) -> (u64, u64) {
        (self.no_show_auto.load(Ordering::Relaxed), self.no_show_manual.load(Ordering::Relaxed))
    }

    pub fn intents_sent(&self) -> u64 {
        self.intents_sent.load(Ordering::Relaxed)
    }

    pub fn intents_dropped(&self) -> u64 {
        self.intents_dropped.load(Ordering::Relaxed)
    }

    pub fn estimator_fallbacks(&self) -> u64 {
        self.estimator_fallbacks.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, waiting: usize, pending_no_shows: usize) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let calls = self.calls_since_report.swap(0, Ordering::Relaxed);
        let created = self.created_since_report.swap(0, Ordering::Relaxed);
        let wait_max_secs = self.wait_max_secs.swap(0, Ordering::Relaxed);

        // Calculate elapsed time and reset
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let per_min = |count: u64| {
            if elapsed.as_secs_f64() > 0.0 {
                count as f64 * 60.0 / elapsed.as_secs_f64()
            } else {
                0.0
            }
        };

        let mut summary = self.cumulative(waiting, pending_no_shows);
        summary.joins_per_min = per_min(created);
        summary.calls_per_min = per_min(calls);
        summary.wait_max_secs = wait_max_secs;
        summary
    }

    /// Monotonic counters and the wait histogram, without touching the
    /// periodic counters `report()` owns. Rates and max are left at zero.
    pub fn cumulative(&self, waiting: usize, pending_no_shows: usize) -> MetricsSummary {
        let wait_buckets = load_buckets(&self.wait_buckets);
        let wait_count: u64 = wait_buckets.iter().sum();
        let wait_sum = self.wait_sum_secs.load(Ordering::Relaxed);

        let mut created_by_priority = [0u64; 4];
        for (slot, counter) in self.tokens_created_by_priority.iter().enumerate() {
            created_by_priority[slot] = counter.load(Ordering::Relaxed);
        }

        MetricsSummary {
            tokens_created: self.tokens_created.load(Ordering::Relaxed),
            created_by_priority,
            tokens_called: self.tokens_called.load(Ordering::Relaxed),
            tokens_serving: self.tokens_serving.load(Ordering::Relaxed),
            tokens_completed: self.tokens_completed.load(Ordering::Relaxed),
            no_show_auto: self.no_show_auto.load(Ordering::Relaxed),
            no_show_manual: self.no_show_manual.load(Ordering::Relaxed),
            tokens_cancelled: self.tokens_cancelled.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            intents_sent: self.intents_sent.load(Ordering::Relaxed),
            intents_dropped: self.intents_dropped.load(Ordering::Relaxed),
            estimator_fallbacks: self.estimator_fallbacks.load(Ordering::Relaxed),
            joins_per_min: 0.0,
            calls_per_min: 0.0,
            wait_buckets,
            wait_sum_secs: wait_sum,
            wait_avg_secs: if wait_count > 0 { wait_sum / wait_count } else { 0 },
            wait_max_secs: 0,
            wait_p50_secs: percentile_from_buckets(&wait_buckets, 0.50),
            wait_p95_secs: percentile_from_buckets(&wait_buckets, 0.95),
            waiting,
            pending_no_shows,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_WAIT_BOUNDS: [u64; 10] = WAIT_BOUNDS;

/// Priority label order matching `MetricsSummary::created_by_priority`
pub const METRICS_PRIORITY_ORDER: [PriorityClass; 4] = [
    PriorityClass::Emergency,
    PriorityClass::Disabled,
    PriorityClass::Senior,
    PriorityClass::Normal,
];

#[derive(Debug)]
pub struct MetricsSummary {
    pub tokens_created: u64,
    /// Ordered as `METRICS_PRIORITY_ORDER`
    pub created_by_priority: [u64; 4],
    pub tokens_called: u64,
    pub tokens_serving: u64,
    pub tokens_completed: u64,
    pub no_show_auto: u64,
    pub no_show_manual: u64,
    pub tokens_cancelled: u64,
    pub transfers: u64,
    pub rescheduled: u64,
    pub intents_sent: u64,
    pub intents_dropped: u64,
    pub estimator_fallbacks: u64,
    pub joins_per_min: f64,
    pub calls_per_min: f64,
    /// Join-to-call wait histogram buckets
    /// Bounds: ≤30, ≤60, ≤120, ≤300, ≤600, ≤900, ≤1800, ≤3600, ≤7200, ≤14400, >14400 s
    pub wait_buckets: [u64; NUM_BUCKETS],
    pub wait_sum_secs: u64,
    pub wait_avg_secs: u64,
    /// Longest wait since the previous report
    pub wait_max_secs: u64,
    pub wait_p50_secs: u64,
    pub wait_p95_secs: u64,
    /// WAITING tokens across all services (snapshot)
    pub waiting: usize,
    /// Armed no-show deadlines (snapshot)
    pub pending_no_shows: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            created = %self.tokens_created,
            called = %self.tokens_called,
            completed = %self.tokens_completed,
            no_show_auto = %self.no_show_auto,
            no_show_manual = %self.no_show_manual,
            cancelled = %self.tokens_cancelled,
            joins_per_min = format!("{:.1}", self.joins_per_min),
            calls_per_min = format!("{:.1}", self.calls_per_min),
            wait_avg_s = %self.wait_avg_secs,
            wait_p95_s = %self.wait_p95_secs,
            waiting = %self.waiting,
            pending_no_shows = %self.pending_no_shows,
            intents_dropped = %self.intents_dropped,
            "metrics"
        );
    }
}
