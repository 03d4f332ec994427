//! Priority ordering of WAITING tokens
//!
//! Order is (weight descending, created_at ascending, seq ascending). The
//! final `seq` key only matters for tokens created within the same clock
//! tick and makes the order total, so there is always a unique position 1.

use crate::domain::token::Token;
use crate::domain::types::TokenId;
use crate::services::token_store::TokenStore;
use std::cmp::Ordering;
use tracing::debug;

/// Queue order: `Less` means `a` is served before `b`
#[inline]
pub fn queue_order(a: &Token, b: &Token) -> Ordering {
    b.weight()
        .cmp(&a.weight())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.seq.cmp(&b.seq))
}

/// Position `candidate` would take among `existing_waiting`.
///
/// 1 + number of tokens with higher weight, or equal weight and earlier
/// arrival. `candidate` itself is skipped if present.
pub fn position_of(candidate: &Token, existing_waiting: &[&Token]) -> usize {
    1 + existing_waiting
        .iter()
        .filter(|other| other.id != candidate.id)
        .filter(|other| queue_order(other, candidate) == Ordering::Less)
        .count()
}

/// Deterministic wait estimate: `ahead × avg_handle ÷ max(1, counters)`,
/// rounded up to whole minutes.
#[inline]
pub fn fallback_wait_minutes(ahead: usize, avg_handle_minutes: u32, active_counters: usize) -> u32 {
    let total = ahead as u64 * avg_handle_minutes as u64;
    let counters = active_counters.max(1) as u64;
    total.div_ceil(counters).min(u32::MAX as u64) as u32
}

/// Result of a recompute pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Recompute {
    /// Final assignment in queue order
    pub positions: Vec<(TokenId, usize)>,
    /// Tokens that moved from outside into the "nearly up" window
    pub nearly_up: Vec<TokenId>,
}

/// Reassign positions 1..N for every WAITING token of the store's service.
///
/// Idempotent: a second call with no intervening mutation writes the same
/// positions and reports no `nearly_up` crossings.
pub fn recompute(store: &mut TokenStore, active_counters: usize, nearly_up_position: usize) -> Recompute {
    let avg_handle = store.service().avg_handle_minutes;

    let mut waiting = store.get_waiting();
    waiting.sort_by(|a, b| queue_order(a, b));
    let ordered: Vec<(TokenId, Option<usize>)> =
        waiting.iter().map(|t| (t.id, t.queue_position)).collect();

    let mut result = Recompute { positions: Vec::with_capacity(ordered.len()), nearly_up: Vec::new() };
    for (idx, (id, previous)) in ordered.into_iter().enumerate() {
        let position = idx + 1;
        let estimate = fallback_wait_minutes(idx, avg_handle, active_counters);
        store.set_position(id, position, estimate);

        if position <= nearly_up_position && previous.is_some_and(|p| p > nearly_up_position) {
            result.nearly_up.push(id);
        }
        result.positions.push((id, position));
    }

    debug!(
        service_id = %store.service().id,
        waiting = %result.positions.len(),
        nearly_up = %result.nearly_up.len(),
        "positions_recomputed"
    );
    result
}
