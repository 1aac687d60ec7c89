//! Batch lifecycle states, backoff policy and per-segment retry timing

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::core::config::TranslatorConfig;
use crate::core::models::SegmentId;

/// Lifecycle of one dispatched batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Created,
    Dispatched,
    Succeeded,
    Partial,
    Failed,
}

impl BatchState {
    pub fn can_transition_to(self, next: BatchState) -> bool {
        use BatchState::*;
        matches!(
            (self, next),
            (Created, Dispatched) | (Dispatched, Succeeded) | (Dispatched, Partial) | (Dispatched, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Succeeded | BatchState::Partial | BatchState::Failed
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Created => write!(f, "CREATED"),
            BatchState::Dispatched => write!(f, "DISPATCHED"),
            BatchState::Succeeded => write!(f, "SUCCEEDED"),
            BatchState::Partial => write!(f, "PARTIAL"),
            BatchState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    /// Upper bound of the random extra delay
    jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: base / 4,
        }
    }

    pub fn from_config(config: &TranslatorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    /// Backoff before attempt `attempt + 1`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }

    /// Delay after the `attempt`-th failure; a provider `Retry-After` wins
    /// when it asks for longer
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64)
                .unwrap_or(0);
            Duration::from_millis(nanos % jitter_ms)
        };

        let computed = self.base_delay(attempt) + jitter;
        match retry_after {
            Some(wait) if wait > computed => wait,
            _ => computed,
        }
    }
}

/// Per-segment retry timing: backoff deadlines and the wall-clock budget
#[derive(Debug)]
pub struct RetryLedger {
    budget: Duration,
    first_failure: HashMap<SegmentId, Instant>,
    not_before: HashMap<SegmentId, Instant>,
}

impl RetryLedger {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            first_failure: HashMap::new(),
            not_before: HashMap::new(),
        }
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Returns `false` once the segment has spent its time budget.
    pub fn record_failure(&mut self, id: SegmentId, delay: Duration, now: Instant) -> bool {
        let first = *self.first_failure.entry(id).or_insert(now);
        self.not_before.insert(id, now + delay);
        now.duration_since(first) <= self.budget
    }

    /// Whether the segment's backoff has elapsed
    pub fn is_ready(&self, id: SegmentId, now: Instant) -> bool {
        self.not_before.get(&id).map_or(true, |&at| at <= now)
    }

    /// Earliest pending backoff deadline after `now`
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.not_before.values().copied().filter(|&at| at > now).min()
    }

    /// Forget a segment (committed, failed, or reset)
    pub fn clear(&mut self, id: SegmentId) {
        self.first_failure.remove(&id);
        self.not_before.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_state_machine() {
        use BatchState::*;
        assert!(Created.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Partial));
        assert!(!Created.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Dispatched));
        assert!(Partial.is_terminal());
        assert!(!Dispatched.is_terminal());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(350));
        assert_eq!(policy.base_delay(40), Duration::from_millis(350));

        let delay = policy.delay(1, None);
        assert!(delay >= Duration::from_millis(100) && delay < Duration::from_millis(125));
    }

    #[test]
    fn test_retry_after_wins_when_longer() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(
            policy.delay(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert!(policy.delay(1, Some(Duration::from_millis(1))) >= Duration::from_millis(100));
    }

    #[test]
    fn test_ledger_budget_and_readiness() {
        let start = Instant::now();
        let mut ledger = RetryLedger::new(Duration::from_secs(10));

        assert!(ledger.is_ready(1, start));
        assert!(ledger.record_failure(1, Duration::from_secs(2), start));
        assert!(!ledger.is_ready(1, start));
        assert_eq!(ledger.next_wakeup(start), Some(start + Duration::from_secs(2)));
        assert!(ledger.is_ready(1, start + Duration::from_secs(2)));

        // Budget counts from the first failure
        assert!(!ledger.record_failure(1, Duration::ZERO, start + Duration::from_secs(11)));

        ledger.clear(1);
        assert!(ledger.is_ready(1, start));
        assert_eq!(ledger.next_wakeup(start), None);
    }
}
