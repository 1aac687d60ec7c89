//! Token usage tracking and run budget

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::models::TokenUsage;

/// Shared token counter for one run
#[derive(Debug, Clone)]
pub struct TokenTracker {
    usage: Arc<RwLock<TokenUsage>>,
}

impl TokenTracker {
    /// Create a tracker; `None` means unlimited
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            usage: Arc::new(RwLock::new(TokenUsage::new(budget))),
        }
    }

    /// Whether another request may be dispatched
    pub async fn can_dispatch(&self) -> bool {
        !self.usage.read().await.is_exhausted()
    }

    /// Record tokens reported by a provider reply
    pub async fn record(&self, tokens: usize) {
        let mut usage = self.usage.write().await;
        usage.record(tokens);

        match usage.remaining() {
            Some(0) => info!("Token budget exhausted after {} requests", usage.requests),
            Some(remaining) => debug!("Used {} tokens, remaining: {}", tokens, remaining),
            None => debug!("Used {} tokens, total: {}", tokens, usage.used),
        }
    }

    /// Get current usage statistics
    pub async fn get_stats(&self) -> TokenUsage {
        self.usage.read().await.clone()
    }

    /// Check if the budget is low (less than 10% remaining)
    pub async fn is_low(&self) -> bool {
        let usage = self.usage.read().await;
        match (usage.budget, usage.remaining()) {
            (Some(budget), Some(remaining)) => remaining < budget / 10,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_tracker() {
        let tracker = TokenTracker::new(Some(1000));
        assert!(tracker.can_dispatch().await);

        tracker.record(500).await;
        assert_eq!(tracker.get_stats().await.remaining(), Some(500));
        assert!(tracker.can_dispatch().await);

        // Overshoot is recorded, dispatch then stops
        tracker.record(600).await;
        assert!(!tracker.can_dispatch().await);
        assert_eq!(tracker.get_stats().await.requests, 2);
    }

    #[test]
    fn test_low_budget_detection() {
        let tracker = TokenTracker::new(Some(1000));
        tokio_test::block_on(tracker.record(950));
        assert!(tokio_test::block_on(tracker.is_low()));

        let unlimited = TokenTracker::new(None);
        tokio_test::block_on(unlimited.record(1_000_000));
        assert!(!tokio_test::block_on(unlimited.is_low()));
        assert!(tokio_test::block_on(unlimited.can_dispatch()));
    }
}
