//! Run report and progress statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::models::{RunMetadata, SegmentId};
use crate::pipeline::retry::BatchState;
use crate::pipeline::store::{SegmentStore, StoreStats};

/// A segment that ended FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSegment {
    pub id: SegmentId,
    pub location: String,
    pub retry_count: u32,
    pub reason: String,
}

/// Why the scheduler stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No PENDING or IN_FLIGHT segment left
    #[default]
    Completed,
    /// Token budget exhausted; the rest stays PENDING
    TokenBudget,
    /// Shutdown requested
    Cancelled,
}

/// Outcome of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub batches_dispatched: usize,
    pub batches_succeeded: usize,
    pub batches_partial: usize,
    pub batches_failed: usize,
    pub malformed_responses: usize,
    pub repaired_responses: usize,
    /// Replies fixed by asking the model to correct its own JSON
    pub model_repairs: usize,
    pub rate_limited: usize,
    pub timeouts: usize,
    pub stale_writes: usize,
    pub glossary_conflicts: usize,
    pub terms_added: usize,
    pub tokens_used: usize,
    pub stats: StoreStats,
    pub failed: Vec<FailedSegment>,
    pub stop_reason: StopReason,
}

impl RunReport {
    /// Count a batch that reached a terminal state; others are ignored
    pub fn record_batch(&mut self, state: BatchState) {
        if !state.is_terminal() {
            return;
        }
        match state {
            BatchState::Succeeded => self.batches_succeeded += 1,
            BatchState::Partial => self.batches_partial += 1,
            _ => self.batches_failed += 1,
        }
    }

    /// Fill in totals and the failed list from the final store
    pub fn finish(&mut self, store: &SegmentStore, stop_reason: StopReason) {
        self.stats = store.stats();
        self.stop_reason = stop_reason;
        self.failed = store
            .failed_segments()
            .into_iter()
            .map(|s| FailedSegment {
                id: s.id,
                location: s.page_or_location.clone(),
                retry_count: s.retry_count,
                reason: s.failure_reason.clone().unwrap_or_default(),
            })
            .collect();
    }

    /// Every segment translated
    pub fn is_success(&self) -> bool {
        self.stats.total > 0 && self.stats.translated == self.stats.total
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Segments: {} translated, {} pending, {} failed (of {})",
            self.stats.translated, self.stats.pending, self.stats.failed, self.stats.total
        )?;
        writeln!(
            f,
            "Batches: {} dispatched, {} succeeded, {} partial, {} failed",
            self.batches_dispatched,
            self.batches_succeeded,
            self.batches_partial,
            self.batches_failed
        )?;
        writeln!(
            f,
            "Responses: {} malformed, {} repaired, {} model repairs, {} rate limited, {} timeouts, {} stale writes",
            self.malformed_responses,
            self.repaired_responses,
            self.model_repairs,
            self.rate_limited,
            self.timeouts,
            self.stale_writes
        )?;
        writeln!(
            f,
            "Glossary: {} terms added, {} conflicts kept existing mapping",
            self.terms_added, self.glossary_conflicts
        )?;
        write!(f, "Tokens used: {}", self.tokens_used)?;

        match self.stop_reason {
            StopReason::Completed => {}
            StopReason::TokenBudget => write!(f, "\nStopped: token budget exhausted")?,
            StopReason::Cancelled => write!(f, "\nStopped: cancelled")?,
        }

        for failed in &self.failed {
            write!(
                f,
                "\n  FAILED id {} ({}), {} attempts: {}",
                failed.id, failed.location, failed.retry_count, failed.reason
            )?;
        }
        Ok(())
    }
}

/// Progress of a document, for the `status` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressStats {
    pub document_name: String,
    pub document_hash: String,
    pub persona: String,
    pub stats: StoreStats,
    pub percent: f64,
    pub glossary_size: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressStats {
    pub fn new(metadata: &RunMetadata, store: &SegmentStore, glossary_size: usize) -> Self {
        let stats = store.stats();
        Self {
            document_name: metadata.document_name.clone(),
            document_hash: metadata.document_hash.clone(),
            persona: metadata.persona.clone(),
            percent: stats.percent_translated(),
            stats,
            glossary_size,
            started_at: metadata.created_at,
            updated_at: metadata.updated_at,
        }
    }
}

impl fmt::Display for ProgressStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Document: {} ({})", self.document_name, self.document_hash)?;
        writeln!(f, "Persona: {}", self.persona)?;
        writeln!(
            f,
            "Progress: {:.1}% ({}/{} translated, {} pending, {} in flight, {} failed)",
            self.percent,
            self.stats.translated,
            self.stats.total,
            self.stats.pending,
            self.stats.in_flight,
            self.stats.failed
        )?;
        writeln!(f, "Glossary entries: {}", self.glossary_size)?;
        write!(
            f,
            "Started: {}, last update: {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.updated_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::NewSegment;

    #[test]
    fn test_report_lists_failed_segments() {
        let parsed = vec![
            NewSegment {
                source_text: "One.".to_string(),
                page_or_location: "line 1".to_string(),
            },
            NewSegment {
                source_text: "Two.".to_string(),
                page_or_location: "line 3".to_string(),
            },
        ];
        let mut store = SegmentStore::ingest(parsed, "scholar").unwrap();
        store.mark_in_flight(&[1, 2]).unwrap();
        store.commit_translation(1, "一。").unwrap();
        store.mark_failed(2, "malformed response").unwrap();

        let mut report = RunReport::default();
        report.record_batch(BatchState::Dispatched);
        report.record_batch(BatchState::Partial);
        report.finish(&store, StopReason::Completed);

        assert!(!report.is_success());
        assert_eq!(report.batches_partial, 1);
        assert_eq!(report.batches_failed, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].location, "line 3");
        assert!(report.to_string().contains("FAILED id 2 (line 3)"));

        let progress = ProgressStats::new(
            &RunMetadata::new("h", "book.md", "scholar", "zh"),
            &store,
            0,
        );
        assert_eq!(progress.percent, 50.0);
        assert!(progress.to_string().contains("50.0%"));
    }
}
