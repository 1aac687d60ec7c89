//! Segment store: the only owner of segment lifecycle transitions

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{NewSegment, RunMetadata, Segment, SegmentId, SegmentStatus};
use crate::pipeline::checkpoint::Checkpoint;
use crate::pipeline::glossary::Glossary;

/// Result of a successful `commit_translation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The segment moved to TRANSLATED
    Committed,
    /// Same text was already committed; nothing changed
    AlreadyCommitted,
}

/// Segment counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub translated: usize,
    pub failed: usize,
}

impl StoreStats {
    /// Share of segments already translated, in percent
    pub fn percent_translated(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.translated as f64 * 100.0 / self.total as f64
        }
    }
}

/// Ordered collection of segments with validated transitions
#[derive(Debug, Clone)]
pub struct SegmentStore {
    segments: Vec<Segment>,
    index: HashMap<SegmentId, usize>,
}

impl SegmentStore {
    /// Build a store from segments listed in document order.
    ///
    /// Ids must be unique and `order_index` must strictly increase.
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self> {
        let mut index = HashMap::with_capacity(segments.len());

        for (position, segment) in segments.iter().enumerate() {
            if index.insert(segment.id, position).is_some() {
                return Err(TranslationError::InvalidDocument {
                    message: format!("duplicate segment id {}", segment.id),
                });
            }

            if position > 0 && segment.order_index <= segments[position - 1].order_index {
                return Err(TranslationError::InvalidDocument {
                    message: format!(
                        "order_index of segment {} does not increase ({} after {})",
                        segment.id,
                        segment.order_index,
                        segments[position - 1].order_index
                    ),
                });
            }

            if segment.status == SegmentStatus::Translated && segment.translation.is_none() {
                return Err(TranslationError::InvalidDocument {
                    message: format!("segment {} is TRANSLATED without a translation", segment.id),
                });
            }
        }

        Ok(Self { segments, index })
    }

    /// Fresh store from parser output; ids and order start at 1
    pub fn ingest(parsed: Vec<NewSegment>, mode: &str) -> Result<Self> {
        if parsed.is_empty() {
            return Err(TranslationError::InvalidDocument {
                message: "document contains no translatable text".to_string(),
            });
        }

        let segments = parsed
            .into_iter()
            .enumerate()
            .map(|(i, new)| {
                let id = i as SegmentId + 1;
                Segment::new(id, id, new.source_text, new.page_or_location, mode)
            })
            .collect();

        Self::from_segments(segments)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.index.get(&id).map(|&position| &self.segments[position])
    }

    /// Position of a segment in document order
    pub fn position(&self, id: SegmentId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    /// All segments in `order_index` order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Up to `limit` PENDING segments in `order_index` order
    pub fn get_pending(&self, limit: usize) -> Vec<&Segment> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Pending)
            .take(limit)
            .collect()
    }

    fn segment_mut(&mut self, id: SegmentId) -> Result<&mut Segment> {
        match self.index.get(&id) {
            Some(&position) => Ok(&mut self.segments[position]),
            None => Err(TranslationError::UnknownSegment { id }),
        }
    }

    /// Check that `id` may move to `next` without changing anything
    fn check_transition(&self, id: SegmentId, next: SegmentStatus) -> Result<()> {
        let segment = self.get(id).ok_or(TranslationError::UnknownSegment { id })?;
        if segment.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(TranslationError::ConflictError {
                id,
                status: segment.status,
            })
        }
    }

    /// Claim segments for one batch; all or nothing
    pub fn mark_in_flight(&mut self, ids: &[SegmentId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(ids.len());
        for &id in ids {
            if !seen.insert(id) {
                return Err(TranslationError::ConflictError {
                    id,
                    status: SegmentStatus::InFlight,
                });
            }
            self.check_transition(id, SegmentStatus::InFlight)?;
        }

        for &id in ids {
            self.segment_mut(id)?.status = SegmentStatus::InFlight;
        }
        Ok(())
    }

    /// Commit a translation for an IN_FLIGHT segment.
    ///
    /// Re-committing identical text is a no-op; different text for an
    /// already TRANSLATED segment is rejected and the original kept.
    pub fn commit_translation(&mut self, id: SegmentId, text: &str) -> Result<CommitOutcome> {
        let segment = self.segment_mut(id)?;

        match segment.status {
            SegmentStatus::InFlight => {
                segment.status = SegmentStatus::Translated;
                segment.translation = Some(text.to_string());
                segment.failure_reason = None;
                Ok(CommitOutcome::Committed)
            }
            SegmentStatus::Translated => {
                if segment.translation.as_deref() == Some(text) {
                    debug!("Segment {} already committed with the same text", id);
                    Ok(CommitOutcome::AlreadyCommitted)
                } else {
                    warn!("Stale write rejected for segment {}, keeping original", id);
                    Err(TranslationError::StaleWriteError { id })
                }
            }
            status => Err(TranslationError::ConflictError { id, status }),
        }
    }

    /// Move an IN_FLIGHT segment to FAILED
    pub fn mark_failed(&mut self, id: SegmentId, reason: &str) -> Result<()> {
        self.check_transition(id, SegmentStatus::Failed)?;
        let segment = self.segment_mut(id)?;
        segment.status = SegmentStatus::Failed;
        segment.failure_reason = Some(reason.to_string());
        warn!("Segment {} failed: {}", id, reason);
        Ok(())
    }

    /// Count a failed attempt for an IN_FLIGHT segment.
    ///
    /// The segment returns to PENDING, or becomes FAILED once its
    /// `retry_count` exceeds `max_retries`. Returns the new status.
    pub fn record_attempt_failure(
        &mut self,
        id: SegmentId,
        reason: &str,
        max_retries: u32,
    ) -> Result<SegmentStatus> {
        self.check_transition(id, SegmentStatus::Pending)?;
        let segment = self.segment_mut(id)?;
        segment.retry_count += 1;
        segment.failure_reason = Some(reason.to_string());

        if segment.retry_count > max_retries {
            let reason = format!("retries exhausted after {} attempts: {}", segment.retry_count, reason);
            self.mark_failed(id, &reason)?;
            Ok(SegmentStatus::Failed)
        } else {
            segment.status = SegmentStatus::Pending;
            Ok(SegmentStatus::Pending)
        }
    }

    /// Return claimed segments to PENDING without counting an attempt
    pub fn release(&mut self, ids: &[SegmentId]) -> Result<()> {
        for &id in ids {
            self.check_transition(id, SegmentStatus::Pending)?;
        }
        for &id in ids {
            self.segment_mut(id)?.status = SegmentStatus::Pending;
        }
        Ok(())
    }

    /// Explicit retry reset: FAILED -> PENDING with a cleared `retry_count`.
    ///
    /// `None` resets every FAILED segment; named ids must all be FAILED.
    pub fn reset_failed(&mut self, ids: Option<&[SegmentId]>) -> Result<Vec<SegmentId>> {
        let targets: Vec<SegmentId> = match ids {
            Some(ids) => {
                for &id in ids {
                    let segment = self.get(id).ok_or(TranslationError::UnknownSegment { id })?;
                    if segment.status != SegmentStatus::Failed {
                        return Err(TranslationError::ConflictError {
                            id,
                            status: segment.status,
                        });
                    }
                }
                ids.to_vec()
            }
            None => self
                .segments
                .iter()
                .filter(|s| s.status == SegmentStatus::Failed)
                .map(|s| s.id)
                .collect(),
        };

        for &id in &targets {
            let segment = self.segment_mut(id)?;
            segment.status = SegmentStatus::Pending;
            segment.retry_count = 0;
            segment.failure_reason = None;
        }

        if !targets.is_empty() {
            info!("Reset {} failed segments to PENDING", targets.len());
        }
        Ok(targets)
    }

    /// FAILED segments still within `max_retries` go back to PENDING with
    /// their `retry_count` kept, so a larger budget on resume retries them
    pub fn revive_failed(&mut self, max_retries: u32) -> Vec<SegmentId> {
        let mut revived = Vec::new();
        for segment in &mut self.segments {
            if segment.status == SegmentStatus::Failed && segment.retry_count <= max_retries {
                segment.status = SegmentStatus::Pending;
                segment.failure_reason = None;
                revived.push(segment.id);
            }
        }

        if !revived.is_empty() {
            info!(
                "Revived {} failed segments within the retry budget of {}",
                revived.len(),
                max_retries
            );
        }
        revived
    }

    /// Charge one attempt to every IN_FLIGHT member without releasing it.
    ///
    /// All-or-nothing: returns `false` and changes nothing when any member
    /// would exceed `max_retries`.
    pub fn charge_attempt(&mut self, ids: &[SegmentId], reason: &str, max_retries: u32) -> Result<bool> {
        for &id in ids {
            let segment = self.get(id).ok_or(TranslationError::UnknownSegment { id })?;
            if segment.status != SegmentStatus::InFlight {
                return Err(TranslationError::ConflictError {
                    id,
                    status: segment.status,
                });
            }
            if segment.retry_count + 1 > max_retries {
                return Ok(false);
            }
        }

        for &id in ids {
            let segment = self.segment_mut(id)?;
            segment.retry_count += 1;
            segment.failure_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    /// Whether any of the first `limit` segments (document order) is PENDING
    pub fn has_pending_within(&self, limit: usize) -> bool {
        self.segments
            .iter()
            .take(limit)
            .any(|s| s.status == SegmentStatus::Pending)
    }

    /// Startup recovery scan: every IN_FLIGHT segment goes back to PENDING
    pub fn recover_in_flight(&mut self) -> Vec<SegmentId> {
        let mut recovered = Vec::new();
        for segment in &mut self.segments {
            if segment.status == SegmentStatus::InFlight {
                segment.status = SegmentStatus::Pending;
                recovered.push(segment.id);
            }
        }

        if !recovered.is_empty() {
            info!("Recovered {} in-flight segments to PENDING", recovered.len());
        }
        recovered
    }

    /// No segment is PENDING or IN_FLIGHT
    pub fn is_complete(&self) -> bool {
        !self.segments.iter().any(|s| s.status.is_open())
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total: self.segments.len(),
            ..Default::default()
        };
        for segment in &self.segments {
            match segment.status {
                SegmentStatus::Pending => stats.pending += 1,
                SegmentStatus::InFlight => stats.in_flight += 1,
                SegmentStatus::Translated => stats.translated += 1,
                SegmentStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    pub fn failed_segments(&self) -> Vec<&Segment> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Failed)
            .collect()
    }

    /// Ids currently claimed by a batch
    pub fn in_flight_ids(&self) -> Vec<SegmentId> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::InFlight)
            .map(|s| s.id)
            .collect()
    }

    /// Self-consistent copy of store and glossary for persistence
    pub fn snapshot(&self, metadata: &RunMetadata, glossary: &Glossary) -> Checkpoint {
        Checkpoint::new(
            metadata.clone(),
            self.segments.clone(),
            glossary.entries().to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(n: usize) -> SegmentStore {
        let parsed = (1..=n)
            .map(|i| NewSegment {
                source_text: format!("Sentence {}.", i),
                page_or_location: format!("line {}", i),
            })
            .collect();
        SegmentStore::ingest(parsed, "scholar").unwrap()
    }

    #[test]
    fn test_ingest_assigns_ids_in_order() {
        let store = store(3);
        let ids: Vec<_> = store.segments().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store.segments().iter().all(|s| s.status == SegmentStatus::Pending));
        assert!(store.segments().iter().all(|s| s.retry_count == 0));
    }

    #[test]
    fn test_rejects_non_increasing_order() {
        let segments = vec![
            Segment::new(1, 5, "a", "", "m"),
            Segment::new(2, 5, "b", "", "m"),
        ];
        assert!(matches!(
            SegmentStore::from_segments(segments),
            Err(TranslationError::InvalidDocument { .. })
        ));

        let segments = vec![Segment::new(1, 1, "a", "", "m"), Segment::new(1, 2, "b", "", "m")];
        assert!(SegmentStore::from_segments(segments).is_err());
    }

    #[test]
    fn test_commit_requires_in_flight() {
        let mut store = store(2);
        assert!(matches!(
            store.commit_translation(1, "一"),
            Err(TranslationError::ConflictError {
                id: 1,
                status: SegmentStatus::Pending
            })
        ));

        store.mark_in_flight(&[1]).unwrap();
        assert_eq!(store.commit_translation(1, "一").unwrap(), CommitOutcome::Committed);
        assert_eq!(store.get(1).unwrap().translation.as_deref(), Some("一"));
    }

    #[test]
    fn test_commit_is_idempotent_and_rejects_stale_writes() {
        let mut store = store(1);
        store.mark_in_flight(&[1]).unwrap();
        store.commit_translation(1, "你好").unwrap();

        assert_eq!(
            store.commit_translation(1, "你好").unwrap(),
            CommitOutcome::AlreadyCommitted
        );
        assert!(matches!(
            store.commit_translation(1, "您好"),
            Err(TranslationError::StaleWriteError { id: 1 })
        ));
        assert_eq!(store.get(1).unwrap().translation.as_deref(), Some("你好"));
    }

    #[test]
    fn test_claim_is_exclusive_and_atomic() {
        let mut store = store(3);
        store.mark_in_flight(&[2]).unwrap();

        // 1 is claimable but 2 is not: nothing changes
        assert!(store.mark_in_flight(&[1, 2]).is_err());
        assert_eq!(store.get(1).unwrap().status, SegmentStatus::Pending);

        assert!(store.mark_in_flight(&[3, 3]).is_err());
        assert_eq!(store.get(3).unwrap().status, SegmentStatus::Pending);
    }

    #[test]
    fn test_attempt_failures_exhaust_to_failed() {
        let mut store = store(1);
        for attempt in 1..=2 {
            store.mark_in_flight(&[1]).unwrap();
            let status = store.record_attempt_failure(1, "timeout", 2).unwrap();
            assert_eq!(status, SegmentStatus::Pending);
            assert_eq!(store.get(1).unwrap().retry_count, attempt);
        }

        store.mark_in_flight(&[1]).unwrap();
        let status = store.record_attempt_failure(1, "timeout", 2).unwrap();
        assert_eq!(status, SegmentStatus::Failed);
        assert!(store.is_complete());
        assert_eq!(store.failed_segments().len(), 1);
        assert!(store.get(1).unwrap().failure_reason.as_deref().unwrap().contains("timeout"));
    }

    #[test]
    fn test_failed_only_returns_via_reset() {
        let mut store = store(2);
        store.mark_in_flight(&[1]).unwrap();
        store.mark_failed(1, "auth").unwrap();

        assert!(store.mark_in_flight(&[1]).is_err());
        assert!(store.release(&[1]).is_err());
        assert!(matches!(
            store.reset_failed(Some(&[2])),
            Err(TranslationError::ConflictError { id: 2, .. })
        ));

        assert_eq!(store.reset_failed(None).unwrap(), vec![1]);
        let segment = store.get(1).unwrap();
        assert_eq!(segment.status, SegmentStatus::Pending);
        assert_eq!(segment.retry_count, 0);
        assert!(segment.failure_reason.is_none());
    }

    #[test]
    fn test_recover_in_flight() {
        let mut store = store(3);
        store.mark_in_flight(&[1, 2]).unwrap();
        store.commit_translation(1, "一").unwrap();

        assert_eq!(store.recover_in_flight(), vec![2]);
        let stats = store.stats();
        assert_eq!(stats.translated, 1);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(store.get_pending(10).len(), 2);
        assert_eq!(store.get_pending(1)[0].id, 2);
    }

    #[test]
    fn test_revive_failed_within_budget() {
        let mut store = store(2);
        store.mark_in_flight(&[1, 2]).unwrap();
        assert_eq!(
            store.record_attempt_failure(1, "malformed", 0).unwrap(),
            SegmentStatus::Failed
        );
        store.mark_failed(2, "retry time budget exhausted").unwrap();

        // Same budget: segment 1 stays FAILED, segment 2 never used its retries
        assert_eq!(store.revive_failed(0), vec![2]);
        assert_eq!(store.get(1).unwrap().status, SegmentStatus::Failed);

        assert_eq!(store.revive_failed(5), vec![1]);
        let segment = store.get(1).unwrap();
        assert_eq!(segment.status, SegmentStatus::Pending);
        assert_eq!(segment.retry_count, 1);
        assert!(segment.failure_reason.is_none());
    }

    #[test]
    fn test_charge_attempt_is_all_or_nothing() {
        let mut store = store(3);
        store.mark_in_flight(&[1, 2]).unwrap();

        assert!(store.charge_attempt(&[1, 2], "repair", 1).unwrap());
        assert_eq!(store.get(1).unwrap().status, SegmentStatus::InFlight);
        assert_eq!(store.get(2).unwrap().retry_count, 1);

        assert!(!store.charge_attempt(&[1, 2], "repair", 1).unwrap());
        assert_eq!(store.get(1).unwrap().retry_count, 1);

        assert!(matches!(
            store.charge_attempt(&[3], "repair", 5),
            Err(TranslationError::ConflictError { id: 3, .. })
        ));
    }

    #[test]
    fn test_has_pending_within() {
        let mut store = store(3);
        store.mark_in_flight(&[1]).unwrap();
        assert!(!store.has_pending_within(1));
        assert!(store.has_pending_within(2));
        assert!(store.has_pending_within(usize::MAX));
    }

    #[test]
    fn test_unknown_segment() {
        let mut store = store(1);
        assert!(matches!(
            store.mark_in_flight(&[42]),
            Err(TranslationError::UnknownSegment { id: 42 })
        ));
    }
}
