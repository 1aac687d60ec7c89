//! Groups pending segments into contiguous, size-bounded batches

use crate::core::config::TranslatorConfig;
use crate::core::models::{Segment, SegmentId};
use crate::core::persona::Persona;
use crate::pipeline::store::SegmentStore;

/// Size limits for one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_segments: usize,
    pub max_chars: usize,
    /// Characters the provider can take for items, after prompt overhead
    pub context_ceiling: usize,
}

impl BatchLimits {
    pub fn from_config(config: &TranslatorConfig, persona: &Persona) -> Self {
        Self {
            max_segments: config.max_batch_segments,
            max_chars: persona.max_batch_chars.unwrap_or(config.max_batch_chars),
            context_ceiling: config
                .provider_context_chars
                .saturating_sub(config.prompt_overhead_chars),
        }
    }

    /// Character budget actually enforced
    pub fn char_budget(&self) -> usize {
        self.max_chars.min(self.context_ceiling)
    }
}

/// A planned batch: ids contiguous in `order_index`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub member_ids: Vec<SegmentId>,
    pub total_chars: usize,
}

impl BatchPlan {
    fn push(&mut self, segment: &Segment) {
        self.member_ids.push(segment.id);
        self.total_chars += segment.char_len();
    }

    pub fn first(&self) -> Option<SegmentId> {
        self.member_ids.first().copied()
    }

    pub fn len(&self) -> usize {
        self.member_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.member_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    limits: BatchLimits,
}

impl Partitioner {
    pub fn new(limits: BatchLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Plan up to `max_batches` batches from PENDING segments.
    ///
    /// A batch ends at a limit, at a gap in document order (a segment that
    /// is not PENDING), or at a segment rejected by `eligible`. A single
    /// segment over the budget still forms its own batch.
    pub fn plan<F>(&self, store: &SegmentStore, eligible: F, max_batches: usize) -> Vec<BatchPlan>
    where
        F: Fn(&Segment) -> bool,
    {
        let budget = self.limits.char_budget();
        let mut batches = Vec::new();
        let mut current = BatchPlan::default();
        let mut last_position: Option<usize> = None;

        if max_batches == 0 {
            return batches;
        }

        for segment in store.get_pending(usize::MAX) {
            let position = store.position(segment.id);
            let contiguous = matches!(
                (last_position, position),
                (Some(last), Some(pos)) if pos == last + 1
            );

            if !eligible(segment) {
                last_position = None;
                if !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                }
            } else {
                let full = current.len() >= self.limits.max_segments
                    || current.total_chars + segment.char_len() > budget;

                if !current.is_empty() && (!contiguous || full) {
                    batches.push(std::mem::take(&mut current));
                }

                current.push(segment);
                last_position = position;
            }

            if batches.len() >= max_batches {
                return batches;
            }
        }

        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::NewSegment;

    fn store(texts: &[&str]) -> SegmentStore {
        let parsed = texts
            .iter()
            .map(|t| NewSegment {
                source_text: t.to_string(),
                page_or_location: String::new(),
            })
            .collect();
        SegmentStore::ingest(parsed, "scholar").unwrap()
    }

    fn limits(max_segments: usize, max_chars: usize) -> BatchLimits {
        BatchLimits {
            max_segments,
            max_chars,
            context_ceiling: usize::MAX,
        }
    }

    fn ids(plans: &[BatchPlan]) -> Vec<Vec<SegmentId>> {
        plans.iter().map(|p| p.member_ids.clone()).collect()
    }

    #[test]
    fn test_segment_count_limit() {
        let store = store(&["a", "b", "c", "d", "e"]);
        let plans = Partitioner::new(limits(2, 100)).plan(&store, |_| true, usize::MAX);
        assert_eq!(ids(&plans), vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[test]
    fn test_char_budget_and_oversize_segment() {
        let store = store(&["aaaa", "bbbbbbbbbbbb", "cc", "dd"]);
        let plans = Partitioner::new(limits(10, 6)).plan(&store, |_| true, usize::MAX);
        assert_eq!(ids(&plans), vec![vec![1], vec![2], vec![3, 4]]);
        assert_eq!(plans[1].total_chars, 12);
    }

    #[test]
    fn test_provider_ceiling_caps_budget() {
        let limits = BatchLimits {
            max_segments: 10,
            max_chars: 100,
            context_ceiling: 4,
        };
        assert_eq!(limits.char_budget(), 4);

        let store = store(&["aa", "bb", "cc"]);
        let plans = Partitioner::new(limits).plan(&store, |_| true, usize::MAX);
        assert_eq!(ids(&plans), vec![vec![1, 2], vec![3]]);
    }

    #[test]
    fn test_batches_never_span_gaps() {
        let mut store = store(&["a", "b", "c", "d", "e"]);
        store.mark_in_flight(&[3]).unwrap();

        let plans = Partitioner::new(limits(10, 100)).plan(&store, |_| true, usize::MAX);
        assert_eq!(ids(&plans), vec![vec![1, 2], vec![4, 5]]);

        // Ineligible segments (e.g. backing off) also split batches
        store.release(&[3]).unwrap();
        let plans = Partitioner::new(limits(10, 100)).plan(&store, |s| s.id != 2, usize::MAX);
        assert_eq!(ids(&plans), vec![vec![1], vec![3, 4, 5]]);
    }

    #[test]
    fn test_max_batches() {
        let store = store(&["a", "b", "c", "d"]);
        let plans = Partitioner::new(limits(1, 100)).plan(&store, |_| true, 2);
        assert_eq!(ids(&plans), vec![vec![1], vec![2]]);
        assert!(Partitioner::new(limits(1, 100))
            .plan(&store, |_| true, 0)
            .is_empty());
    }
}
