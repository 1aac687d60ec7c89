//! Trailing context for a batch about to be dispatched

use crate::core::models::{SegmentId, SegmentStatus};
use crate::core::persona::Persona;
use crate::pipeline::store::SegmentStore;

/// Builds bounded continuity context from preceding segments
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    max_segments: usize,
    char_budget: usize,
}

impl ContextBuilder {
    pub fn new(max_segments: usize, char_budget: usize) -> Self {
        Self {
            max_segments,
            char_budget,
        }
    }

    pub fn for_persona(persona: &Persona) -> Self {
        Self::new(
            persona.context_len.segments(),
            persona.context_len.char_budget(),
        )
    }

    /// Context for a batch starting at `first_member`.
    ///
    /// Uses up to K immediately preceding TRANSLATED segments; if the
    /// neighbour is not translated yet, falls back to its source text.
    pub fn build(&self, store: &SegmentStore, first_member: SegmentId) -> String {
        let Some(start) = store.position(first_member) else {
            return String::new();
        };
        if start == 0 || self.max_segments == 0 || self.char_budget == 0 {
            return String::new();
        }

        let segments = store.segments();
        let mut parts: Vec<&str> = segments[..start]
            .iter()
            .rev()
            .take(self.max_segments)
            .map_while(|s| match (s.status, s.translation.as_deref()) {
                (SegmentStatus::Translated, Some(text)) => Some(text),
                _ => None,
            })
            .collect();

        if parts.is_empty() {
            parts.push(segments[start - 1].source_text.as_str());
        }
        parts.reverse();

        tail_chars(&parts.join("\n\n"), self.char_budget)
    }
}

/// Last `budget` characters of `text`
fn tail_chars(text: &str, budget: usize) -> String {
    let count = text.chars().count();
    if count <= budget {
        return text.to_string();
    }
    text.chars().skip(count - budget).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::NewSegment;

    fn store() -> SegmentStore {
        let parsed = ["Alpha.", "Beta.", "Gamma.", "Delta."]
            .iter()
            .map(|s| NewSegment {
                source_text: s.to_string(),
                page_or_location: String::new(),
            })
            .collect();
        SegmentStore::ingest(parsed, "scholar").unwrap()
    }

    #[test]
    fn test_first_segment_has_no_context() {
        assert_eq!(ContextBuilder::new(3, 100).build(&store(), 1), "");
    }

    #[test]
    fn test_uses_contiguous_translations() {
        let mut store = store();
        store.mark_in_flight(&[1, 2]).unwrap();
        store.commit_translation(1, "阿尔法。").unwrap();
        store.commit_translation(2, "贝塔。").unwrap();

        let context = ContextBuilder::new(3, 100).build(&store, 3);
        assert_eq!(context, "阿尔法。\n\n贝塔。");

        // Only K segments are considered
        let context = ContextBuilder::new(1, 100).build(&store, 3);
        assert_eq!(context, "贝塔。");
    }

    #[test]
    fn test_falls_back_to_source_of_neighbour() {
        let mut store = store();
        store.mark_in_flight(&[1]).unwrap();
        store.commit_translation(1, "阿尔法。").unwrap();

        // Segment 3 is still pending, so batch at 4 sees Gamma's source
        assert_eq!(ContextBuilder::new(3, 100).build(&store, 4), "Gamma.");
    }

    #[test]
    fn test_truncates_from_front() {
        let mut store = store();
        store.mark_in_flight(&[1]).unwrap();
        store.commit_translation(1, "一二三四五六").unwrap();
        assert_eq!(ContextBuilder::new(3, 4).build(&store, 2), "三四五六");
    }
}
