//! Core data models for translation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable segment identifier, assigned at ingestion
pub type SegmentId = u64;

/// Correlation id of a dispatched batch, only meaningful within one run
pub type BatchId = u64;

/// Lifecycle status of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentStatus {
    /// Waiting to be claimed by a batch
    Pending,
    /// Claimed by exactly one dispatched batch
    InFlight,
    /// Translation committed
    Translated,
    /// Retry budget exhausted (terminal until an explicit reset)
    Failed,
}

impl SegmentStatus {
    /// Whether the store accepts `self -> next`.
    ///
    /// `InFlight -> Pending` is the release edge used when a claimed segment
    /// goes back to the pool without a translation.
    pub fn can_transition_to(self, next: SegmentStatus) -> bool {
        use SegmentStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Translated)
                | (InFlight, Failed)
                | (InFlight, Pending)
                | (Failed, Pending)
        )
    }

    /// Whether the segment still needs work in this run
    pub fn is_open(self) -> bool {
        matches!(self, SegmentStatus::Pending | SegmentStatus::InFlight)
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentStatus::Pending => write!(f, "PENDING"),
            SegmentStatus::InFlight => write!(f, "IN_FLIGHT"),
            SegmentStatus::Translated => write!(f, "TRANSLATED"),
            SegmentStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// The atomic translation unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub order_index: u64,
    pub source_text: String,
    pub translation: Option<String>,
    pub status: SegmentStatus,
    pub retry_count: u32,
    pub page_or_location: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Segment {
    /// Fresh PENDING segment
    pub fn new(
        id: SegmentId,
        order_index: u64,
        source_text: impl Into<String>,
        page_or_location: impl Into<String>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            id,
            order_index,
            source_text: source_text.into(),
            translation: None,
            status: SegmentStatus::Pending,
            retry_count: 0,
            page_or_location: page_or_location.into(),
            mode: mode.into(),
            failure_reason: None,
        }
    }

    /// Character count used for batch budgeting
    pub fn char_len(&self) -> usize {
        self.source_text.chars().count()
    }
}

/// Parser output: one segment as produced by ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSegment {
    pub source_text: String,
    pub page_or_location: String,
}

/// A parsed source document, ready for ingestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub name: String,
    /// SHA-256 of the file bytes, hex encoded
    pub hash: String,
    pub segments: Vec<NewSegment>,
}

/// One fixed term mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub term: String,
    pub translation: String,
}

impl GlossaryEntry {
    pub fn new(term: impl Into<String>, translation: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            translation: translation.into(),
        }
    }
}

/// `{id, text}` pair sent to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: SegmentId,
    pub text: String,
}

/// What a request asks the provider to produce
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestTask {
    /// Translate `items` into a JSON array
    #[default]
    Translate,
    /// Build a term -> translation map from already translated pairs
    ExtractGlossary { sample: String },
    /// Fix a reply to the same batch that failed validation
    RepairJson { broken: String, error: String },
}

/// Translation request for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub batch_id: BatchId,
    pub persona: String,
    pub instructions: String,
    pub glossary: Vec<GlossaryEntry>,
    pub context: String,
    pub items: Vec<SourceItem>,
    pub source_lang: Option<String>,
    pub target_lang: String,
    pub extract_terms: bool,
    #[serde(default)]
    pub task: RequestTask,
}

impl TranslationRequest {
    pub fn new(batch_id: BatchId, items: Vec<SourceItem>, target_lang: impl Into<String>) -> Self {
        Self {
            batch_id,
            persona: String::new(),
            instructions: String::new(),
            glossary: Vec::new(),
            context: String::new(),
            items,
            source_lang: None,
            target_lang: target_lang.into(),
            extract_terms: false,
            task: RequestTask::Translate,
        }
    }

    /// Glossary extraction over `sample`; carries no items
    pub fn glossary_extraction(
        batch_id: BatchId,
        sample: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        let mut request = Self::new(batch_id, Vec::new(), target_lang);
        request.task = RequestTask::ExtractGlossary {
            sample: sample.into(),
        };
        request
    }

    /// Same batch again, asking the model to fix its previous reply
    pub fn repair(&self, broken: impl Into<String>, error: impl Into<String>) -> Self {
        let mut request = self.clone();
        request.task = RequestTask::RepairJson {
            broken: broken.into(),
            error: error.into(),
        };
        request
    }

    pub fn with_source_lang(mut self, source_lang: Option<String>) -> Self {
        self.source_lang = source_lang;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_glossary(mut self, glossary: Vec<GlossaryEntry>) -> Self {
        self.glossary = glossary;
        self
    }

    pub fn with_persona(
        mut self,
        persona: impl Into<String>,
        instructions: impl Into<String>,
        extract_terms: bool,
    ) -> Self {
        self.persona = persona.into();
        self.instructions = instructions.into();
        self.extract_terms = extract_terms;
        self
    }

    /// Member ids in dispatch order
    pub fn member_ids(&self) -> Vec<SegmentId> {
        self.items.iter().map(|item| item.id).collect()
    }
}

/// Raw provider answer, before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub raw_text: String,
    pub tokens_used: usize,
    pub model_used: String,
    pub request_id: Option<String>,
}

/// Token usage tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub budget: Option<usize>,
    pub used: usize,
    pub requests: usize,
    pub started_at: DateTime<Utc>,
}

impl TokenUsage {
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            budget,
            used: 0,
            requests: 0,
            started_at: Utc::now(),
        }
    }

    pub fn remaining(&self) -> Option<usize> {
        self.budget.map(|b| b.saturating_sub(self.used))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    pub fn record(&mut self, tokens: usize) {
        self.used += tokens;
        self.requests += 1;
    }
}

/// Run metadata stored with every checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub document_hash: String,
    pub document_name: String,
    pub persona: String,
    pub source_lang: Option<String>,
    pub target_lang: String,
    /// Glossary preamble pass already ran for this document
    #[serde(default)]
    pub glossary_extracted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunMetadata {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn new(
        document_hash: impl Into<String>,
        document_name: impl Into<String>,
        persona: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            document_hash: document_hash.into(),
            document_name: document_name.into(),
            persona: persona.into(),
            source_lang: None,
            target_lang: target_lang.into(),
            glossary_extracted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use SegmentStatus::*;
        let all = [Pending, InFlight, Translated, Failed];
        let allowed = [
            (Pending, InFlight),
            (InFlight, Translated),
            (InFlight, Failed),
            (InFlight, Pending),
            (Failed, Pending),
        ];

        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_status_serializes_screaming_case() {
        let json = serde_json::to_string(&SegmentStatus::InFlight).unwrap();
        assert_eq!(json, "\"IN_FLIGHT\"");
    }

    #[test]
    fn test_token_usage_budget() {
        let mut usage = TokenUsage::new(Some(100));
        usage.record(60);
        assert_eq!(usage.remaining(), Some(40));
        usage.record(60);
        assert!(usage.is_exhausted());

        let unlimited = TokenUsage::new(None);
        assert!(!unlimited.is_exhausted());
    }
}
