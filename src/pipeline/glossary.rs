//! Authoritative term mapping shared by every batch of a document

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::GlossaryEntry;

/// What happened to one suggested term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Added,
    /// Term already present with the same translation
    Unchanged,
    /// Term already present with a different translation; suggestion discarded
    Conflict { existing: String },
    /// Blank term or translation
    Ignored,
}

/// Summary of one `merge` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub conflicts: usize,
}

/// Glossary file contents: a `{term: translation}` map or a list of entries
#[derive(Deserialize)]
#[serde(untagged)]
enum GlossaryFile {
    Map(BTreeMap<String, String>),
    Entries(Vec<GlossaryEntry>),
}

/// Term -> translation mapping; the first recorded mapping always wins
#[derive(Debug, Clone, Default)]
pub struct Glossary {
    entries: Vec<GlossaryEntry>,
    index: HashMap<String, usize>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries, keeping the first of any duplicates
    pub fn from_entries(entries: Vec<GlossaryEntry>) -> Self {
        let mut glossary = Self::new();
        for entry in entries {
            glossary.insert(&entry.term, &entry.translation);
        }
        glossary
    }

    /// Read a user glossary file (JSON)
    pub fn load_file(path: &Path) -> Result<Vec<GlossaryEntry>> {
        let content = std::fs::read_to_string(path).map_err(|e| TranslationError::FileError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let entries = match serde_json::from_str::<GlossaryFile>(&content)? {
            GlossaryFile::Map(map) => map
                .into_iter()
                .map(|(term, translation)| GlossaryEntry::new(term, translation))
                .collect(),
            GlossaryFile::Entries(entries) => entries,
        };

        debug!("Read {} glossary entries from {}", entries.len(), path.display());
        Ok(entries)
    }

    /// Add user-provided entries; existing mappings still win
    pub fn seed(&mut self, entries: impl IntoIterator<Item = GlossaryEntry>) -> MergeSummary {
        let summary = self.merge(entries.into_iter().map(|e| (e.term, e.translation)));
        if summary.added > 0 {
            info!("Seeded glossary with {} entries", summary.added);
        }
        summary
    }

    pub fn get(&self, term: &str) -> Option<&str> {
        self.index
            .get(term.trim())
            .map(|&i| self.entries[i].translation.as_str())
    }

    /// Record a term unless it is already known
    pub fn insert(&mut self, term: &str, translation: &str) -> MergeOutcome {
        let term = term.trim();
        let translation = translation.trim();
        if term.is_empty() || translation.is_empty() {
            return MergeOutcome::Ignored;
        }

        match self.index.get(term) {
            Some(&i) if self.entries[i].translation == translation => MergeOutcome::Unchanged,
            Some(&i) => MergeOutcome::Conflict {
                existing: self.entries[i].translation.clone(),
            },
            None => {
                self.index.insert(term.to_string(), self.entries.len());
                self.entries.push(GlossaryEntry::new(term, translation));
                MergeOutcome::Added
            }
        }
    }

    /// Merge terms extracted from a batch response
    pub fn merge(&mut self, terms: impl IntoIterator<Item = (String, String)>) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for (term, translation) in terms {
            match self.insert(&term, &translation) {
                MergeOutcome::Added => summary.added += 1,
                MergeOutcome::Conflict { existing } => {
                    summary.conflicts += 1;
                    warn!(
                        "Glossary conflict for {:?}: keeping {:?}, discarding {:?}",
                        term.trim(),
                        existing,
                        translation.trim()
                    );
                }
                MergeOutcome::Unchanged | MergeOutcome::Ignored => {}
            }
        }

        summary
    }

    /// Entries whose term occurs in `text`, in insertion order
    pub fn relevant_to(&self, text: &str) -> Vec<GlossaryEntry> {
        self.entries
            .iter()
            .filter(|e| text.contains(e.term.as_str()))
            .cloned()
            .collect()
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[GlossaryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
