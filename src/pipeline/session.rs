//! Opens the working state for one document
//!
//! Every fatal check (configuration, persona, glossary file, document
//! identity) runs before the store is touched, so a rejected run leaves no
//! partial checkpoint behind.

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{GlossaryEntry, RunMetadata, SegmentId, SourceDocument};
use crate::core::persona::{load_personas, Persona};
use crate::pipeline::checkpoint::CheckpointWriter;
use crate::pipeline::glossary::Glossary;
use crate::pipeline::report::ProgressStats;
use crate::pipeline::store::SegmentStore;

/// Store, glossary and checkpoint location of one document
#[derive(Debug)]
pub struct Session {
    pub(crate) store: SegmentStore,
    pub(crate) glossary: Glossary,
    pub(crate) metadata: RunMetadata,
    pub(crate) writer: CheckpointWriter,
    persona_id: String,
    persona: Persona,
    resumed: bool,
    recovered: Vec<SegmentId>,
}

/// Persona table and glossary seed, resolved before any state is created
fn resolve_policy(config: &TranslatorConfig) -> Result<(BTreeMap<String, Persona>, Vec<GlossaryEntry>)> {
    config.validate()?;

    let personas = load_personas(config.personas_path.as_deref())?;
    // The configured persona must exist even when a checkpoint overrides it
    config.resolve_persona(&personas)?;

    let seed = match &config.glossary_path {
        Some(path) => Glossary::load_file(path)?,
        None => Vec::new(),
    };

    Ok((personas, seed))
}

fn checkpoint_persona(personas: &BTreeMap<String, Persona>, persona_id: &str) -> Result<Persona> {
    personas.get(persona_id).cloned().ok_or_else(|| {
        TranslationError::config(format!(
            "Checkpoint was written with unknown persona '{}'",
            persona_id
        ))
    })
}

impl Session {
    /// Resume the document's checkpoint, or start fresh from `document`.
    ///
    /// On resume any IN_FLIGHT segment left by a previous process goes
    /// back to PENDING, FAILED segments still within `max_retries` are
    /// retried, and the persona recorded in the checkpoint wins over the
    /// configured one.
    pub fn open(config: &TranslatorConfig, document: SourceDocument) -> Result<Self> {
        let (personas, seed) = resolve_policy(config)?;
        let writer = CheckpointWriter::new(config.document_dir(&document.hash));

        let mut session = match writer.load()? {
            Some(checkpoint) => {
                if checkpoint.metadata.document_hash != document.hash {
                    return Err(TranslationError::DocumentMismatch {
                        expected: document.hash,
                        found: checkpoint.metadata.document_hash,
                    });
                }

                let persona_id = checkpoint.metadata.persona.clone();
                let persona = checkpoint_persona(&personas, &persona_id)?;
                if persona_id != config.persona {
                    warn!(
                        "Checkpoint was translated with persona '{}', ignoring configured '{}'",
                        persona_id, config.persona
                    );
                }

                let mut store = SegmentStore::from_segments(checkpoint.segments)?;
                let recovered = store.recover_in_flight();
                store.revive_failed(config.max_retries);
                let stats = store.stats();
                info!(
                    "Resuming {}: {}/{} translated, {} failed",
                    document.name, stats.translated, stats.total, stats.failed
                );

                Self {
                    store,
                    glossary: Glossary::from_entries(checkpoint.glossary),
                    metadata: checkpoint.metadata,
                    writer,
                    persona_id,
                    persona,
                    resumed: true,
                    recovered,
                }
            }
            None => {
                let persona = config.resolve_persona(&personas)?.clone();
                let store = SegmentStore::ingest(document.segments, &config.persona)?;
                info!("Ingested {} segments from {}", store.len(), document.name);

                let mut metadata =
                    RunMetadata::new(document.hash, document.name, &config.persona, &config.target_lang);
                metadata.source_lang = config.source_lang.clone();

                Self {
                    store,
                    glossary: Glossary::new(),
                    metadata,
                    writer,
                    persona_id: config.persona.clone(),
                    persona,
                    resumed: false,
                    recovered: Vec::new(),
                }
            }
        };

        session.glossary.seed(seed);
        Ok(session)
    }

    /// Open an existing checkpoint by document hash (status, render, reset)
    pub fn load_existing(config: &TranslatorConfig, document_hash: &str) -> Result<Self> {
        let writer = CheckpointWriter::new(config.document_dir(document_hash));
        let checkpoint = writer.load()?.ok_or_else(|| TranslationError::CheckpointError {
            path: writer.path().display().to_string(),
            message: "no checkpoint for this document".to_string(),
        })?;

        let personas = load_personas(config.personas_path.as_deref())?;
        let persona_id = checkpoint.metadata.persona.clone();
        let persona = checkpoint_persona(&personas, &persona_id)?;

        let mut store = SegmentStore::from_segments(checkpoint.segments)?;
        let recovered = store.recover_in_flight();

        Ok(Self {
            store,
            glossary: Glossary::from_entries(checkpoint.glossary),
            metadata: checkpoint.metadata,
            writer,
            persona_id,
            persona,
            resumed: true,
            recovered,
        })
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn glossary(&self) -> &Glossary {
        &self.glossary
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn persona_id(&self) -> &str {
        &self.persona_id
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Whether an existing checkpoint was loaded
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Segments moved from IN_FLIGHT back to PENDING at open
    pub fn recovered(&self) -> &[SegmentId] {
        &self.recovered
    }

    pub fn checkpoint_path(&self) -> &std::path::Path {
        self.writer.path()
    }

    pub fn progress(&self) -> ProgressStats {
        ProgressStats::new(&self.metadata, &self.store, self.glossary.len())
    }

    /// Explicit retry reset, persisted immediately
    pub fn reset_failed(&mut self, ids: Option<&[SegmentId]>) -> Result<Vec<SegmentId>> {
        let reset = self.store.reset_failed(ids)?;
        if !reset.is_empty() {
            self.save()?;
        }
        Ok(reset)
    }

    /// Write a checkpoint of the current state
    pub fn save(&mut self) -> Result<()> {
        self.metadata.touch();
        self.writer.save(&self.store.snapshot(&self.metadata, &self.glossary))
    }
}
