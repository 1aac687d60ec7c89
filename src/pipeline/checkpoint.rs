//! Durable snapshots of the segment store and glossary
//!
//! A checkpoint is written to a temporary file in the target directory,
//! flushed to disk and then renamed over the previous one, so the canonical
//! file is always either the old or the new complete snapshot.
//!
//! Every save takes a sequence number when it is requested. A write whose
//! number is older than the last one on disk is dropped, so a background
//! save that finishes late cannot replace a newer snapshot.

use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::core::errors::{Result, TranslationError};
use crate::core::models::{GlossaryEntry, RunMetadata, Segment};

/// Persisted format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// File name of the persisted segment store (the "structure map")
pub const CHECKPOINT_FILE: &str = "structure_map.json";

/// Full, self-consistent serialization of store and glossary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub metadata: RunMetadata,
    pub segments: Vec<Segment>,
    pub glossary: Vec<GlossaryEntry>,
}

impl Checkpoint {
    pub fn new(metadata: RunMetadata, segments: Vec<Segment>, glossary: Vec<GlossaryEntry>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            metadata,
            segments,
            glossary,
        }
    }
}

/// Reads and atomically replaces one document's checkpoint file.
///
/// Clones share the sequence counter.
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    path: PathBuf,
    next_seq: Arc<AtomicU64>,
    /// Sequence number of the snapshot currently on disk
    written: Arc<Mutex<u64>>,
}

impl CheckpointWriter {
    /// Checkpoint stored as `<dir>/structure_map.json`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CHECKPOINT_FILE),
            next_seq: Arc::new(AtomicU64::new(1)),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn error(&self, message: impl ToString) -> TranslationError {
        TranslationError::CheckpointError {
            path: self.path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Load the checkpoint; `None` if none was written yet
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| self.error(e))?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| self.error(e))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(self.error(format!(
                "unsupported checkpoint version {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }

        debug!(
            "Loaded checkpoint {} ({} segments)",
            self.path.display(),
            checkpoint.segments.len()
        );
        Ok(Some(checkpoint))
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Write-temp, fsync, rename
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write(self.next_seq(), checkpoint)
    }

    /// Write `checkpoint` unless a snapshot with a later `seq` is on disk
    fn write(&self, seq: u64, checkpoint: &Checkpoint) -> Result<()> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| self.error("checkpoint writer lock poisoned"))?;
        if seq <= *written {
            debug!(
                "Skipping checkpoint {} for {}, snapshot {} already written",
                seq,
                self.path.display(),
                *written
            );
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .ok_or_else(|| self.error("checkpoint path has no parent directory"))?;
        std::fs::create_dir_all(dir).map_err(|e| self.error(e))?;

        let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.error(e))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, checkpoint).map_err(|e| self.error(e))?;
            writer.flush().map_err(|e| self.error(e))?;
        }
        temp.as_file().sync_all().map_err(|e| self.error(e))?;
        temp.persist(&self.path).map_err(|e| self.error(e.error))?;
        *written = seq;

        debug!("Checkpoint {} written to {}", seq, self.path.display());
        Ok(())
    }

    /// `save` on the blocking pool; ordered by call time, not completion
    pub async fn save_async(&self, checkpoint: Checkpoint) -> Result<()> {
        let seq = self.next_seq();
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.write(seq, &checkpoint))
            .await
            .map_err(|e| TranslationError::InternalError(format!("checkpoint task failed: {}", e)))?
    }
}
