//! Long-document translator - resumable, order-preserving batch translation
//!
//! A document is split into segments held in a [`SegmentStore`]. The
//! [`Scheduler`] groups pending segments into batches, sends them to a
//! [`TranslationClient`] with bounded concurrency, validates and repairs the
//! JSON replies, and commits translations and glossary terms under a single
//! lock. Every commit is checkpointed atomically so an interrupted run
//! resumes where it stopped.

#![forbid(unsafe_code)]

pub mod cli;
pub mod core;
pub mod pipeline;
pub mod processors;

// Re-export key types for convenience
pub use core::{
    client::{AnyClient, GeminiClient, OpenAiCompatibleClient, TranslationClient},
    config::{ProviderKind, TranslatorConfig},
    errors::{ProviderError, Result, TranslationError},
    models::{
        GlossaryEntry, NewSegment, ProviderReply, Segment, SegmentId, SegmentStatus,
        RequestTask, SourceDocument, TranslationRequest,
    },
};

pub use pipeline::{
    report::RunReport, scheduler::Scheduler, session::Session, store::SegmentStore,
};

pub use processors::markdown::{MarkdownIngestor, MarkdownRenderer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
