//! CLI command definitions and handlers

use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::core::client::{AnyClient, TranslationClient};
use crate::core::config::{ProviderKind, TranslatorConfig};
use crate::core::errors::{ProviderError, TranslationError};
use crate::core::models::SegmentId;
use crate::pipeline::report::{RunReport, StopReason};
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::session::Session;
use crate::processors::markdown::{document_hash, MarkdownIngestor, MarkdownRenderer};

/// Commands for the long-document translator
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate Markdown or plain-text files, resuming any checkpoint
    Translate {
        /// Input file or directory (required)
        #[arg(short, long)]
        file: PathBuf,

        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Source language (auto-detect if not specified)
        #[arg(long)]
        source_lang: Option<String>,

        /// Target language (default from config)
        #[arg(short, long)]
        target_lang: Option<String>,

        /// Persona to translate with
        #[arg(short, long)]
        persona: Option<String>,

        /// Provider: openai-compatible or gemini
        #[arg(long)]
        provider: Option<ProviderKind>,

        /// Model name
        #[arg(short, long)]
        model: Option<String>,

        /// JSON file of fixed term translations
        #[arg(short, long)]
        glossary: Option<PathBuf>,

        /// Checkpoint directory
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Recursively translate subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Keep the source text above each translation
        #[arg(long)]
        retain_original: bool,

        /// Pre-translate this share of the document (0-1] and extract a glossary first
        #[arg(long)]
        glossary_preamble: Option<f64>,

        /// Ask the model to fix unparseable JSON this many times per batch
        #[arg(long)]
        json_repair_retries: Option<usize>,
    },

    /// Show progress of a document's checkpoint
    Status {
        /// Source document
        #[arg(short, long)]
        file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Return FAILED segments to PENDING for another run
    ResetFailed {
        /// Source document
        #[arg(short, long)]
        file: PathBuf,

        /// Only these segment ids (default: all failed)
        #[arg(long, value_delimiter = ',')]
        ids: Vec<SegmentId>,
    },

    /// Render a checkpoint to Markdown without translating
    Render {
        /// Source document
        #[arg(short, long)]
        file: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the source text above each translation
        #[arg(long)]
        retain_original: bool,

        /// Emit location markers before each segment
        #[arg(long)]
        locations: bool,
    },

    /// Show or export the glossary built for a document
    Glossary {
        /// Source document
        #[arg(short, long)]
        file: PathBuf,

        /// Write the glossary as a JSON object to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

/// Global flags applied on top of the loaded configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config: Option<PathBuf>,
    pub api_key: Option<String>,
    pub max_concurrent: Option<usize>,
}

impl ConfigOverrides {
    /// Config file (if any), then environment, then flags
    pub fn load(&self) -> anyhow::Result<TranslatorConfig> {
        let mut config = TranslatorConfig::load(self.config.as_deref())?;
        if let Some(api_key) = &self.api_key {
            config.api_key = api_key.clone();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = max_concurrent;
        }
        Ok(config)
    }
}

/// `<stem>.<lang>.md` next to the input, or under `output` for directories
pub fn output_path(root: &Path, file: &Path, output: Option<&Path>, target_lang: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let name = format!("{}.{}.md", stem, target_lang);

    if root.is_dir() {
        let relative = file
            .parent()
            .and_then(|parent| parent.strip_prefix(root).ok())
            .unwrap_or_else(|| Path::new(""));
        let base = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.join("translated"));
        return base.join(relative).join(name);
    }

    match output {
        Some(output) => output.to_path_buf(),
        None => file.with_file_name(name),
    }
}

async fn hash_file(file: &Path) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| TranslationError::FileError {
            path: file.display().to_string(),
            message: e.to_string(),
        })?;
    Ok(document_hash(&bytes))
}

fn progress_bar(total: usize, name: &str) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );
    pb.set_message(name.to_string());
    pb
}

/// Handle the translate command
#[allow(clippy::too_many_arguments)]
pub async fn handle_translate(
    overrides: ConfigOverrides,
    file: PathBuf,
    output: Option<PathBuf>,
    source_lang: Option<String>,
    target_lang: Option<String>,
    persona: Option<String>,
    provider: Option<ProviderKind>,
    model: Option<String>,
    glossary: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    recursive: bool,
    retain_original: bool,
    glossary_preamble: Option<f64>,
    json_repair_retries: Option<usize>,
) -> anyhow::Result<()> {
    let start_time = Instant::now();

    let mut config = overrides.load()?;
    if source_lang.is_some() {
        config.source_lang = source_lang;
    }
    if let Some(target_lang) = target_lang {
        config.target_lang = target_lang;
    }
    if let Some(persona) = persona {
        config.persona = persona;
    }
    if let Some(provider) = provider {
        config.provider = provider;
    }
    if let Some(model) = model {
        config.model = model;
    }
    if glossary.is_some() {
        config.glossary_path = glossary;
    }
    if let Some(work_dir) = work_dir {
        config.work_dir = work_dir;
    }
    if glossary_preamble.is_some() {
        config.glossary_preamble_ratio = glossary_preamble;
    }
    if let Some(retries) = json_repair_retries {
        config.json_repair_retries = retries;
    }
    config.validate()?;

    info!("Starting translation");
    info!("Input: {}", file.display());
    info!("Provider: {} ({})", config.provider, config.model);
    info!("Persona: {}, target language: {}", config.persona, config.target_lang);

    let files = if file.is_dir() {
        // Skip earlier outputs written under the same tree
        let out_base = output.clone().unwrap_or_else(|| file.join("translated"));
        let mut files = MarkdownIngestor::find_files(&file, recursive)?;
        files.retain(|f| !f.starts_with(&out_base));
        files
    } else {
        vec![file.clone()]
    };

    if files.is_empty() {
        anyhow::bail!("No Markdown or text files found");
    }

    // Unreachable endpoint or rejected key ends the run before any state exists
    AnyClient::from_config(&config)?.preflight().await?;

    let ingestor = MarkdownIngestor::from_config(&config);
    let renderer = MarkdownRenderer::new().with_retain_original(retain_original);

    let mut processed = 0;
    let mut incomplete = 0;
    let mut failed = 0;

    for file_path in files {
        let output = output_path(&file, &file_path, output.as_deref(), &config.target_lang);

        match translate_one(&config, &ingestor, &renderer, &file_path, &output).await {
            Ok(report) => {
                println!("\n{}", file_path.display());
                println!("{}", report);
                if report.is_success() {
                    processed += 1;
                } else {
                    incomplete += 1;
                }
                if report.stop_reason == StopReason::Cancelled {
                    warn!("Cancelled, remaining files skipped");
                    break;
                }
            }
            Err(TranslationError::Provider(ProviderError::Auth { message })) => {
                anyhow::bail!("Provider rejected credentials: {}", message);
            }
            Err(e) => {
                failed += 1;
                eprintln!("Error processing {}: {}", file_path.display(), e);
            }
        }
    }

    let duration = start_time.elapsed();
    info!(
        "Completed: {} translated, {} incomplete, {} failed in {:?}",
        processed, incomplete, failed, duration
    );

    println!("\n✅ Translation finished");
    println!("   Complete: {}", processed);
    println!("   Incomplete (resume to continue): {}", incomplete);
    println!("   Failed: {}", failed);
    println!("   Time: {:?}", duration);

    Ok(())
}

/// Ingest, run and render one document
async fn translate_one(
    config: &TranslatorConfig,
    ingestor: &MarkdownIngestor,
    renderer: &MarkdownRenderer,
    file: &Path,
    output: &Path,
) -> crate::core::errors::Result<RunReport> {
    let document = ingestor.ingest_file(file).await?;
    let name = document.name.clone();
    let session = Session::open(config, document)?;
    if session.is_resumed() {
        info!(
            "Resuming {} ({} segments recovered from an interrupted run)",
            name,
            session.recovered().len()
        );
    }

    let stats = session.store().stats();
    let pb = progress_bar(stats.total, &name);
    pb.set_position((stats.translated + stats.failed) as u64);

    let bar = pb.clone();
    let scheduler = Scheduler::new(AnyClient::from_config(config)?, config, session)?
        .with_progress(Box::new(move |stats| {
            bar.set_position((stats.translated + stats.failed) as u64);
        }));

    let report = scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
    pb.finish_and_clear();
    let report = report?;

    if scheduler.token_tracker().is_low().await {
        warn!("Token budget nearly exhausted");
    }

    let session = scheduler.into_session();
    renderer.write(session.store(), output).await?;
    info!("Output: {}", output.display());

    Ok(report)
}

/// Handle the status command
pub async fn handle_status(overrides: ConfigOverrides, file: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = overrides.load()?;
    let session = Session::load_existing(&config, &hash_file(&file).await?)?;
    let progress = session.progress();

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
    } else {
        println!("{}", progress);
        for segment in session.store().failed_segments() {
            println!(
                "  FAILED id {} ({}): {}",
                segment.id,
                segment.page_or_location,
                segment.failure_reason.as_deref().unwrap_or("")
            );
        }
    }

    Ok(())
}

/// Handle the reset-failed command
pub async fn handle_reset_failed(
    overrides: ConfigOverrides,
    file: PathBuf,
    ids: Vec<SegmentId>,
) -> anyhow::Result<()> {
    let config = overrides.load()?;
    let mut session = Session::load_existing(&config, &hash_file(&file).await?)?;

    let filter = if ids.is_empty() { None } else { Some(ids.as_slice()) };
    let reset = session.reset_failed(filter)?;

    if reset.is_empty() {
        println!("No failed segments to reset");
    } else {
        println!("✅ Reset {} segments to PENDING: {:?}", reset.len(), reset);
    }

    Ok(())
}

/// Handle the render command
pub async fn handle_render(
    overrides: ConfigOverrides,
    file: PathBuf,
    output: Option<PathBuf>,
    retain_original: bool,
    locations: bool,
) -> anyhow::Result<()> {
    let config = overrides.load()?;
    let session = Session::load_existing(&config, &hash_file(&file).await?)?;

    let output = output_path(&file, &file, output.as_deref(), &session.metadata().target_lang);
    MarkdownRenderer::new()
        .with_retain_original(retain_original)
        .with_locations(locations)
        .write(session.store(), &output)
        .await?;

    let stats = session.store().stats();
    println!(
        "✅ Rendered {} ({}/{} translated) to {}",
        file.display(),
        stats.translated,
        stats.total,
        output.display()
    );

    Ok(())
}

/// Handle the glossary command
pub async fn handle_glossary(
    overrides: ConfigOverrides,
    file: PathBuf,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = overrides.load()?;
    let session = Session::load_existing(&config, &hash_file(&file).await?)?;
    let glossary = session.glossary();

    match export {
        Some(path) => {
            let map: BTreeMap<&str, &str> = glossary
                .entries()
                .iter()
                .map(|e| (e.term.as_str(), e.translation.as_str()))
                .collect();
            tokio::fs::write(&path, serde_json::to_string_pretty(&map)?).await?;
            println!("📝 Exported {} terms to {}", glossary.len(), path.display());
        }
        None => {
            if glossary.is_empty() {
                println!("Glossary is empty");
            }
            for entry in glossary.entries() {
                println!("{} => {}", entry.term, entry.translation);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_for_single_file() {
        let file = Path::new("/books/lacan.md");
        assert_eq!(
            output_path(file, file, None, "zh"),
            PathBuf::from("/books/lacan.zh.md")
        );
        assert_eq!(
            output_path(file, file, Some(Path::new("/out/x.md")), "zh"),
            PathBuf::from("/out/x.md")
        );
    }

    #[test]
    fn test_output_path_for_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("part1/ch1.md");

        assert_eq!(
            output_path(dir.path(), &file, None, "en"),
            dir.path().join("translated/part1/ch1.en.md")
        );
        assert_eq!(
            output_path(dir.path(), &file, Some(Path::new("/out")), "en"),
            PathBuf::from("/out/part1/ch1.en.md")
        );
    }

    #[test]
    fn test_overrides_apply_on_top_of_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_concurrent": 8, "persona": "scholar"}"#).unwrap();

        let overrides = ConfigOverrides {
            config: Some(path),
            api_key: Some("from-flag".to_string()),
            max_concurrent: Some(2),
        };
        let config = overrides.load().unwrap();
        assert_eq!(config.api_key, "from-flag");
        assert_eq!(config.max_concurrent, 2);
    }
}
