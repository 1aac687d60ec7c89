//! Main entry point for the long-document translator CLI

#![forbid(unsafe_code)]

use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use longdoc_translator::cli::commands::{self, Commands, ConfigOverrides};

/// Long-document translator - resumable, order-preserving batch translation
#[derive(Parser, Debug)]
#[command(name = "longdoc-translator", version, about, long_about = None)]
struct Args {
    /// API key (optional, defaults to ARK_API_KEY / OPENAI_API_KEY / GEMINI_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Configuration file (JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Maximum concurrent requests
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}={}", env!("CARGO_CRATE_NAME"), log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let overrides = ConfigOverrides {
        config: args.config,
        api_key: args.api_key,
        max_concurrent: args.max_concurrent,
    };

    // Execute command
    match args.command {
        Some(Commands::Translate {
            file,
            output,
            source_lang,
            target_lang,
            persona,
            provider,
            model,
            glossary,
            work_dir,
            recursive,
            retain_original,
            glossary_preamble,
            json_repair_retries,
        }) => {
            commands::handle_translate(
                overrides,
                file,
                output,
                source_lang,
                target_lang,
                persona,
                provider,
                model,
                glossary,
                work_dir,
                recursive,
                retain_original,
                glossary_preamble,
                json_repair_retries,
            )
            .await?;
        }
        Some(Commands::Status { file, json }) => {
            commands::handle_status(overrides, file, json).await?;
        }
        Some(Commands::ResetFailed { file, ids }) => {
            commands::handle_reset_failed(overrides, file, ids).await?;
        }
        Some(Commands::Render {
            file,
            output,
            retain_original,
            locations,
        }) => {
            commands::handle_render(overrides, file, output, retain_original, locations).await?;
        }
        Some(Commands::Glossary { file, export }) => {
            commands::handle_glossary(overrides, file, export).await?;
        }
        None => {
            println!("Please specify a command. Use --help for more information.");
        }
    }

    Ok(())
}
