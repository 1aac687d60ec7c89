//! Configuration management

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::persona::{is_yaml, Persona, DEFAULT_PERSONA};

/// Which provider protocol to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// `/chat/completions` (DeepSeek, Ark, Ollama, OpenAI, ...)
    OpenaiCompatible,
    /// Google Gemini `generateContent`
    Gemini,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::OpenaiCompatible => write!(f, "openai-compatible"),
            ProviderKind::Gemini => write!(f, "gemini"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai-compatible" | "openai_compatible" | "openai" | "deepseek" | "ark" | "ollama" => {
                Ok(ProviderKind::OpenaiCompatible)
            }
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(TranslationError::config(format!("Unknown provider: {}", other))),
        }
    }
}

/// Default endpoint for OpenAI-compatible providers
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://ark.cn-beijing.volces.com/api/v3";

/// Default endpoint for Gemini
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for translator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    pub api_endpoint: String,
    pub model: String,
    pub source_lang: Option<String>,
    pub target_lang: String,
    pub persona: String,
    pub personas_path: Option<PathBuf>,
    pub glossary_path: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_budget_secs: u64,
    pub timeout_ms: u64,
    pub max_batch_segments: usize,
    pub max_batch_chars: usize,
    pub provider_context_chars: usize,
    pub prompt_overhead_chars: usize,
    pub max_chunk_chars: usize,
    pub max_repair_attempts: usize,
    /// Model self-correction round trips per batch after local repair fails
    pub json_repair_retries: usize,
    /// Share of the document pre-translated to build a glossary first
    pub glossary_preamble_ratio: Option<f64>,
    pub token_budget: Option<usize>,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenaiCompatible,
            api_key: String::new(),
            api_endpoint: String::new(),
            model: "deepseek-v3-250324".to_string(),
            source_lang: None,
            target_lang: "zh".to_string(),
            persona: DEFAULT_PERSONA.to_string(),
            personas_path: None,
            glossary_path: None,
            work_dir: PathBuf::from("output"),
            max_concurrent: 4,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            retry_budget_secs: 600,
            timeout_ms: 120_000,
            max_batch_segments: 5,
            max_batch_chars: 6000,
            provider_context_chars: 60_000,
            prompt_overhead_chars: 4000,
            max_chunk_chars: 2000,
            max_repair_attempts: 3,
            json_repair_retries: 0,
            glossary_preamble_ratio: None,
            token_budget: None,
        }
    }
}

/// Parse `key` from the environment into `target` when it is set
fn env_override<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse::<T>()
            .map_err(|e| TranslationError::config(format!("{} = {:?}: {}", key, raw, e)))?;
        debug!("Config override from {}", key);
    }
    Ok(())
}

/// Same as [`env_override`] for optional values; an empty variable clears it
fn env_override_opt<T>(key: &str, target: &mut Option<T>) -> Result<()>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        if raw.trim().is_empty() {
            *target = None;
        } else {
            *target = Some(
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| TranslationError::config(format!("{} = {:?}: {}", key, raw, e)))?,
            );
        }
    }
    Ok(())
}

impl TranslatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply environment overrides on top of the current values
    pub fn apply_env(&mut self) -> Result<()> {
        env_override("TRANSLATOR_PROVIDER", &mut self.provider)?;

        // Provider-specific key variables, most specific last
        for key in ["ARK_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY", "API_KEY"] {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    self.api_key = value.trim().to_string();
                }
            }
        }

        env_override("API_ENDPOINT", &mut self.api_endpoint)?;
        env_override("MODEL", &mut self.model)?;
        env_override_opt("SOURCE_LANG", &mut self.source_lang)?;
        env_override("TARGET_LANG", &mut self.target_lang)?;
        env_override("PERSONA", &mut self.persona)?;
        env_override_opt("PERSONAS_PATH", &mut self.personas_path)?;
        env_override_opt("GLOSSARY_PATH", &mut self.glossary_path)?;
        env_override("OUTPUT_DIR", &mut self.work_dir)?;
        env_override("MAX_CONCURRENT", &mut self.max_concurrent)?;
        env_override("MAX_RETRIES", &mut self.max_retries)?;
        env_override("RETRY_DELAY_MS", &mut self.retry_delay_ms)?;
        env_override("MAX_RETRY_DELAY_MS", &mut self.max_retry_delay_ms)?;
        env_override("RETRY_BUDGET_SECS", &mut self.retry_budget_secs)?;
        env_override("REQUEST_TIMEOUT_MS", &mut self.timeout_ms)?;
        env_override("BATCH_SIZE", &mut self.max_batch_segments)?;
        env_override("MAX_BATCH_CHARS", &mut self.max_batch_chars)?;
        env_override("PROVIDER_CONTEXT_CHARS", &mut self.provider_context_chars)?;
        env_override("MAX_CHUNK_SIZE", &mut self.max_chunk_chars)?;
        env_override("LOCAL_REPAIR_ATTEMPTS", &mut self.max_repair_attempts)?;
        env_override("JSON_REPAIR_RETRIES", &mut self.json_repair_retries)?;
        env_override_opt("GLOSSARY_PREAMBLE_RATIO", &mut self.glossary_preamble_ratio)?;
        env_override_opt("TOKEN_BUDGET", &mut self.token_budget)?;

        Ok(())
    }

    /// Load from a JSON or YAML file (by extension), then apply the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::from_env();
        };
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load from JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| TranslationError::FileError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let config = if is_yaml(path) {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    /// Effective endpoint: the configured one, or the provider default
    pub fn endpoint(&self) -> &str {
        if !self.api_endpoint.trim().is_empty() {
            return self.api_endpoint.trim();
        }
        match self.provider {
            ProviderKind::OpenaiCompatible => DEFAULT_OPENAI_ENDPOINT,
            ProviderKind::Gemini => DEFAULT_GEMINI_ENDPOINT,
        }
    }

    /// Whether the endpoint points at a local inference server
    pub fn is_local_endpoint(&self) -> bool {
        let endpoint = self.endpoint();
        ["localhost", "127.0.0.1", "0.0.0.0", "[::1]"]
            .iter()
            .any(|host| endpoint.contains(host))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(TranslationError::config("max_concurrent must be greater than 0"));
        }

        if self.max_batch_segments == 0 {
            return Err(TranslationError::config("max_batch_segments must be greater than 0"));
        }

        if self.max_batch_chars == 0 {
            return Err(TranslationError::config("max_batch_chars must be greater than 0"));
        }

        if self.max_chunk_chars == 0 {
            return Err(TranslationError::config("max_chunk_chars must be greater than 0"));
        }

        if self.provider_context_chars <= self.prompt_overhead_chars {
            return Err(TranslationError::config(format!(
                "provider_context_chars ({}) must exceed prompt_overhead_chars ({})",
                self.provider_context_chars, self.prompt_overhead_chars
            )));
        }

        if let Some(ratio) = self.glossary_preamble_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(TranslationError::config(format!(
                    "glossary_preamble_ratio must be in (0, 1], got {}",
                    ratio
                )));
            }
        }

        if self.timeout_ms == 0 {
            return Err(TranslationError::config("timeout_ms must be greater than 0"));
        }

        if !self.endpoint().starts_with("http://") && !self.endpoint().starts_with("https://") {
            return Err(TranslationError::config(format!(
                "API endpoint must be an http(s) URL: {}",
                self.endpoint()
            )));
        }

        if self.model.trim().is_empty() {
            return Err(TranslationError::config("model is required"));
        }

        if self.target_lang.trim().is_empty() {
            return Err(TranslationError::config("target_lang is required"));
        }

        if self.api_key.trim().is_empty() {
            if self.provider == ProviderKind::Gemini || !self.is_local_endpoint() {
                return Err(TranslationError::config("API key is required"));
            }
            warn!("No API key configured, assuming local endpoint {}", self.endpoint());
        }

        Ok(())
    }

    /// Look up the configured persona
    pub fn resolve_persona<'a>(&self, personas: &'a BTreeMap<String, Persona>) -> Result<&'a Persona> {
        personas.get(&self.persona).ok_or_else(|| {
            TranslationError::config(format!(
                "Unknown persona '{}' (available: {})",
                self.persona,
                personas.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }

    /// Number of leading segments translated before glossary extraction,
    /// or `None` when the preamble pass is disabled
    pub fn glossary_preamble_count(&self, total: usize) -> Option<usize> {
        let ratio = self.glossary_preamble_ratio?;
        Some(((total as f64 * ratio) as usize).clamp(1, total.max(1)))
    }

    /// Per-request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Directory holding checkpoints for one document
    pub fn document_dir(&self, document_hash: &str) -> PathBuf {
        self.work_dir.join(document_hash)
    }
}
