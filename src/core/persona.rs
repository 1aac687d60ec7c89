//! Translation personas (named policies)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::core::errors::{Result, TranslationError};

/// How much trailing context a persona wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLength {
    Low,
    Medium,
    High,
}

impl ContextLength {
    /// Number of preceding segments considered
    pub fn segments(self) -> usize {
        match self {
            ContextLength::Low => 1,
            ContextLength::Medium => 3,
            ContextLength::High => 5,
        }
    }

    /// Character budget of the assembled context string
    pub fn char_budget(self) -> usize {
        match self {
            ContextLength::Low => 400,
            ContextLength::Medium => 1200,
            ContextLength::High => 2500,
        }
    }
}

impl Default for ContextLength {
    fn default() -> Self {
        ContextLength::Medium
    }
}

impl fmt::Display for ContextLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextLength::Low => write!(f, "low"),
            ContextLength::Medium => write!(f, "medium"),
            ContextLength::High => write!(f, "high"),
        }
    }
}

/// A named translation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub role_desc: String,
    pub style: String,
    #[serde(default)]
    pub context_len: ContextLength,
    /// Ask the provider to return newly seen terminology
    #[serde(default)]
    pub extract_terms: bool,
    /// Overrides the configured per-batch character budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_chars: Option<usize>,
}

/// Built-in personas: (id, name, role, style, context length, extract terms)
const DEFAULT_PERSONAS: &[(&str, &str, &str, &str, ContextLength, bool)] = &[
    (
        "scholar",
        "Theory Scholar",
        "You are a scholar of psychoanalysis and continental philosophy who translates dense theory for a general academic audience.",
        "Academically precise, explains jargon only through word choice, keeps terminology strictly consistent.",
        ContextLength::High,
        true,
    ),
    (
        "biography",
        "Biography Journalist",
        "You are a literary translator with a background in history who specialises in biographies and narrative non-fiction.",
        "Fluent and natural, avoids translationese, uses idiomatic target-language phrasing.",
        ContextLength::Medium,
        true,
    ),
    (
        "research",
        "Social Science Researcher",
        "You are an academic translator for critical theory, sociology and cultural criticism.",
        "Rigorous and faithful to the source register, terminology unified across the book.",
        ContextLength::High,
        true,
    ),
    (
        "technical",
        "Technical Writer",
        "You are a data scientist and technical writer translating engineering and scientific material.",
        "Logically tight, information-dense, keeps identifiers and formulas untouched.",
        ContextLength::Medium,
        false,
    ),
    (
        "novel",
        "Novel Translator",
        "You are a seasoned translator of contemporary fiction.",
        "Emotionally nuanced, attentive to dialogue and everyday detail.",
        ContextLength::Low,
        false,
    ),
];

/// Identifier of the persona used when none is configured
pub const DEFAULT_PERSONA: &str = "scholar";

/// Built-in personas keyed by id
pub fn default_personas() -> BTreeMap<String, Persona> {
    DEFAULT_PERSONAS
        .iter()
        .map(|(id, name, role, style, context_len, extract_terms)| {
            (
                id.to_string(),
                Persona {
                    name: name.to_string(),
                    role_desc: role.to_string(),
                    style: style.to_string(),
                    context_len: *context_len,
                    extract_terms: *extract_terms,
                    max_batch_chars: None,
                },
            )
        })
        .collect()
}

/// Load personas from a JSON or YAML map, falling back to the built-ins.
///
/// A missing file is not an error; an unreadable or empty one is.
pub fn load_personas(path: Option<&Path>) -> Result<BTreeMap<String, Persona>> {
    let Some(path) = path else {
        return Ok(default_personas());
    };

    if !path.exists() {
        warn!("Personas file {} not found, using defaults", path.display());
        return Ok(default_personas());
    }

    let content = std::fs::read_to_string(path).map_err(|e| TranslationError::FileError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let personas: BTreeMap<String, Persona> = if is_yaml(path) {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };

    if personas.is_empty() {
        return Err(TranslationError::config(format!(
            "No personas defined in {}",
            path.display()
        )));
    }

    info!("Loaded {} personas from {}", personas.len(), path.display());
    Ok(personas)
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "yaml" || ext == "yml"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_contain_default_persona() {
        let personas = default_personas();
        assert!(personas.contains_key(DEFAULT_PERSONA));
        assert_eq!(personas["novel"].context_len, ContextLength::Low);
    }

    #[test]
    fn test_load_yaml_personas() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "poet:\n  name: Poet\n  role_desc: A poet\n  style: Lyrical\n  context_len: high\n"
        )
        .unwrap();

        let personas = load_personas(Some(file.path())).unwrap();
        assert_eq!(personas.len(), 1);
        assert_eq!(personas["poet"].context_len, ContextLength::High);
        assert!(!personas["poet"].extract_terms);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let personas = load_personas(Some(Path::new("/nonexistent/personas.json"))).unwrap();
        assert_eq!(personas.len(), default_personas().len());
    }
}
