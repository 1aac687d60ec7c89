//! Prompt assembly shared by all providers

use crate::core::models::{GlossaryEntry, RequestTask, TranslationRequest};
use crate::core::persona::Persona;

const BASE_INSTRUCTION: &str = "You are a professional book translator.
You receive a JSON array of objects {\"id\": <integer>, \"text\": <string>}.
Translate every `text` and answer with a JSON array of objects {\"id\": <same integer>, \"translation\": <string>}.
Rules:
- Exactly one output object per input id. Never merge, split, drop or invent ids.
- Keep Markdown markup, numbers, code and URLs intact.
- Output JSON only, without commentary.";

const TERMS_INSTRUCTION: &str = "Additionally report key terminology you translated (names, concepts, jargon).
In that case answer with a JSON object {\"translations\": [...], \"glossary\": {\"<source term>\": \"<translation>\"}}.";

const GLOSSARY_INSTRUCTION: &str = "You are a terminologist preparing a glossary for a book translation.
You receive pairs of original and translated passages.
List the key terms (names, concepts, jargon) together with the translation actually used.
Answer with a flat JSON object whose keys are source terms and whose values are their translations,
for example {\"Chapter 1\": \"第一章\", \"Index\": \"索引\"}.
Return ONLY the JSON object.";

/// Builds the system instruction and user message for a batch
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona_id: String,
    persona: Persona,
}

impl PromptBuilder {
    pub fn new(persona_id: impl Into<String>, persona: Persona) -> Self {
        Self {
            persona_id: persona_id.into(),
            persona,
        }
    }

    pub fn persona_id(&self) -> &str {
        &self.persona_id
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Persona section carried in `TranslationRequest::instructions`
    pub fn persona_instructions(&self) -> String {
        format!(
            "# ACTIVE TRANSLATION MODE\n\nMode: {}\n\nYour role:\n{}\n\nYour style:\n{}\n",
            self.persona.name, self.persona.role_desc, self.persona.style
        )
    }

    /// Full system instruction for a request
    pub fn system_instruction(request: &TranslationRequest) -> String {
        if let RequestTask::ExtractGlossary { .. } = request.task {
            return glossary_instruction(request);
        }

        let mut parts = vec![BASE_INSTRUCTION.to_string()];

        if let Some(source) = &request.source_lang {
            parts.push(format!("Source language: {}.", source));
        }
        parts.push(format!("Target language: {}.", request.target_lang));

        if request.extract_terms {
            parts.push(TERMS_INSTRUCTION.to_string());
        }

        if !request.instructions.is_empty() {
            parts.push(format!("---\n{}", request.instructions));
        }

        if !request.glossary.is_empty() {
            parts.push(format!(
                "---\n# MANDATORY GLOSSARY\n\nThe following terms MUST be translated exactly as specified:\n<glossary>\n{}\n</glossary>",
                format_glossary(&request.glossary)
            ));
        }

        parts.join("\n\n")
    }

    /// User message for the request's task.
    ///
    /// Translation: previous context followed by the input JSON. Repair:
    /// the translation message again plus the rejected output.
    pub fn user_message(request: &TranslationRequest) -> String {
        match &request.task {
            RequestTask::Translate => Self::translation_message(request),
            RequestTask::ExtractGlossary { sample } => format!("# Translated Passages\n{}", sample),
            RequestTask::RepairJson { broken, error } => format!(
                "{}\n\n# Your Previous Answer\nIt could not be parsed ({}):\n<broken_output>\n{}\n</broken_output>\n\nReturn the corrected JSON only, keeping every id.",
                Self::translation_message(request),
                error,
                broken
            ),
        }
    }

    fn translation_message(request: &TranslationRequest) -> String {
        let context = if request.context.trim().is_empty() {
            "(Beginning of document - no previous context)"
        } else {
            request.context.as_str()
        };

        // Serializing plain structs of strings and integers cannot fail
        let input_json = serde_json::to_string(&request.items).unwrap_or_else(|_| "[]".to_string());

        format!(
            "# Context from Previous Segments\n<previous_context>\n{}\n</previous_context>\n\n# Input Data\n{}",
            context, input_json
        )
    }
}

fn glossary_instruction(request: &TranslationRequest) -> String {
    let mut parts = vec![GLOSSARY_INSTRUCTION.to_string()];
    if let Some(source) = &request.source_lang {
        parts.push(format!("Source language: {}.", source));
    }
    parts.push(format!("Target language: {}.", request.target_lang));
    parts.join("\n\n")
}

fn format_glossary(entries: &[GlossaryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("- **{}**: Must be translated as **{}**", e.term, e.translation))
        .collect::<Vec<_>>()
        .join("\n")
}
