//! Parses provider output into a strict id -> translation mapping
//!
//! Models wrap JSON in code fences, stop mid-object when they hit an output
//! limit, or emit almost-JSON. Parsing is therefore layered: a strict parse
//! first, then a bounded sequence of repairs, each of which must produce
//! input the strict parser accepts (or, for the last one, salvaged pairs).

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::core::errors::{Result, TranslationError};
use crate::core::models::SegmentId;
use crate::pipeline::retry::BatchState;

/// Validated batch response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedResponse {
    /// Accepted translations, in response order
    pub translations: Vec<(SegmentId, String)>,
    /// Members with no usable translation, in batch order
    pub missing: Vec<SegmentId>,
    /// Ids that were not part of the batch (dropped)
    pub unknown: Vec<SegmentId>,
    /// Ids seen more than once (later occurrences dropped)
    pub duplicates: Vec<SegmentId>,
    /// Extracted terminology suggestions
    pub terms: Vec<(String, String)>,
    /// Whether a repair strategy was needed
    pub repaired: bool,
}

impl ValidatedResponse {
    pub fn outcome(&self) -> BatchState {
        if self.missing.is_empty() {
            BatchState::Succeeded
        } else if self.translations.is_empty() {
            BatchState::Failed
        } else {
            BatchState::Partial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawItem {
    id: SegmentId,
    translation: String,
}

/// Output of parsing or of one repair strategy
enum Parsed {
    Json(Value),
    Salvaged(Vec<RawItem>),
}

type RepairStrategy = fn(&str) -> Option<Parsed>;

/// Repairs in the order they are attempted
const REPAIR_STRATEGIES: &[(&str, RepairStrategy)] = &[
    ("close-delimiters", close_delimiters),
    ("truncate-tail", truncate_incomplete_tail),
    ("regex-salvage", salvage_pairs),
];

#[derive(Debug, Clone, Copy)]
pub struct ResponseValidator {
    max_repair_attempts: usize,
}

impl ResponseValidator {
    pub fn new(max_repair_attempts: usize) -> Self {
        Self {
            max_repair_attempts,
        }
    }

    /// Validate `raw` against the dispatched `member_ids`.
    ///
    /// Fails with `MalformedResponse` only when nothing can be parsed;
    /// missing members are reported, not treated as an error.
    pub fn validate(&self, raw: &str, member_ids: &[SegmentId]) -> Result<ValidatedResponse> {
        let payload = extract_payload(raw);
        let (parsed, repaired) = self.parse(payload)?;

        let (items, terms) = match parsed {
            Parsed::Json(value) => items_from_value(value)?,
            Parsed::Salvaged(items) => (items, Vec::new()),
        };

        let members: HashSet<SegmentId> = member_ids.iter().copied().collect();
        let mut seen = HashSet::with_capacity(items.len());
        let mut accepted = HashSet::with_capacity(items.len());
        let mut response = ValidatedResponse {
            terms,
            repaired,
            ..Default::default()
        };

        for item in items {
            if !members.contains(&item.id) {
                warn!("Dropping translation for unknown id {}", item.id);
                response.unknown.push(item.id);
                continue;
            }
            // Only the first occurrence of an id counts, blank or not
            if !seen.insert(item.id) {
                warn!("Duplicate id {} in response, keeping first occurrence", item.id);
                response.duplicates.push(item.id);
                continue;
            }
            if item.translation.trim().is_empty() {
                debug!("Blank translation for id {}, treating as missing", item.id);
                continue;
            }
            accepted.insert(item.id);
            response.translations.push((item.id, item.translation));
        }

        response.missing = member_ids
            .iter()
            .copied()
            .filter(|id| !accepted.contains(id))
            .collect();

        Ok(response)
    }

    /// Parse a glossary extraction reply: a flat `{term: translation}`
    /// object, optionally wrapped as `{"glossary": {...}}`
    pub fn parse_terms(&self, raw: &str) -> Result<Vec<(String, String)>> {
        let payload = extract_payload(raw);
        let value = match self.parse(payload)? {
            (Parsed::Json(value), _) => value,
            (Parsed::Salvaged(_), _) => {
                return Err(TranslationError::MalformedResponse {
                    message: "glossary reply is not a JSON object".to_string(),
                })
            }
        };

        match value.get("glossary") {
            Some(inner) => Ok(terms_from_value(Some(inner))),
            None if value.is_object() || value.is_array() => Ok(terms_from_value(Some(&value))),
            None => Err(TranslationError::MalformedResponse {
                message: format!("unexpected glossary shape: {}", value),
            }),
        }
    }

    fn parse(&self, payload: &str) -> Result<(Parsed, bool)> {
        let strict_error = match serde_json::from_str::<Value>(payload) {
            Ok(value) => return Ok((Parsed::Json(value), false)),
            Err(e) => e,
        };

        debug!("Strict parse failed ({}), attempting repair", strict_error);

        for (name, strategy) in REPAIR_STRATEGIES.iter().take(self.max_repair_attempts) {
            if let Some(parsed) = strategy(payload) {
                warn!("Malformed response repaired with {}", name);
                return Ok((parsed, true));
            }
        }

        Err(TranslationError::MalformedResponse {
            message: format!(
                "unparseable after {} repair attempts: {}",
                self.max_repair_attempts.min(REPAIR_STRATEGIES.len()),
                strict_error
            ),
        })
    }
}

/// Strip code fences and any prose before the first bracket
fn extract_payload(raw: &str) -> &str {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (```json) up to the first newline
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text).trim();
    }

    match text.find(|c: char| c == '[' || c == '{') {
        Some(start) => &text[start..],
        None => text,
    }
}

/// Lexical scan of JSON-ish text outside strings
struct Scan {
    /// Open delimiters at the end of the text
    stack: Vec<char>,
    in_string: bool,
    /// (byte index just past a closing bracket, open delimiters after it)
    closings: Vec<(usize, Vec<char>)>,
    balanced: bool,
}

fn scan(text: &str) -> Scan {
    let mut stack = Vec::new();
    let mut closings = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut balanced = true;

    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '[' | '{' => stack.push(c),
            ']' | '}' => {
                let expected = if c == ']' { '[' } else { '{' };
                if stack.pop() != Some(expected) {
                    balanced = false;
                    break;
                }
                closings.push((i + c.len_utf8(), stack.clone()));
            }
            _ => {}
        }
    }

    Scan {
        stack,
        in_string,
        closings,
        balanced,
    }
}

fn closers(stack: &[char]) -> String {
    stack
        .iter()
        .rev()
        .map(|&open| if open == '[' { ']' } else { '}' })
        .collect()
}

fn parse_json(text: &str) -> Option<Parsed> {
    serde_json::from_str::<Value>(text).ok().map(Parsed::Json)
}

/// Append missing closing brackets.
///
/// Declines when the text ends inside a string: closing the quote would
/// commit a truncated translation as if it were complete.
fn close_delimiters(text: &str) -> Option<Parsed> {
    let scan = scan(text);
    if !scan.balanced || scan.in_string || scan.stack.is_empty() {
        return None;
    }

    let body = text.trim_end().trim_end_matches(',').trim_end();
    if body.ends_with(':') {
        return None;
    }

    parse_json(&format!("{}{}", body, closers(&scan.stack)))
}

/// Cut back to the last complete element and close what is still open
fn truncate_incomplete_tail(text: &str) -> Option<Parsed> {
    let scan = scan(text);
    if !scan.balanced {
        return None;
    }

    let (end, stack) = scan.closings.last()?;
    parse_json(&format!("{}{}", &text[..*end], closers(stack)))
}

fn double_quoted_pairs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)"id"\s*:\s*"?(\d+)"?\s*,\s*"translation"\s*:\s*"((?:[^"\\]|\\.)*)""#)
            .expect("valid regex")
    })
}

fn single_quoted_pairs() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?s)'id'\s*:\s*'?(\d+)'?\s*,\s*'translation'\s*:\s*'((?:[^'\\]|\\.)*)'"#)
            .expect("valid regex")
    })
}

/// Pull `"id": N, "translation": "..."` pairs out of otherwise broken text
fn salvage_pairs(text: &str) -> Option<Parsed> {
    let mut items: Vec<RawItem> = double_quoted_pairs()
        .captures_iter(text)
        .filter_map(|caps| {
            let id = caps[1].parse().ok()?;
            Some(RawItem {
                id,
                translation: unescape_double(&caps[2]),
            })
        })
        .collect();

    if items.is_empty() {
        items = single_quoted_pairs()
            .captures_iter(text)
            .filter_map(|caps| {
                let id = caps[1].parse().ok()?;
                Some(RawItem {
                    id,
                    translation: caps[2].replace("\\'", "'").replace("\\n", "\n"),
                })
            })
            .collect();
    }

    if items.is_empty() {
        None
    } else {
        Some(Parsed::Salvaged(items))
    }
}

fn unescape_double(inner: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", inner))
        .unwrap_or_else(|_| inner.replace("\\\"", "\"").replace("\\n", "\n"))
}

fn id_of(value: &Value) -> Option<SegmentId> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn item_from_value(value: &Value) -> Option<RawItem> {
    Some(RawItem {
        id: id_of(value.get("id")?)?,
        translation: value.get("translation")?.as_str()?.to_string(),
    })
}

fn items_from_array(values: &[Value]) -> Vec<RawItem> {
    values
        .iter()
        .filter_map(|value| {
            let item = item_from_value(value);
            if item.is_none() {
                debug!("Skipping response element without id/translation: {}", value);
            }
            item
        })
        .collect()
}

fn terms_from_value(value: Option<&Value>) -> Vec<(String, String)> {
    match value {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(term, translation)| {
                translation.as_str().map(|t| (term.clone(), t.to_string()))
            })
            .collect(),
        Some(Value::Array(entries)) => entries
            .iter()
            .filter_map(|entry| {
                Some((
                    entry.get("term")?.as_str()?.to_string(),
                    entry.get("translation")?.as_str()?.to_string(),
                ))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Accepts `[{id, translation}]`, `{"translations": [...], "glossary": {...}}`
/// or a single `{id, translation}` object
fn items_from_value(value: Value) -> Result<(Vec<RawItem>, Vec<(String, String)>)> {
    match &value {
        Value::Array(values) => Ok((items_from_array(values), Vec::new())),
        Value::Object(map) => {
            if let Some(Value::Array(values)) = map.get("translations") {
                Ok((items_from_array(values), terms_from_value(map.get("glossary"))))
            } else if let Some(item) = item_from_value(&value) {
                Ok((vec![item], Vec::new()))
            } else {
                Err(TranslationError::MalformedResponse {
                    message: "object without a translations array".to_string(),
                })
            }
        }
        other => Err(TranslationError::MalformedResponse {
            message: format!("unexpected response shape: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ResponseValidator {
        ResponseValidator::new(3)
    }

    #[test]
    fn test_plain_array() {
        let raw = r#"[{"id": 1, "translation": "一"}, {"id": 2, "translation": "二"}]"#;
        let response = validator().validate(raw, &[1, 2]).unwrap();
        assert_eq!(
            response.translations,
            vec![(1, "一".to_string()), (2, "二".to_string())]
        );
        assert_eq!(response.outcome(), BatchState::Succeeded);
        assert!(!response.repaired);
    }

    #[test]
    fn test_code_fence_and_wrapper_with_terms() {
        let raw = "```json\n{\"translations\": [{\"id\": \"3\", \"translation\": \"大他者不存在。\"}], \"glossary\": {\"big Other\": \"大他者\"}}\n```";
        let response = validator().validate(raw, &[3]).unwrap();
        assert_eq!(response.translations, vec![(3, "大他者不存在。".to_string())]);
        assert_eq!(
            response.terms,
            vec![("big Other".to_string(), "大他者".to_string())]
        );
    }

    #[test]
    fn test_missing_unknown_and_duplicate_ids() {
        let raw = r#"[
            {"id": 1, "translation": "一"},
            {"id": 9, "translation": "九"},
            {"id": 1, "translation": "壹"},
            {"id": 3, "translation": "  "}
        ]"#;
        let response = validator().validate(raw, &[1, 2, 3]).unwrap();
        assert_eq!(response.translations, vec![(1, "一".to_string())]);
        assert_eq!(response.missing, vec![2, 3]);
        assert_eq!(response.unknown, vec![9]);
        assert_eq!(response.duplicates, vec![1]);
        assert_eq!(response.outcome(), BatchState::Partial);
    }

    #[test]
    fn test_blank_first_occurrence_is_not_replaced_by_duplicate() {
        let raw = r#"[{"id":1,"translation":"  "},{"id":1,"translation":"SECOND"}]"#;
        let response = validator().validate(raw, &[1]).unwrap();
        assert!(response.translations.is_empty());
        assert_eq!(response.duplicates, vec![1]);
        assert_eq!(response.missing, vec![1]);
        assert_eq!(response.outcome(), BatchState::Failed);
    }

    #[test]
    fn test_parse_terms() {
        let terms = validator()
            .parse_terms("```json\n{\"jouissance\": \"原乐\", \"the Real\": \"实在界\"}\n```")
            .unwrap();
        assert_eq!(terms.len(), 2);
        assert!(terms.contains(&("jouissance".to_string(), "原乐".to_string())));

        let terms = validator()
            .parse_terms(r#"{"glossary": {"big Other": "大他者"}}"#)
            .unwrap();
        assert_eq!(terms, vec![("big Other".to_string(), "大他者".to_string())]);

        assert!(validator().parse_terms("no glossary today").is_err());
    }

    #[test]
    fn test_repairs_missing_closers() {
        let raw = r#"[{"id": 1, "translation": "一"}, {"id": 2, "translation": "二"}"#;
        let response = validator().validate(raw, &[1, 2]).unwrap();
        assert!(response.repaired);
        assert_eq!(response.translations.len(), 2);
    }

    #[test]
    fn test_truncates_incomplete_object() {
        let raw = r#"[{"id": 1, "translation": "一"}, {"id": 2, "translation": "二"#;
        let response = validator().validate(raw, &[1, 2]).unwrap();
        assert!(response.repaired);
        assert_eq!(response.translations, vec![(1, "一".to_string())]);
        assert_eq!(response.missing, vec![2]);
    }

    #[test]
    fn test_truncated_mid_string_is_malformed() {
        let raw = r#"[{"id":1,"translation":"你好"#;
        let err = validator().validate(raw, &[1]).unwrap_err();
        assert!(matches!(err, TranslationError::MalformedResponse { .. }));
    }

    #[test]
    fn test_regex_salvage() {
        let raw = "Here you go: {\"id\": 1, \"translation\": \"一\\\"引\\\"\"} and {\"id\": 2, \"translation\": \"二\"} oops ]";
        let response = validator().validate(raw, &[1, 2]).unwrap();
        assert!(response.repaired);
        assert_eq!(
            response.translations,
            vec![(1, "一\"引\"".to_string()), (2, "二".to_string())]
        );

        let raw = "[{'id': 4, 'translation': 'it\\'s'}";
        let response = validator().validate(raw, &[4]).unwrap();
        assert_eq!(response.translations, vec![(4, "it's".to_string())]);
    }

    #[test]
    fn test_repair_attempts_are_capped() {
        let raw = r#"[{"id": 1, "translation": "一"}, {"id": 2, "translation": "二"#;
        // Only close-delimiters is allowed, and it declines mid-string
        let err = ResponseValidator::new(1).validate(raw, &[1, 2]).unwrap_err();
        assert!(matches!(err, TranslationError::MalformedResponse { .. }));

        assert!(ResponseValidator::new(0)
            .validate(r#"[{"id": 1, "translation": "一"}"#, &[1])
            .is_err());
    }

    #[test]
    fn test_trailing_prose_is_cut() {
        let raw = r#"Sure! [{"id": 5, "translation": "五"}] Let me know if you need more."#;
        let response = validator().validate(raw, &[5]).unwrap();
        assert!(response.repaired);
        assert_eq!(response.translations, vec![(5, "五".to_string())]);
    }

    #[test]
    fn test_empty_array_fails_every_member() {
        let response = validator().validate("[]", &[1, 2]).unwrap();
        assert_eq!(response.missing, vec![1, 2]);
        assert_eq!(response.outcome(), BatchState::Failed);
    }
}
