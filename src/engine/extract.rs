//! Structured-JSON extraction from free-form agent output.
//!
//! Agents wrap their JSON in prose or fences even when told not to, so
//! candidates are tried in order: the whole text, the first ```json fence,
//! then every balanced `{...}` substring. The first candidate that parses
//! and carries the required key wins.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

/// Outcome of [`extract_json`].
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A JSON object carrying the required key was found.
    Parsed(Value),
    /// Nothing parsed but the text reports an explicit failure; a minimal
    /// failure-shaped object was built instead.
    Synthesized(Value),
    /// Neither a usable object nor a failure keyword.
    Unparseable,
}

impl Extraction {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Extraction::Parsed(v) | Extraction::Synthesized(v) => Some(v),
            Extraction::Unparseable => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Extraction::Parsed(v) | Extraction::Synthesized(v) => Some(v),
            Extraction::Unparseable => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed(_))
    }
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)```").expect("valid fence regex"))
}

fn failure_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:verdict\W{0,3}fail(?:ed)?|FAIL(?:ED)?|NEEDS[_ ]IMPROVEMENT)\b")
            .expect("valid failure regex")
    })
}

/// Extract the first JSON object in `text` that contains `required_key`.
pub fn extract_json(text: &str, required_key: &str) -> Extraction {
    let accepts = |value: &Value| value.get(required_key).is_some();

    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if accepts(&value) {
            return Extraction::Parsed(value);
        }
    }

    if let Some(body) = fence_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    {
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
            if accepts(&value) {
                return Extraction::Parsed(value);
            }
        }
    }

    for candidate in balanced_objects(text) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if accepts(&value) {
                return Extraction::Parsed(value);
            }
        }
    }

    if let Some(m) = failure_regex().find(text) {
        return Extraction::Synthesized(synthesize_failure(required_key, text, m.as_str()));
    }
    Extraction::Unparseable
}

fn synthesize_failure(required_key: &str, text: &str, keyword: &str) -> Value {
    let mut obj = Map::new();
    obj.insert(required_key.to_string(), json!("FAIL"));
    obj.insert("synthesized".to_string(), json!(true));
    obj.insert("matched".to_string(), json!(keyword));
    obj.insert(
        "feedback".to_string(),
        json!(text.trim().chars().take(2000).collect::<String>()),
    );
    Value::Object(obj)
}

/// Every balanced `{...}` substring, in order of opening brace.
///
/// Braces inside JSON strings (including escaped quotes) do not count.
/// Nested objects are yielded after their enclosing object so an outer
/// wrapper without the key still lets the inner one match.
pub fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();

    for (start, &b) in bytes.iter().enumerate() {
        if b != b'{' {
            continue;
        }
        if let Some(end) = matching_brace(bytes, start) {
            found.push(&text[start..=end]);
        }
    }
    found
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
