//! Response parser and per-item normalizer.

use prreview_core::{Severity, SuggestionDraft, SuggestionLimits, UNKNOWN_FILE};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?i)```json|```").ok())
        .as_ref()
}

/// Strip markdown fence markers anywhere in the text.
fn strip_markdown_fences(text: &str) -> String {
    match fence_regex() {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.replace("```json", "").replace("```", "").trim().to_string(),
    }
}

/// Parse raw model output into array items. Anything other than a JSON
/// array yields an empty list.
pub fn parse_suggestion_array(text: &str) -> Vec<Value> {
    let cleaned = strip_markdown_fences(text);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Numeric coercion for line fields: numbers and numeric strings only.
fn finite_number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn to_line(n: f64) -> u32 {
    if n < 1.0 {
        1
    } else if n >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        n as u32
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Coerce one model-emitted item into a bounded draft for `file_path`.
///
/// Idempotent: feeding the serialized result back in yields the same draft.
pub fn normalize_item(item: &Value, file_path: &str, limits: &SuggestionLimits) -> SuggestionDraft {
    let field = |key: &str| item.get(key);

    let path = match field("filePath") {
        Some(Value::String(p)) if !p.is_empty() && p != UNKNOWN_FILE => p.clone(),
        _ => file_path.to_string(),
    };

    let start = finite_number(field("startLine")).map(to_line).unwrap_or(1);
    let end = finite_number(field("endLine")).map(to_line).unwrap_or(start);

    let message = match field("message") {
        None | Some(Value::Null) => String::new(),
        Some(v) => stringify(v),
    };
    let fix_patch = field("fixPatch").filter(|v| is_truthy(v)).map(stringify);

    SuggestionDraft {
        file_path: path,
        start_line: start,
        end_line: end,
        severity: Severity::coerce(field("severity")),
        message,
        fix_patch,
    }
    .clamped(limits)
}

pub fn normalize_items(
    items: &[Value],
    file_path: &str,
    limits: &SuggestionLimits,
) -> Vec<SuggestionDraft> {
    items
        .iter()
        .map(|item| normalize_item(item, file_path, limits))
        .collect()
}
