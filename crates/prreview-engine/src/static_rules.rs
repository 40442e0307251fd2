//! Pattern checks used when inference produced nothing for a file.
//!
//! No line correlation is attempted; every hint is anchored at line 1.

use prreview_core::{Severity, SuggestionDraft};
use regex::Regex;
use std::sync::OnceLock;

const EVAL_MESSAGE: &str =
    "Avoid eval(): security and performance risk. Use safe parsing or explicit functions.";
const INNER_HTML_MESSAGE: &str =
    "Direct innerHTML can enable XSS. Prefer textContent or sanitize inputs.";
const DEBUG_LOG_MESSAGE: &str = "Remove stray console.log in production code.";

struct Rules {
    eval_call: Regex,
    console_log: Regex,
}

fn rules() -> Option<&'static Rules> {
    static RULES: OnceLock<Option<Rules>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            Some(Rules {
                eval_call: Regex::new(r"(?i)\beval\s*\(").ok()?,
                console_log: Regex::new(r"(?i)console\.log\(").ok()?,
            })
        })
        .as_ref()
}

/// Run every rule independently over `patch`.
pub fn analyze_patch(path: &str, patch: &str) -> Vec<SuggestionDraft> {
    let Some(rules) = rules() else {
        return Vec::new();
    };
    let mut hints = Vec::new();

    if rules.eval_call.is_match(patch) {
        hints.push(SuggestionDraft::file_note(path, Severity::Security, EVAL_MESSAGE));
    }
    if patch.to_lowercase().contains("innerhtml") {
        hints.push(SuggestionDraft::file_note(
            path,
            Severity::Security,
            INNER_HTML_MESSAGE,
        ));
    }
    if rules.console_log.is_match(patch) && patch.contains("return ") {
        hints.push(SuggestionDraft::file_note(path, Severity::Info, DEBUG_LOG_MESSAGE));
    }

    hints
}
