//! Diff chunker: clamp a file patch and split it into bounded hunks.

use prreview_adapters::config::PatchConfig;
use prreview_core::util::truncate_str;

/// Keep the first `max_lines` lines, then at most `max_chars` characters.
pub fn clamp_patch(patch: &str, max_lines: usize, max_chars: usize) -> String {
    let clipped = patch
        .split('\n')
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n");
    truncate_str(&clipped, max_chars).to_string()
}

/// Split at every `@@` line. Text before the first marker is its own hunk.
pub fn split_into_hunks(patch: &str) -> Vec<String> {
    if patch.is_empty() {
        return Vec::new();
    }
    let mut hunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in patch.split('\n') {
        if line.starts_with("@@") && !current.is_empty() {
            hunks.push(current.join("\n"));
            current.clear();
        }
        current.push(line);
    }
    if !current.is_empty() {
        hunks.push(current.join("\n"));
    }
    hunks
}

/// A clamped patch and its first `max_hunks_per_file` hunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedPatch {
    pub clamped: String,
    pub hunks: Vec<String>,
}

pub fn chunk_patch(patch: &str, limits: &PatchConfig) -> ChunkedPatch {
    let clamped = clamp_patch(patch, limits.max_lines, limits.max_chars);
    let mut hunks = split_into_hunks(&clamped);
    hunks.truncate(limits.max_hunks_per_file);
    ChunkedPatch { clamped, hunks }
}
