//! Review prompt text for a single diff hunk.

/// Output contract shared by every hunk review prompt.
const REVIEW_INSTRUCTIONS: &str = r#"You are a senior engineer. Review the unified diff PATCH and return ONLY a JSON array (no prose).
Array schema:
[
  {"filePath":"<string>","startLine":<int>,"endLine":<int>,"severity":"info|warn|error|security","message":"<string>","fixPatch":"<unified diff or omit>"}
]
- Comment only on potential issues or clear improvements.
- Lines refer to NEW file numbering. If unclear, estimate and set startLine=endLine.
- Keep messages concise and actionable."#;

/// `src/app.ts (hunk 2/5)`
pub fn hunk_label(path: &str, index: usize, total: usize) -> String {
    format!("{} (hunk {}/{})", path, index + 1, total)
}

/// Review prompt for one hunk. Pure and deterministic.
pub fn review_prompt(label: &str, hunk: &str) -> String {
    format!("{}\nFILE: {}\nPATCH:\n{}", REVIEW_INSTRUCTIONS, label, hunk)
}
