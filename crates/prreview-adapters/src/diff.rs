//! Multi-file unified diff ingestion (`git diff`, `diff -ru` and plain patches).

use prreview_core::NewPrFile;

const DEV_NULL: &str = "/dev/null";

#[derive(Default)]
struct FileSection {
    git_path: Option<String>,
    old_path: Option<String>,
    new_path: Option<String>,
    patch: Vec<String>,
}

impl FileSection {
    fn path(&self) -> Option<String> {
        match self.new_path.as_deref() {
            Some(DEV_NULL) | None => self
                .old_path
                .clone()
                .filter(|p| p != DEV_NULL)
                .or_else(|| self.git_path.clone()),
            Some(path) => Some(path.to_string()),
        }
    }

    fn finish(self, out: &mut Vec<NewPrFile>) {
        if let Some(path) = self.path() {
            out.push(NewPrFile {
                path,
                patch: self.patch.join("\n"),
            });
        }
    }
}

/// Body lines still owed by the current hunk, from its `@@` header.
#[derive(Debug, Clone, Copy)]
struct HunkBudget {
    old: usize,
    new: usize,
}

impl HunkBudget {
    /// `@@ -start[,count] +start[,count] @@ [section]`
    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("@@")?;
        let ranges = &rest[..rest.find("@@")?];
        let mut parts = ranges.split_whitespace();
        let old = range_count(parts.next()?.strip_prefix('-')?)?;
        let new = range_count(parts.next()?.strip_prefix('+')?)?;
        Some(Self { old, new })
    }

    fn is_open(&self) -> bool {
        self.old > 0 || self.new > 0
    }

    fn consume(&mut self, line: &str) {
        match line.as_bytes().first() {
            Some(b'-') => self.old = self.old.saturating_sub(1),
            Some(b'+') => self.new = self.new.saturating_sub(1),
            Some(b'\\') => {}
            _ => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
            }
        }
    }
}

fn range_count(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((start, count)) => {
            start.parse::<usize>().ok()?;
            count.parse().ok()
        }
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

#[derive(Debug, Clone, Copy)]
enum HunkState {
    /// File headers, before the first `@@`.
    Headers,
    Counted(HunkBudget),
    /// Malformed `@@` header: everything up to the next file is patch text.
    Uncounted,
}

/// Split a multi-file unified diff into per-file patches.
///
/// Accepts `git diff` output as well as plain `diff -u`/`diff -ru` output
/// and concatenated `---`/`+++` patches. Each patch starts at its first `@@`
/// line; headers are dropped. Files with no hunks (binary, mode-only) are
/// kept with an empty patch.
pub fn parse_unified_diff(text: &str) -> Vec<NewPrFile> {
    let mut files = Vec::new();
    let mut current: Option<FileSection> = None;
    let mut state = HunkState::Headers;

    for line in text.lines() {
        if let HunkState::Counted(budget) = &mut state {
            if budget.is_open() {
                budget.consume(line);
                if let Some(section) = current.as_mut() {
                    section.patch.push(line.to_string());
                }
                continue;
            }
        }

        if let Some(rest) = line.strip_prefix("diff ") {
            if let Some(section) = current.take() {
                section.finish(&mut files);
            }
            current = Some(FileSection {
                git_path: header_path(rest),
                ..FileSection::default()
            });
            state = HunkState::Headers;
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            match state {
                // Old-file header of a section opened by a `diff` line.
                HunkState::Headers if current.is_some() => {}
                HunkState::Uncounted => {
                    push_line(&mut current, line);
                    continue;
                }
                // A finished hunk followed by `---` starts the next file.
                _ => {
                    if let Some(section) = current.take() {
                        section.finish(&mut files);
                    }
                    current = Some(FileSection::default());
                    state = HunkState::Headers;
                }
            }
            if let Some(section) = current.as_mut() {
                section.old_path = Some(strip_prefix_dir(rest, "a/"));
            }
            continue;
        }

        if matches!(state, HunkState::Headers) {
            if let Some(rest) = line.strip_prefix("+++ ") {
                let section = current.get_or_insert_with(FileSection::default);
                section.new_path = Some(strip_prefix_dir(rest, "b/"));
                continue;
            }
        }

        if line.starts_with("@@") {
            state = HunkBudget::parse(line).map_or(HunkState::Uncounted, HunkState::Counted);
            push_line(&mut current, line);
            continue;
        }

        match state {
            HunkState::Uncounted => push_line(&mut current, line),
            HunkState::Counted(_) if line.starts_with('\\') => push_line(&mut current, line),
            _ => {}
        }
    }

    if let Some(section) = current {
        section.finish(&mut files);
    }
    files
}

fn push_line(current: &mut Option<FileSection>, line: &str) {
    if let Some(section) = current.as_mut() {
        section.patch.push(line.to_string());
    }
}

fn strip_prefix_dir(raw: &str, prefix: &str) -> String {
    // `+++ b/path\t2024-01-01 ...` carries a timestamp after a tab.
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    raw.strip_prefix(prefix).unwrap_or(raw).to_string()
}

/// Target path from `diff --git a/x b/x` or `diff -ru a/x b/x`.
fn header_path(rest: &str) -> Option<String> {
    rest.rsplit_once(" b/")
        .map(|(_, path)| path.to_string())
        .or_else(|| rest.split_whitespace().last().map(str::to_string))
}
