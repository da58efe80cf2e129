//! Unified diff parsing.
//!
//! Extracts the touched-file sets and per-file hunk ranges that the conflict
//! detector works on. Only headers and hunk markers are interpreted; hunk
//! bodies are never validated here (that is `git apply --check`'s job).

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::models::{LineChange, LineChangeKind};

/// Files and line ranges touched by a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub files_added: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,
    pub line_changes: BTreeMap<String, Vec<LineChange>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Added,
    Modified,
    Deleted,
}

struct FileBlock {
    path: String,
    kind: FileKind,
    from_git_header: bool,
    saw_hunk: bool,
    hunks: Vec<LineChange>,
}

impl FileBlock {
    fn new(path: String, from_git_header: bool) -> Self {
        Self {
            path,
            kind: FileKind::Modified,
            from_git_header,
            saw_hunk: false,
            hunks: Vec::new(),
        }
    }
}

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("static hunk regex")
    })
}

/// Strip the `a/` / `b/` prefix and any trailing timestamp from a header path.
fn clean_path(raw: &str) -> String {
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_string()
}

/// `a/old b/new` -> `new`.
fn git_header_path(rest: &str) -> Option<String> {
    rest.find(" b/").map(|idx| rest[idx + 3..].trim_end().to_string())
}

fn parse_hunk(line: &str) -> Option<LineChange> {
    let caps = hunk_header().captures(line)?;
    let num = |i: usize, default: u32| {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(default)
    };
    let old_count = num(2, 1);
    let new_start = num(3, 0);
    let new_count = num(4, 1);

    let kind = if old_count == 0 {
        LineChangeKind::Add
    } else if new_count == 0 {
        LineChangeKind::Delete
    } else {
        LineChangeKind::Modify
    };
    Some(LineChange::new(new_start, new_start + new_count, kind))
}

fn push_unique(list: &mut Vec<String>, path: &str) {
    if !list.iter().any(|p| p == path) {
        list.push(path.to_string());
    }
}

fn flush(summary: &mut PatchSummary, block: Option<FileBlock>) {
    let Some(block) = block else { return };
    match block.kind {
        FileKind::Added => push_unique(&mut summary.files_added, &block.path),
        FileKind::Modified => push_unique(&mut summary.files_modified, &block.path),
        FileKind::Deleted => push_unique(&mut summary.files_deleted, &block.path),
    }
    if !block.hunks.is_empty() {
        summary
            .line_changes
            .entry(block.path)
            .or_default()
            .extend(block.hunks);
    }
}

/// Parse `git diff` (or plain unified diff) output.
pub fn parse_patch(content: &str) -> PatchSummary {
    let mut summary = PatchSummary::default();
    let mut current: Option<FileBlock> = None;
    let mut minus_path: Option<String> = None;

    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            flush(&mut summary, current.take());
            minus_path = None;
            current = git_header_path(rest).map(|p| FileBlock::new(p, true));
            continue;
        }

        if let Some(block) = current.as_mut() {
            if block.from_git_header && !block.saw_hunk {
                if line.starts_with("new file mode") {
                    block.kind = FileKind::Added;
                    continue;
                }
                if line.starts_with("deleted file mode") {
                    block.kind = FileKind::Deleted;
                    continue;
                }
            }
        }

        let in_git_block = current.as_ref().is_some_and(|b| b.from_git_header);

        if let Some(path) = line.strip_prefix("--- ") {
            if !in_git_block || current.as_ref().is_some_and(|b| !b.saw_hunk) {
                minus_path = Some(clean_path(path));
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("+++ ") {
            if in_git_block {
                continue;
            }
            // Plain unified diff: the +++ header opens a new file block.
            flush(&mut summary, current.take());
            let plus = clean_path(path);
            let minus = minus_path.take();
            let block = if plus == "/dev/null" {
                minus.map(|m| {
                    let mut b = FileBlock::new(m, false);
                    b.kind = FileKind::Deleted;
                    b
                })
            } else {
                let mut b = FileBlock::new(plus, false);
                if minus.as_deref() == Some("/dev/null") {
                    b.kind = FileKind::Added;
                }
                Some(b)
            };
            current = block;
            continue;
        }

        if line.starts_with("@@") {
            if let (Some(block), Some(change)) = (current.as_mut(), parse_hunk(line)) {
                block.saw_hunk = true;
                block.hunks.push(change);
            }
        }
    }

    flush(&mut summary, current);
    summary
}
