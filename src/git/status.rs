//! Working tree status, staging rules and batch commit messages

use serde::Serialize;
use std::collections::BTreeSet;

/// Path fragments that are never committed
const EXCLUDED_DIRS: &[&str] = &["indexes/", ".locks/", ".conflicts/", "__pycache__/", ".cache/"];

/// File name suffixes that are never committed
const EXCLUDED_SUFFIXES: &[&str] = &[".tmp", "~"];

/// Changed paths, grouped the way git reports them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkingTreeStatus {
    /// Changes already in the index
    pub staged: Vec<String>,
    /// Tracked files modified in the working tree
    pub modified: Vec<String>,
    /// Untracked files
    pub added: Vec<String>,
    /// Tracked files deleted from the working tree
    pub deleted: Vec<String>,
    /// Unmerged paths
    pub conflicted: Vec<String>,
}

impl WorkingTreeStatus {
    pub fn is_clean(&self) -> bool {
        self.changed_paths().is_empty()
    }

    /// Every path with a pending change, deduplicated and sorted
    pub fn changed_paths(&self) -> BTreeSet<String> {
        self.staged
            .iter()
            .chain(&self.modified)
            .chain(&self.added)
            .chain(&self.deleted)
            .chain(&self.conflicted)
            .cloned()
            .collect()
    }

    /// Changed paths that may be committed
    pub fn stageable(&self) -> Vec<String> {
        self.changed_paths().into_iter().filter(|p| is_stageable(p)).collect()
    }
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Entries are NUL-separated `XY path`; renames and copies are followed by
/// one extra field holding the original path.
pub fn parse_porcelain(raw: &str) -> WorkingTreeStatus {
    let mut status = WorkingTreeStatus::default();
    let mut fields = raw.split('\0').filter(|f| !f.is_empty());

    while let Some(entry) = fields.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let mut chars = code.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        let path = path.to_string();

        if matches!(x, 'R' | 'C') {
            fields.next();
        }

        match (x, y) {
            ('?', '?') => status.added.push(path),
            ('!', '!') => {}
            ('U', _) | (_, 'U') | ('A', 'A') | ('D', 'D') => status.conflicted.push(path),
            _ => {
                if matches!(x, 'M' | 'A' | 'D' | 'R' | 'C' | 'T') {
                    status.staged.push(path.clone());
                }
                match y {
                    'M' | 'T' => status.modified.push(path),
                    'D' => status.deleted.push(path),
                    _ => {}
                }
            }
        }
    }
    status
}

/// Whether a repository-relative path may be committed
pub fn is_stageable(path: &str) -> bool {
    let path = path.replace('\\', "/");
    let in_excluded_dir = EXCLUDED_DIRS.iter().any(|dir| {
        path.starts_with(dir) || path.contains(&format!("/{dir}"))
    });
    !in_excluded_dir && !EXCLUDED_SUFFIXES.iter().any(|s| path.ends_with(s))
}

/// Counts of staged paths by kind, used for generated commit messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub nodes: usize,
    pub links: usize,
    pub claims: usize,
    pub history: usize,
    pub other: usize,
}

impl BatchSummary {
    pub fn of<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut summary = Self::default();
        for path in paths {
            let path = path.as_ref();
            let segments: Vec<&str> = path.split('/').collect();
            let under = |dir: &str| segments.iter().rev().skip(1).any(|s| *s == dir);
            if under(".claims") {
                summary.claims += 1;
            } else if under("history") {
                summary.history += 1;
            } else if under("links") {
                summary.links += 1;
            } else if under("nodes") {
                summary.nodes += 1;
            } else {
                summary.other += 1;
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.nodes + self.links + self.claims + self.history + self.other
    }

    pub fn message(&self, contributor: &str) -> String {
        let parts: Vec<String> = [
            (self.nodes, "nodes"),
            (self.links, "links"),
            (self.claims, "claims"),
            (self.history, "history"),
            (self.other, "other"),
        ]
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
        if parts.is_empty() {
            format!("Batch from {contributor}")
        } else {
            format!("Batch from {contributor}: {}", parts.join(", "))
        }
    }
}
