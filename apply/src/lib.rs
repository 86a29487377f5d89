//! Transactional application of a batch of file edits.
//!
//! Each edit names a file, the `original` snippet to replace and the
//! `edited` replacement. Matching falls back through decreasing strictness:
//! exact containment (every occurrence is replaced), newline-normalized
//! containment, then a trimmed line-block window splice. A batch is applied
//! in order with a pre-write snapshot per file; the first failure rolls the
//! already-written files back in reverse order. Successful batches land on
//! an in-memory undo stack.

mod seek_block;

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use seek_block::find_block;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEdit {
    pub path: PathBuf,
    pub original: String,
    pub edited: String,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    /// The `original` snippet was not found by any match strategy.
    #[error("original snippet not found in {path}")]
    MatchFailed { path: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ApplyError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ApplyError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Pre-write state of one file, kept for rollback and undo.
#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub existed_before: bool,
    pub previous_content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Start,
    Done,
}

/// Outcome for one file in a successfully applied batch.
#[derive(Debug, Clone)]
pub struct AppliedFile {
    pub path: PathBuf,
    pub existed_before: bool,
    pub previous_content: Option<String>,
    pub next_content: String,
    /// True when the file already matched the edited content and nothing
    /// was written.
    pub noop: bool,
}

pub type ProgressCallback<'a> = dyn FnMut(&Path, bool, usize, usize, ProgressPhase) + 'a;

/// Applies edit batches and remembers their snapshots for undo.
#[derive(Default)]
pub struct Applier {
    undo: Vec<Vec<FileSnapshot>>,
}

impl Applier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches available to [`Applier::undo_last_apply`].
    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    /// Apply `edits` in order. On the first failure every file written so
    /// far is rolled back (best effort) and the error is returned. The
    /// caller is expected to have collapsed duplicate paths already; this
    /// function applies whatever it is given.
    pub fn apply(
        &mut self,
        edits: &[FileEdit],
        mut progress: Option<&mut ProgressCallback<'_>>,
    ) -> Result<Vec<AppliedFile>, ApplyError> {
        let mut snapshots: Vec<FileSnapshot> = Vec::new();
        let mut applied = Vec::new();
        let total = edits.len();

        for (idx, edit) in edits.iter().enumerate() {
            let existed_before = edit.path.exists();
            let previous_content = if existed_before {
                match fs::read_to_string(&edit.path) {
                    Ok(content) => Some(content),
                    Err(source) => {
                        rollback(&snapshots);
                        return Err(ApplyError::io(
                            format!("failed to read {}", edit.path.display()),
                            source,
                        ));
                    }
                }
            } else {
                None
            };

            if let Some(cb) = progress.as_deref_mut() {
                cb(&edit.path, existed_before, idx, total, ProgressPhase::Start);
            }

            let next_content = match compute_next(
                previous_content.as_deref(),
                &edit.original,
                &edit.edited,
            ) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    applied.push(AppliedFile {
                        path: edit.path.clone(),
                        existed_before,
                        next_content: previous_content.clone().unwrap_or_default(),
                        previous_content,
                        noop: true,
                    });
                    if let Some(cb) = progress.as_deref_mut() {
                        cb(&edit.path, existed_before, idx, total, ProgressPhase::Done);
                    }
                    continue;
                }
                Err(_) => {
                    rollback(&snapshots);
                    return Err(ApplyError::MatchFailed {
                        path: edit.path.clone(),
                    });
                }
            };

            snapshots.push(FileSnapshot {
                path: edit.path.clone(),
                existed_before,
                previous_content: previous_content.clone(),
            });

            if let Err(err) = write_atomic(&edit.path, &next_content) {
                rollback(&snapshots);
                return Err(err);
            }

            applied.push(AppliedFile {
                path: edit.path.clone(),
                existed_before,
                previous_content,
                next_content,
                noop: false,
            });

            if let Some(cb) = progress.as_deref_mut() {
                cb(&edit.path, existed_before, idx, total, ProgressPhase::Done);
            }
        }

        if !snapshots.is_empty() {
            self.undo.push(snapshots);
        }
        Ok(applied)
    }

    /// Reverse the most recent batch with the same rollback policy used on
    /// failure. Returns false when the stack is empty.
    pub fn undo_last_apply(&mut self) -> bool {
        match self.undo.pop() {
            Some(batch) => {
                rollback(&batch);
                true
            }
            None => false,
        }
    }
}

/// Restore snapshots in reverse order: rewrite files that existed before,
/// delete files created by the batch. Per-entry failures are swallowed so
/// one stuck file does not prevent restoring the rest.
fn rollback(snapshots: &[FileSnapshot]) {
    for snapshot in snapshots.iter().rev() {
        if snapshot.existed_before {
            if let Some(previous) = &snapshot.previous_content {
                let _ = fs::write(&snapshot.path, previous);
            }
        } else {
            let _ = fs::remove_file(&snapshot.path);
        }
    }
}

struct NoMatch;

/// Compute the next content for a file, or `Ok(None)` when the edit is a
/// no-op because the file already holds the edited content.
///
/// An `original` that occurs more than once is replaced at every
/// occurrence; models are prompted with that contract, so a partial
/// replacement must quote an unambiguous snippet.
fn compute_next(
    current: Option<&str>,
    original: &str,
    edited: &str,
) -> Result<Option<String>, NoMatch> {
    if original.is_empty() {
        return Ok(Some(edited.to_string()));
    }

    let Some(current) = current else {
        return Err(NoMatch);
    };

    if current.contains(original) {
        return Ok(Some(current.replace(original, edited)));
    }

    let normalized_current = normalize_newlines(current);
    let normalized_original = normalize_newlines(original);
    if normalized_current.contains(&normalized_original) {
        let normalized_edited = normalize_newlines(edited);
        return Ok(Some(
            normalized_current.replace(&normalized_original, &normalized_edited),
        ));
    }

    if let Some(next) = splice_block(current, original, edited) {
        return Ok(Some(next));
    }

    if current.trim() == edited.trim() {
        return Ok(None);
    }

    Err(NoMatch)
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Line-block fallback: match the non-empty trimmed lines of `original`
/// against a window of the file and splice `edited` in its place.
fn splice_block(current: &str, original: &str, edited: &str) -> Option<String> {
    let pattern: Vec<&str> = original
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if pattern.is_empty() {
        return None;
    }

    let lines: Vec<&str> = current.lines().collect();
    let start = find_block(&lines, &pattern)?;

    let mut next_lines: Vec<&str> = Vec::with_capacity(lines.len());
    next_lines.extend_from_slice(&lines[..start]);
    next_lines.extend(edited.lines());
    next_lines.extend_from_slice(&lines[start + pattern.len()..]);

    let mut next = next_lines.join("\n");
    if current.ends_with('\n') {
        next.push('\n');
    }
    Some(next)
}

/// Durable write: create parent directories, write to a sibling temp file,
/// then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), ApplyError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .map_err(|e| ApplyError::io(format!("failed to create {}", parent.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&parent)
        .map_err(|e| ApplyError::io(format!("failed to stage write for {}", path.display()), e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| ApplyError::io(format!("failed to write {}", path.display()), e))?;
    tmp.persist(path)
        .map_err(|e| ApplyError::io(format!("failed to persist {}", path.display()), e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn next(current: Option<&str>, original: &str, edited: &str) -> Option<String> {
        compute_next(current, original, edited).ok().flatten()
    }

    #[test]
    fn empty_original_is_a_full_file_write() {
        assert_eq!(next(None, "", "fresh"), Some("fresh".to_string()));
        assert_eq!(next(Some("old"), "", "fresh"), Some("fresh".to_string()));
    }

    #[test]
    fn exact_match_replaces_every_occurrence() {
        assert_eq!(
            next(Some("a b a"), "a", "z"),
            Some("z b z".to_string()),
        );
    }

    #[test]
    fn crlf_content_matches_lf_snippet() {
        let current = "fn main() {\r\n    old();\r\n}\r\n";
        let got = next(Some(current), "    old();\n", "    new();\n");
        assert_eq!(got, Some("fn main() {\n    new();\n}\n".to_string()));
    }

    #[test]
    fn block_fallback_tolerates_reindentation() {
        let current = "start\n        alpha();\n        beta();\nend\n";
        let got = next(Some(current), "alpha();\nbeta();", "gamma();");
        assert_eq!(got, Some("start\ngamma();\nend\n".to_string()));
    }

    #[test]
    fn already_edited_content_is_a_noop() {
        let result = compute_next(Some("  done  "), "missing snippet", "done");
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn unmatched_original_fails() {
        assert!(compute_next(Some("abc"), "zzz", "yyy").is_err());
    }

    #[test]
    fn missing_file_with_nonempty_original_fails() {
        assert!(compute_next(None, "snippet", "edit").is_err());
    }
}
