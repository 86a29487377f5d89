//! Per-apply diff statistics, appended as one NDJSON record per batch to
//! `logs/diffs-YYYY-MM-DD.ndjson`.

use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use pilot_apply::AppliedFile;
use serde::Deserialize;
use serde::Serialize;
use similar::ChangeTag;
use similar::TextDiff;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDiffStat {
    pub file: String,
    pub added: usize,
    pub removed: usize,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffBatchRecord {
    pub timestamp: DateTime<Utc>,
    pub files: Vec<FileDiffStat>,
    pub total_added: usize,
    pub total_removed: usize,
}

/// Line-level +/- counts for every non-noop file in an applied batch.
pub fn batch_stats(applied: &[AppliedFile]) -> DiffBatchRecord {
    let mut files = Vec::new();
    for file in applied {
        if file.noop {
            continue;
        }
        let previous = file.previous_content.as_deref().unwrap_or("");
        let diff = TextDiff::from_lines(previous, &file.next_content);
        let mut added = 0;
        let mut removed = 0;
        for change in diff.iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => added += 1,
                ChangeTag::Delete => removed += 1,
                ChangeTag::Equal => {}
            }
        }
        files.push(FileDiffStat {
            file: file.path.to_string_lossy().into_owned(),
            added,
            removed,
            created: !file.existed_before,
        });
    }
    DiffBatchRecord {
        timestamp: Utc::now(),
        total_added: files.iter().map(|f| f.added).sum(),
        total_removed: files.iter().map(|f| f.removed).sum(),
        files,
    }
}

pub struct DiffLog {
    logs_dir: PathBuf,
}

impl DiffLog {
    pub fn new(home: &Path) -> Self {
        Self {
            logs_dir: home.join("logs"),
        }
    }

    pub fn record(&self, record: &DiffBatchRecord) {
        if let Err(err) = self.append(record) {
            warn!("failed to append diff log: {err}");
        }
    }

    fn append(&self, record: &DiffBatchRecord) -> std::io::Result<()> {
        use std::io::Write;

        std::fs::create_dir_all(&self.logs_dir)?;
        let path = self
            .logs_dir
            .join(format!("diffs-{}.ndjson", Utc::now().format("%Y-%m-%d")));
        let mut line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::other(format!("serialize diff record: {e}")))?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn created_files_count_every_line_as_added() {
        let applied = vec![AppliedFile {
            path: PathBuf::from("new.rs"),
            existed_before: false,
            previous_content: None,
            next_content: "a\nb\nc\n".to_string(),
            noop: false,
        }];
        let record = batch_stats(&applied);
        assert_eq!(record.files.len(), 1);
        assert_eq!(record.files[0].added, 3);
        assert_eq!(record.files[0].removed, 0);
        assert!(record.files[0].created);
    }

    #[test]
    fn noop_entries_are_skipped() {
        let applied = vec![AppliedFile {
            path: PathBuf::from("same.rs"),
            existed_before: true,
            previous_content: Some("x\n".to_string()),
            next_content: "x\n".to_string(),
            noop: true,
        }];
        let record = batch_stats(&applied);
        assert!(record.files.is_empty());
        assert_eq!(record.total_added, 0);
    }
}
