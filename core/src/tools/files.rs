//! `request_files`: attach file contents to the next turn.

use std::path::Path;

use super::truncate_for_model;

/// Per-file byte cap before truncation.
pub const FILE_BYTE_CAP: usize = 64 * 1024;

/// Read one requested path. Directories and missing paths are errors the
/// model sees verbatim.
pub fn read_requested_file(path: &str) -> Result<String, String> {
    let p = Path::new(path);
    if p.is_dir() {
        return Err(format!("{path} is a directory, not a file"));
    }
    match std::fs::read_to_string(p) {
        Ok(content) => Ok(truncate_for_model(&content, FILE_BYTE_CAP)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(format!("{path} does not exist"))
        }
        Err(e) => Err(format!("failed to read {path}: {e}")),
    }
}

/// Render a batch of reads as one block for the follow-up turn.
pub fn format_file_results(results: &[(String, Result<String, String>)]) -> String {
    let mut out = String::new();
    for (path, result) in results {
        match result {
            Ok(content) => {
                out.push_str(&format!("=== {path} ===\n{content}\n"));
            }
            Err(error) => {
                out.push_str(&format!("=== {path} ===\n[error] {error}\n"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_and_missing_paths_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dir_str = dir.path().to_string_lossy().into_owned();
        assert!(read_requested_file(&dir_str).is_err());
        assert!(read_requested_file("definitely/not/here.txt").is_err());
    }

    #[test]
    fn files_are_read_and_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(FILE_BYTE_CAP + 100)).expect("seed");
        let content =
            read_requested_file(&path.to_string_lossy()).expect("read");
        assert!(content.ends_with("[truncated]"));
    }
}
