//! Per-turn request assembly.
//!
//! A [`TaskPayload`] is built fresh for every provider call: the
//! instruction, an execution contract for the current mode, any files the
//! instruction references (read through the caller-supplied reader so the
//! access policy stays in charge), token-budgeted session history and the
//! optional project map.

use pilot_protocol::SessionEntry;
use serde::Serialize;
use serde_json::Value;

use crate::config::ConfigShape;
use crate::session::inject_history;

const HISTORY_MAX_MESSAGES: usize = 40;
/// Each attached file is cut at this many bytes.
const CONTEXT_FILE_MAX_BYTES: usize = 48 * 1024;

const BUILD_INTENT_KEYWORDS: &[&str] = &[
    "build", "create", "implement", "add", "write", "fix", "refactor", "update", "make",
    "generate", "develop", "rename", "delete",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    Plan,
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContract {
    pub phase: TaskMode,
    pub must_use_changes_for_code: bool,
    pub no_code_blocks_in_response_during_apply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ContextFile {
    Content { path: String, content: String },
    Error { path: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub mode: TaskMode,
    pub fast: bool,
    pub instruction: String,
    pub build_intent: bool,
    pub referenced_paths: Vec<String>,
    pub execution_contract: ExecutionContract,
    pub user_os: String,
    pub raw_input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_level: Option<String>,
    pub context_files: Vec<ContextFile>,
    pub session_history: Vec<SessionEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_map: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_listing: Option<String>,
    pub image_files: Vec<String>,
    /// True when the provider can resume from cached prompt context.
    pub continuation_warm: bool,
}

impl TaskPayload {
    /// The JSON text sent as the user message.
    pub fn to_provider_text(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.instruction.clone())
    }
}

pub struct TaskInputs<'a> {
    pub instruction: &'a str,
    pub raw_input: &'a str,
    pub plan_mode: bool,
    pub fast: bool,
    pub history: &'a [SessionEntry],
    pub mission_data: Option<Value>,
    pub project_map: Option<String>,
    pub project_listing: Option<String>,
    pub continuation_warm: bool,
}

/// Build the payload for one turn. `read_file` is consulted for every
/// referenced path; an `Err` becomes an inline error entry so the model
/// knows the file was requested but unreadable (or denied).
pub fn build_task<F>(config: &ConfigShape, inputs: TaskInputs<'_>, mut read_file: F) -> TaskPayload
where
    F: FnMut(&str) -> std::result::Result<String, String>,
{
    let mode = if inputs.plan_mode {
        TaskMode::Plan
    } else {
        TaskMode::Apply
    };

    let referenced_paths = extract_referenced_paths(inputs.instruction);
    let mut context_files = Vec::new();
    let mut image_files = Vec::new();
    for path in &referenced_paths {
        if is_image_path(path) {
            image_files.push(path.clone());
            continue;
        }
        match read_file(path) {
            Ok(content) => context_files.push(ContextFile::Content {
                path: path.clone(),
                content: truncate_bytes(&content, CONTEXT_FILE_MAX_BYTES),
            }),
            Err(error) => context_files.push(ContextFile::Error {
                path: path.clone(),
                error,
            }),
        }
    }

    let provider = config.active();
    let history_token_limit = provider.context_window / 2;

    TaskPayload {
        mode,
        fast: inputs.fast,
        instruction: inputs.instruction.to_string(),
        build_intent: has_build_intent(inputs.instruction),
        referenced_paths,
        execution_contract: ExecutionContract {
            phase: mode,
            must_use_changes_for_code: mode == TaskMode::Apply,
            no_code_blocks_in_response_during_apply: mode == TaskMode::Apply,
        },
        user_os: std::env::consts::OS.to_string(),
        raw_input: inputs.raw_input.to_string(),
        effort_level: config.policies.effort_level.clone(),
        reasoning_level: config.policies.reasoning_level.clone(),
        context_files,
        session_history: inject_history(inputs.history, HISTORY_MAX_MESSAGES, history_token_limit),
        mission_data: inputs.mission_data,
        project_map: inputs.project_map,
        project_listing: inputs.project_listing,
        image_files,
        continuation_warm: inputs.continuation_warm,
    }
}

/// Keyword heuristic over the instruction.
pub fn has_build_intent(instruction: &str) -> bool {
    instruction
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| {
            let lowered = word.to_ascii_lowercase();
            BUILD_INTENT_KEYWORDS.contains(&lowered.as_str())
        })
}

/// Path-shaped tokens in the instruction that actually exist on disk.
pub fn extract_referenced_paths(instruction: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut paths = Vec::new();
    for token in instruction.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| {
            matches!(c, '"' | '\'' | '`' | ',' | ';' | ':' | '(' | ')' | '[' | ']' | '?' | '!')
        });
        if trimmed.is_empty() {
            continue;
        }
        let path_like = trimmed.contains('/') || trimmed.contains('\\') || {
            std::path::Path::new(trimmed)
                .extension()
                .is_some_and(|ext| !ext.is_empty())
        };
        if !path_like {
            continue;
        }
        if std::path::Path::new(trimmed).is_file() && seen.insert(trimmed.to_string()) {
            paths.push(trimmed.to_string());
        }
    }
    paths
}

fn is_image_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn truncate_bytes(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n… [truncated]", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_intent_matches_whole_words_only() {
        assert!(has_build_intent("please implement the parser"));
        assert!(has_build_intent("Fix the login bug"));
        assert!(!has_build_intent("what does this function do?"));
        // "additional" contains "add" but is not the keyword.
        assert!(!has_build_intent("explain the additional options"));
    }

    #[test]
    fn referenced_paths_must_exist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hello").expect("seed");
        let file_str = file.to_string_lossy().into_owned();

        let instruction = format!("summarize {file_str} and also missing/void.txt");
        let paths = extract_referenced_paths(&instruction);
        assert_eq!(paths, vec![file_str]);
    }

    #[test]
    fn plan_mode_relaxes_the_execution_contract() {
        let config = ConfigShape::default();
        let payload = build_task(
            &config,
            TaskInputs {
                instruction: "plan the refactor",
                raw_input: "plan the refactor",
                plan_mode: true,
                fast: false,
                history: &[],
                mission_data: None,
                project_map: None,
                project_listing: None,
                continuation_warm: false,
            },
            |_| Err("unused".to_string()),
        );
        assert_eq!(payload.mode, TaskMode::Plan);
        assert!(!payload.execution_contract.must_use_changes_for_code);
    }

    #[test]
    fn unreadable_files_become_error_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("data.csv");
        std::fs::write(&file, "a,b").expect("seed");
        let file_str = file.to_string_lossy().into_owned();

        let config = ConfigShape::default();
        let payload = build_task(
            &config,
            TaskInputs {
                instruction: &format!("inspect {file_str}"),
                raw_input: "",
                plan_mode: false,
                fast: false,
                history: &[],
                mission_data: None,
                project_map: None,
                project_listing: None,
                continuation_warm: false,
            },
            |path| Err(format!("denied: {path}")),
        );
        assert_eq!(payload.context_files.len(), 1);
        assert!(matches!(&payload.context_files[0], ContextFile::Error { .. }));
    }
}
