//! Persisted session transcript and command-log records.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub changes_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(role: Role, content: impl Into<String>, changes_count: usize) -> Self {
        Self {
            role,
            content: content.into(),
            changes_count,
            timestamp: Utc::now(),
        }
    }
}

/// One JSON file per session. `metadata` is a free map that may hold
/// provider-specific continuation state and accumulated usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    pub name: String,
    #[serde(default)]
    pub session: Vec<SessionEntry>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session: Vec::new(),
            metadata: Map::new(),
        }
    }
}

/// One line of `logs/commands-YYYY-MM-DD.ndjson`. `exit_code` is `None` on
/// timeout or spawn failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecutionRecord {
    pub command: String,
    pub cwd: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub timeout_ms: u64,
    pub exit_code: Option<i64>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}
