//! Per-session transcript persistence and context management.
//!
//! One JSON file per session under `<agent-home>/sessions/`, with a
//! plaintext `.active_session` marker naming the current one. Entries are
//! appended in turn order; writes take an advisory lock so a stray second
//! process cannot interleave a save.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use fs2::FileExt;
use pilot_protocol::Role;
use pilot_protocol::SessionEntry;
use pilot_protocol::SessionFile;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sha1::Digest;
use sha1::Sha1;

use crate::error::AgentErr;
use crate::error::Result;

const SESSIONS_SUBDIR: &str = "sessions";
const ACTIVE_MARKER: &str = ".active_session";
const CONTINUATION_KEY: &str = "continuation";
const SPENT_TOKENS_KEY: &str = "spent_tokens";

pub const COMPACT_HEADER: &str = "### SESSION COMPACTED";

/// Approximate token count: one token per four bytes of content.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

pub fn session_tokens(file: &SessionFile) -> u64 {
    file.session
        .iter()
        .map(|entry| estimate_tokens(&entry.content))
        .sum()
}

/// Walk entries newest-first, keep them while the running token total stays
/// within `token_limit` (and at most `max_messages`), then restore original
/// order.
pub fn inject_history(
    entries: &[SessionEntry],
    max_messages: usize,
    token_limit: u64,
) -> Vec<SessionEntry> {
    let mut picked: Vec<SessionEntry> = Vec::new();
    let mut budget = 0u64;
    for entry in entries.iter().rev() {
        if picked.len() == max_messages {
            break;
        }
        let cost = estimate_tokens(&entry.content);
        if budget + cost > token_limit {
            break;
        }
        budget += cost;
        picked.push(entry.clone());
    }
    picked.reverse();
    picked
}

/// Deterministic compaction: keep the last `keep_recent` entries verbatim
/// and replace everything earlier with one synthetic assistant summary that
/// enumerates up to `max_summary_entries` replaced turns, each truncated to
/// 180 characters. Running it again on a freshly-compacted session is a
/// no-op.
pub fn compact(file: &mut SessionFile, keep_recent: usize, max_summary_entries: usize) -> bool {
    if file.session.len() <= keep_recent {
        return false;
    }
    if file.session.len() == keep_recent + 1
        && file
            .session
            .first()
            .is_some_and(|entry| entry.content.starts_with(COMPACT_HEADER))
    {
        return false;
    }

    let split = file.session.len() - keep_recent;
    let replaced: Vec<SessionEntry> = file.session.drain(..split).collect();

    let mut summary = String::from(COMPACT_HEADER);
    summary.push('\n');
    for (idx, entry) in replaced.iter().take(max_summary_entries).enumerate() {
        let role = match entry.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut text: String = entry.content.chars().take(180).collect();
        if entry.content.chars().count() > 180 {
            text.push('…');
        }
        summary.push_str(&format!("{}. [{role}] {}\n", idx + 1, text.replace('\n', " ")));
    }
    if replaced.len() > max_summary_entries {
        summary.push_str(&format!(
            "(+{} earlier turns omitted)\n",
            replaced.len() - max_summary_entries
        ));
    }

    file.session
        .insert(0, SessionEntry::new(Role::Assistant, summary, 0));
    true
}

/// Cached provider continuation state for the designated local provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationCache {
    pub continuation_tokens: Value,
    pub model_name: String,
    pub saved_at: chrono::DateTime<Utc>,
    pub valid: bool,
    pub prompt_fingerprint: String,
}

/// SHA-1 hex digest used to detect a changed system prompt.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn read_continuation(file: &SessionFile) -> Option<ContinuationCache> {
    file.metadata
        .get(CONTINUATION_KEY)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

pub fn write_continuation(file: &mut SessionFile, cache: &ContinuationCache) {
    if let Ok(value) = serde_json::to_value(cache) {
        file.metadata.insert(CONTINUATION_KEY.to_string(), value);
    }
}

pub fn invalidate_continuation(file: &mut SessionFile) {
    if let Some(mut cache) = read_continuation(file) {
        cache.valid = false;
        write_continuation(file, &cache);
    }
}

/// The cache is warm only when it is valid, for the current model, and the
/// system prompt has not changed since it was saved.
pub fn continuation_is_warm(file: &SessionFile, model: &str, system_prompt: &str) -> bool {
    read_continuation(file).is_some_and(|cache| {
        cache.valid && cache.model_name == model && cache.prompt_fingerprint == fingerprint(system_prompt)
    })
}

pub fn spent_tokens(file: &SessionFile) -> u64 {
    file.metadata
        .get(SPENT_TOKENS_KEY)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

pub fn add_spent_tokens(file: &mut SessionFile, tokens: u64) {
    let total = spent_tokens(file) + tokens;
    file.metadata
        .insert(SPENT_TOKENS_KEY.to_string(), Value::from(total));
}

pub struct SessionStore {
    home: PathBuf,
}

impl SessionStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.home.join(SESSIONS_SUBDIR)
    }

    fn session_path(&self, name: &str) -> PathBuf {
        self.sessions_dir().join(format!("{name}.json"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.session_path(name).exists()
    }

    pub fn load(&self, name: &str) -> Result<SessionFile> {
        let path = self.session_path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AgentErr::SessionNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    pub fn load_or_create(&self, name: &str) -> Result<SessionFile> {
        match self.load(name) {
            Ok(file) => Ok(file),
            Err(AgentErr::SessionNotFound(_)) => Ok(SessionFile::new(name)),
            Err(e) => Err(e),
        }
    }

    /// Serialize and atomically replace the session file, holding an
    /// exclusive advisory lock for the duration of the write.
    pub fn save(&self, file: &SessionFile) -> Result<()> {
        let dir = self.sessions_dir();
        std::fs::create_dir_all(&dir)?;
        let path = self.session_path(&file.name);

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        lock.lock_exclusive()?;

        let text = serde_json::to_string_pretty(file)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(&path).map_err(|e| AgentErr::Io(e.error))?;

        let _ = fs2::FileExt::unlock(&lock);
        Ok(())
    }

    pub fn active_session_name(&self) -> Option<String> {
        let marker = self.home.join(ACTIVE_MARKER);
        std::fs::read_to_string(marker)
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|name| !name.is_empty())
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        std::fs::create_dir_all(&self.home)?;
        std::fs::write(self.home.join(ACTIVE_MARKER), name)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        let Ok(read) = std::fs::read_dir(self.sessions_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = read
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".json").map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(role: Role, content: &str) -> SessionEntry {
        SessionEntry::new(role, content, 0)
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn history_injection_prefers_recent_entries() {
        let entries: Vec<SessionEntry> = (0..10)
            .map(|i| entry(Role::User, &format!("message number {i:02}")))
            .collect();
        // Each entry is 17 bytes => 5 tokens; a 12-token budget fits two.
        let injected = inject_history(&entries, 100, 12);
        assert_eq!(injected.len(), 2);
        assert_eq!(injected[0].content, "message number 08");
        assert_eq!(injected[1].content, "message number 09");
    }

    #[test]
    fn history_injection_respects_max_messages() {
        let entries: Vec<SessionEntry> =
            (0..10).map(|i| entry(Role::User, &format!("{i}"))).collect();
        let injected = inject_history(&entries, 3, 1_000_000);
        assert_eq!(injected.len(), 3);
        assert_eq!(injected[0].content, "7");
    }

    #[test]
    fn compaction_keeps_recent_entries_bit_exact() {
        let mut file = SessionFile::new("t");
        for i in 0..30 {
            file.session.push(entry(
                if i % 2 == 0 { Role::User } else { Role::Assistant },
                &format!("turn {i}"),
            ));
        }
        let recent: Vec<SessionEntry> = file.session[22..].to_vec();

        assert!(compact(&mut file, 8, 24));
        assert_eq!(file.session.len(), 9);
        assert!(file.session[0].content.starts_with(COMPACT_HEADER));
        assert_eq!(&file.session[1..], recent.as_slice());
    }

    #[test]
    fn compaction_is_idempotent() {
        let mut file = SessionFile::new("t");
        for i in 0..30 {
            file.session.push(entry(Role::User, &format!("turn {i}")));
        }
        assert!(compact(&mut file, 8, 24));
        let once = file.clone();
        assert!(!compact(&mut file, 8, 24));
        assert_eq!(file, once);
    }

    #[test]
    fn session_file_round_trips_bit_exact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        let mut file = SessionFile::new("roundtrip");
        file.session.push(entry(Role::User, "hello\nworld"));
        file.session.push(entry(Role::Assistant, "done ✅"));
        file.metadata
            .insert("custom".to_string(), Value::from("kept"));
        store.save(&file).expect("save");

        let loaded = store.load("roundtrip").expect("load");
        assert_eq!(loaded, file);
    }

    #[test]
    fn active_marker_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(dir.path());
        assert_eq!(store.active_session_name(), None);
        store.set_active("main").expect("set");
        assert_eq!(store.active_session_name().as_deref(), Some("main"));
    }

    #[test]
    fn continuation_cache_gates_on_model_and_fingerprint() {
        let mut file = SessionFile::new("t");
        let cache = ContinuationCache {
            continuation_tokens: Value::from(vec![1, 2, 3]),
            model_name: "m1".to_string(),
            saved_at: Utc::now(),
            valid: true,
            prompt_fingerprint: fingerprint("system prompt"),
        };
        write_continuation(&mut file, &cache);

        assert!(continuation_is_warm(&file, "m1", "system prompt"));
        assert!(!continuation_is_warm(&file, "m2", "system prompt"));
        assert!(!continuation_is_warm(&file, "m1", "different prompt"));

        invalidate_continuation(&mut file);
        assert!(!continuation_is_warm(&file, "m1", "system prompt"));
    }
}
