//! The JSON reply schema the agent expects from a model, together with the
//! normalization pass that canonicalizes the many shapes models actually
//! produce: field aliases, free-form `{"action": ..., "parameters": ...}`
//! envelopes, scalar-vs-list variance and duplicate file edits.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// One requested file edit. `original` is the snippet to replace; an empty
/// `original` means "write `edited` as the whole file".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChange {
    pub file: String,
    #[serde(default)]
    pub original: String,
    #[serde(default)]
    pub edited: String,
}

/// One requested shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `plan` may arrive as prose or as a list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanField {
    Text(String),
    Steps(Vec<String>),
}

impl PlanField {
    /// Flatten to a single display string.
    pub fn as_text(&self) -> String {
        match self {
            PlanField::Text(text) => text.clone(),
            PlanField::Steps(steps) => steps.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSearchKind {
    #[default]
    Text,
    News,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSearchRequest {
    pub queries: Vec<String>,
    #[serde(default)]
    pub kind: WebSearchKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindSymbolRequest {
    pub symbol: String,
    #[serde(default)]
    pub regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpCallRequest {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// One background-terminal operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TerminalRequest {
    Spawn { command: String },
    Input { id: String, input: String },
    Read { id: String },
    Kill { id: String },
}

/// A model reply after normalization. Every field is optional on the wire;
/// absent fields take their `Default`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelReply {
    pub response: String,
    pub thought: Option<String>,
    pub plan: Option<PlanField>,
    pub self_critique: Option<String>,
    pub ask_user_questions: Vec<String>,
    pub request_files: Vec<String>,
    pub web_search: Option<WebSearchRequest>,
    pub web_browse: Vec<String>,
    pub search_project: Option<String>,
    pub detailed_map: bool,
    pub find_symbol: Option<FindSymbolRequest>,
    pub index_project: bool,
    pub lint_project: bool,
    pub terminal: Vec<TerminalRequest>,
    pub changes: Vec<TaskChange>,
    pub commands: Vec<TaskCommand>,
    pub mission_complete: bool,
    pub mcp_call: Option<McpCallRequest>,
}

impl ModelReply {
    /// True when the reply carries at least one tool request that needs a
    /// follow-up pass (file reads, searches, lint, terminal, MCP).
    pub fn wants_tools(&self) -> bool {
        !self.request_files.is_empty()
            || self.web_search.is_some()
            || !self.web_browse.is_empty()
            || self.search_project.is_some()
            || self.detailed_map
            || self.find_symbol.is_some()
            || self.index_project
            || self.lint_project
            || !self.terminal.is_empty()
            || self.mcp_call.is_some()
    }

    /// True when the reply proposes concrete work for this turn.
    pub fn is_actionable(&self) -> bool {
        !self.changes.is_empty() || !self.commands.is_empty() || !self.ask_user_questions.is_empty()
    }
}

/// Canonical names for every schema key plus the aliases models use for
/// them. Matching is case-insensitive.
const RESPONSE_ALIASES: &[&str] = &[
    "response",
    "message",
    "reply",
    "answer",
    "output",
    "result",
    "assistant_response",
    "final_response",
    "finalanswer",
];

const THOUGHT_ALIASES: &[&str] = &["thought", "reasoning", "analysis", "thinking"];

const KNOWN_KEYS: &[&str] = &[
    "response",
    "thought",
    "plan",
    "self_critique",
    "ask_user",
    "ask_user_questions",
    "request_files",
    "web_search",
    "web_search_type",
    "web_search_limit",
    "web_browse",
    "search_project",
    "detailed_map",
    "find_symbol",
    "index_project",
    "lint_project",
    "terminal_spawn",
    "terminal_input",
    "terminal_read",
    "terminal_kill",
    "changes",
    "commands",
    "mission_complete",
    "mcp_call",
];

fn canonical_key(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_ascii_lowercase();
    if RESPONSE_ALIASES.contains(&lowered.as_str()) {
        return Some("response");
    }
    if THOUGHT_ALIASES.contains(&lowered.as_str()) {
        return Some("thought");
    }
    KNOWN_KEYS.iter().find(|k| **k == lowered).copied()
}

/// Discard later duplicates so a batch holds at most one change per file.
pub fn dedupe_changes(changes: Vec<TaskChange>) -> Vec<TaskChange> {
    let mut seen = HashSet::new();
    changes
        .into_iter()
        .filter(|c| seen.insert(c.file.clone()))
        .collect()
}

/// Normalize an arbitrary parsed JSON value into a [`ModelReply`].
///
/// Non-object input produces a reply whose `response` is the value's text
/// rendering, mirroring the "synthesize a minimal response" fallback.
pub fn normalize_reply(value: &Value) -> ModelReply {
    let Some(object) = value.as_object() else {
        return ModelReply {
            response: value_to_text(value),
            ..Default::default()
        };
    };

    let canonical = canonicalize_object(object);

    let mut reply = ModelReply {
        response: canonical
            .get("response")
            .map(value_to_text)
            .unwrap_or_default(),
        thought: canonical.get("thought").and_then(opt_text),
        plan: canonical.get("plan").and_then(parse_plan),
        self_critique: canonical.get("self_critique").and_then(opt_text),
        ask_user_questions: collect_questions(&canonical),
        request_files: canonical
            .get("request_files")
            .map(string_list)
            .unwrap_or_default(),
        web_search: parse_web_search(&canonical),
        web_browse: canonical
            .get("web_browse")
            .map(parse_web_browse)
            .unwrap_or_default(),
        search_project: canonical.get("search_project").and_then(parse_search),
        detailed_map: truthy(canonical.get("detailed_map")),
        find_symbol: canonical.get("find_symbol").and_then(parse_find_symbol),
        index_project: truthy(canonical.get("index_project")),
        lint_project: truthy(canonical.get("lint_project")),
        terminal: parse_terminal(&canonical),
        changes: Vec::new(),
        commands: canonical
            .get("commands")
            .map(parse_commands)
            .unwrap_or_default(),
        mission_complete: truthy(canonical.get("mission_complete")),
        mcp_call: canonical
            .get("mcp_call")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
    };

    if let Some(raw_changes) = canonical.get("changes") {
        reply.changes = dedupe_changes(parse_changes(raw_changes));
    }

    reply
}

/// Lowercase keys, resolve aliases (first occurrence wins) and unwrap a
/// free-form `{"action": ..., "parameters": ...}` envelope into the schema
/// key it names.
fn canonicalize_object(object: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in object {
        if let Some(canonical) = canonical_key(key)
            && !out.contains_key(canonical)
        {
            out.insert(canonical.to_string(), value.clone());
        }
    }

    // Action envelope: `{"action": "web_search", "parameters": {...}}`.
    if let Some(action) = object.get("action").and_then(Value::as_str)
        && let Some(canonical) = canonical_key(action)
        && !out.contains_key(canonical)
    {
        let params = object
            .get("parameters")
            .or_else(|| object.get("params"))
            .or_else(|| object.get("arguments"))
            .cloned()
            .unwrap_or(Value::Bool(true));
        out.insert(canonical.to_string(), params);
    }

    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn opt_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        _ => false,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_plan(value: &Value) -> Option<PlanField> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(PlanField::Text(s.clone())),
        Value::Array(_) => {
            let steps = string_list(value);
            if steps.is_empty() {
                None
            } else {
                Some(PlanField::Steps(steps))
            }
        }
        _ => None,
    }
}

/// Merge `ask_user` (scalar or list) and `ask_user_questions` into one
/// ordered, de-duplicated question list.
fn collect_questions(object: &Map<String, Value>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut questions = Vec::new();
    for key in ["ask_user", "ask_user_questions"] {
        if let Some(value) = object.get(key) {
            for q in string_list(value) {
                if seen.insert(q.clone()) {
                    questions.push(q);
                }
            }
        }
    }
    questions
}

fn parse_web_search(object: &Map<String, Value>) -> Option<WebSearchRequest> {
    let raw = object.get("web_search")?;
    let queries = match raw {
        Value::Object(inner) => inner
            .get("queries")
            .or_else(|| inner.get("query"))
            .map(string_list)
            .unwrap_or_default(),
        other => string_list(other),
    };
    if queries.is_empty() {
        return None;
    }

    let kind = match object
        .get("web_search_type")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("news") => WebSearchKind::News,
        _ => WebSearchKind::Text,
    };
    let limit = object
        .get("web_search_limit")
        .and_then(Value::as_u64)
        .map(|v| v as usize);

    Some(WebSearchRequest {
        queries,
        kind,
        limit,
    })
}

fn parse_web_browse(value: &Value) -> Vec<String> {
    match value {
        Value::Object(inner) => inner
            .get("urls")
            .or_else(|| inner.get("url"))
            .map(string_list)
            .unwrap_or_default(),
        other => string_list(other),
    }
}

fn parse_search(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(inner) => inner
            .get("pattern")
            .or_else(|| inner.get("query"))
            .and_then(opt_text),
        _ => None,
    }
}

fn parse_find_symbol(value: &Value) -> Option<FindSymbolRequest> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(FindSymbolRequest {
            symbol: s.clone(),
            regex: false,
        }),
        Value::Object(inner) => {
            let symbol = inner.get("symbol").and_then(opt_text)?;
            Some(FindSymbolRequest {
                symbol,
                regex: truthy(inner.get("regex")),
            })
        }
        _ => None,
    }
}

fn parse_terminal(object: &Map<String, Value>) -> Vec<TerminalRequest> {
    let mut requests = Vec::new();
    if let Some(spawn) = object.get("terminal_spawn") {
        let command = match spawn {
            Value::Object(inner) => inner.get("command").and_then(opt_text),
            other => opt_text(other),
        };
        if let Some(command) = command {
            requests.push(TerminalRequest::Spawn { command });
        }
    }
    if let Some(Value::Object(inner)) = object.get("terminal_input")
        && let (Some(id), Some(input)) = (
            inner.get("id").and_then(opt_text),
            inner
                .get("input")
                .or_else(|| inner.get("line"))
                .or_else(|| inner.get("text"))
                .and_then(opt_text),
        )
    {
        requests.push(TerminalRequest::Input { id, input });
    }
    if let Some(value) = object.get("terminal_read")
        && let Some(id) = terminal_id(value)
    {
        requests.push(TerminalRequest::Read { id });
    }
    if let Some(value) = object.get("terminal_kill")
        && let Some(id) = terminal_id(value)
    {
        requests.push(TerminalRequest::Kill { id });
    }
    requests
}

fn terminal_id(value: &Value) -> Option<String> {
    match value {
        Value::Object(inner) => inner
            .get("id")
            .or_else(|| inner.get("handle"))
            .and_then(opt_text),
        other => opt_text(other),
    }
}

fn parse_changes(value: &Value) -> Vec<TaskChange> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let file = object
                .get("file")
                .or_else(|| object.get("path"))
                .and_then(opt_text)?;
            Some(TaskChange {
                file,
                original: object
                    .get("original")
                    .map(value_to_text)
                    .unwrap_or_default(),
                edited: object.get("edited").map(value_to_text).unwrap_or_default(),
            })
        })
        .collect()
}

fn parse_commands(value: &Value) -> Vec<TaskCommand> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(command) if !command.trim().is_empty() => Some(TaskCommand {
                command: command.clone(),
                reason: None,
            }),
            Value::Object(object) => {
                let command = object
                    .get("command")
                    .or_else(|| object.get("cmd"))
                    .and_then(opt_text)?;
                Some(TaskCommand {
                    command,
                    reason: object.get("reason").and_then(opt_text),
                })
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn response_aliases_are_canonicalized() {
        let reply = normalize_reply(&json!({"finalAnswer": "done", "reasoning": "because"}));
        assert_eq!(reply.response, "done");
        assert_eq!(reply.thought.as_deref(), Some("because"));
    }

    #[test]
    fn ask_user_merges_scalar_and_list_uniquely() {
        let reply = normalize_reply(&json!({
            "ask_user": "Which file?",
            "ask_user_questions": ["Which file?", "Which branch?"]
        }));
        assert_eq!(
            reply.ask_user_questions,
            vec!["Which file?".to_string(), "Which branch?".to_string()]
        );
    }

    #[test]
    fn action_envelope_becomes_schema_key() {
        let reply = normalize_reply(&json!({
            "action": "web_search",
            "parameters": {"queries": ["rust tokio"]}
        }));
        let search = reply.web_search.unwrap();
        assert_eq!(search.queries, vec!["rust tokio".to_string()]);
    }

    #[test]
    fn duplicate_changes_keep_first() {
        let reply = normalize_reply(&json!({
            "changes": [
                {"file": "a.rs", "original": "x", "edited": "y"},
                {"file": "a.rs", "original": "p", "edited": "q"},
                {"file": "b.rs", "original": "", "edited": "fresh"}
            ]
        }));
        assert_eq!(reply.changes.len(), 2);
        assert_eq!(reply.changes[0].file, "a.rs");
        assert_eq!(reply.changes[0].edited, "y");
        assert_eq!(reply.changes[1].file, "b.rs");
    }

    #[test]
    fn web_search_accepts_bare_list_and_options() {
        let reply = normalize_reply(&json!({
            "web_search": ["a", "b"],
            "web_search_type": "news",
            "web_search_limit": 5
        }));
        let search = reply.web_search.unwrap();
        assert_eq!(search.queries.len(), 2);
        assert_eq!(search.kind, WebSearchKind::News);
        assert_eq!(search.limit, Some(5));
    }

    #[test]
    fn terminal_requests_are_collected_in_fixed_order() {
        let reply = normalize_reply(&json!({
            "terminal_read": {"id": "t1"},
            "terminal_spawn": {"command": "npm run dev"}
        }));
        assert_eq!(
            reply.terminal,
            vec![
                TerminalRequest::Spawn {
                    command: "npm run dev".to_string()
                },
                TerminalRequest::Read {
                    id: "t1".to_string()
                },
            ]
        );
    }

    #[test]
    fn non_object_input_becomes_plain_response() {
        let reply = normalize_reply(&json!("just text"));
        assert_eq!(reply.response, "just text");
        assert!(!reply.wants_tools());
    }

    #[test]
    fn commands_accept_strings_and_objects() {
        let reply = normalize_reply(&json!({
            "commands": ["cargo check", {"command": "cargo test", "reason": "verify"}]
        }));
        assert_eq!(reply.commands.len(), 2);
        assert_eq!(reply.commands[1].reason.as_deref(), Some("verify"));
    }
}
