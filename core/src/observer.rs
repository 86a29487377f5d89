//! Incremental observer for a JSON object arriving left-to-right.
//!
//! Provider output is fed in chunks; at every chunk boundary the observer
//! exposes a best-effort view of the object so far: growing string fields
//! (`response`, `thought`, ...), newly seen top-level schema keys, one-shot
//! tool signals and the paths of in-flight file edits. No complete document
//! is ever required.
//!
//! String fields decode incrementally from a saved byte offset in a single
//! growing buffer. A closing quote is ambiguous until the next
//! non-whitespace character arrives: `,`, `}`, `]` or a following `"` means
//! the string really ended, anything else means the model embedded a raw
//! quote and decoding continues. A quote whose follower has not arrived yet
//! is held back, so a chunk boundary can never truncate a field.

use std::collections::BTreeMap;
use std::collections::HashSet;

pub const DEFAULT_TRACKED_FIELDS: &[&str] =
    &["response", "thought", "plan", "self_critique", "ask_user"];

pub const DEFAULT_TOOL_KEYS: &[&str] = &[
    "changes",
    "commands",
    "request_files",
    "web_search",
    "web_browse",
    "search_project",
    "detailed_map",
    "find_symbol",
    "terminal_spawn",
    "terminal_input",
    "terminal_read",
    "terminal_kill",
    "index_project",
    "lint_project",
    "mcp_call",
];

const RAW_TAIL_CHARS: usize = 3000;

/// What one `ingest` call surfaced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutput {
    /// Field name -> characters appended since the previous ingest.
    pub deltas: BTreeMap<String, String>,
    /// Newly completed `"file": "..."` paths, each reported once.
    pub file_edits: Vec<String>,
    /// Top-level keys seen for the first time.
    pub new_schema_keys: Vec<String>,
    /// Tool keys seen for the first time.
    pub tool_signals: Vec<String>,
}

/// Point-in-time view of everything decoded so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverSnapshot {
    pub fields: BTreeMap<String, String>,
    pub raw_tail: String,
    pub seen_schema_keys: Vec<String>,
    pub seen_tool_keys: Vec<String>,
}

pub struct StreamObserver {
    buffer: String,
    fields: Vec<FieldState>,
    tool_keys: Vec<ToolKeyState>,
    key_scan: KeyScanState,
    seen_schema_keys: Vec<String>,
    seen_files: HashSet<String>,
    file_order: Vec<String>,
}

struct ToolKeyState {
    name: String,
    signaled: bool,
}

#[derive(Default)]
struct FieldState {
    name: String,
    /// Where to resume looking for `"name" :` while unmatched.
    search_from: usize,
    /// Byte offset of the next content byte to consume, once matched.
    pos: Option<usize>,
    decoded: String,
    /// Bytes of `decoded` already emitted as deltas.
    emitted: usize,
    /// Offset of a closing-candidate quote whose follower has not arrived.
    held_quote: Option<usize>,
    closed: bool,
    /// The value turned out not to be a string (list-form `plan` etc).
    not_a_string: bool,
}

/// Incremental depth-aware scanner for top-level object keys.
#[derive(Default)]
struct KeyScanState {
    pos: usize,
    object_depth: i32,
    array_depth: i32,
    in_string: bool,
    escaped: bool,
    string_start: usize,
    /// A string completed at top level; waiting for `:` to call it a key.
    pending_key: Option<(usize, usize)>,
}

impl Default for StreamObserver {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRACKED_FIELDS.iter().map(|s| s.to_string()),
            DEFAULT_TOOL_KEYS.iter().map(|s| s.to_string()),
        )
    }
}

impl StreamObserver {
    pub fn new(
        tracked_fields: impl IntoIterator<Item = String>,
        tool_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            buffer: String::new(),
            fields: tracked_fields
                .into_iter()
                .map(|name| FieldState {
                    name,
                    ..FieldState::default()
                })
                .collect(),
            tool_keys: tool_keys
                .into_iter()
                .map(|name| ToolKeyState {
                    name,
                    signaled: false,
                })
                .collect(),
            key_scan: KeyScanState::default(),
            seen_schema_keys: Vec::new(),
            seen_files: HashSet::new(),
            file_order: Vec::new(),
        }
    }

    pub fn ingest(&mut self, chunk: &str) -> IngestOutput {
        self.buffer.push_str(chunk);
        let mut output = IngestOutput::default();

        for idx in 0..self.fields.len() {
            self.advance_field(idx);
            let field = &mut self.fields[idx];
            if field.decoded.len() > field.emitted {
                let delta = field.decoded[field.emitted..].to_string();
                field.emitted = field.decoded.len();
                output.deltas.insert(field.name.clone(), delta);
            }
        }

        output.new_schema_keys = self.scan_schema_keys();
        output.tool_signals = self.scan_tool_signals();
        output.file_edits = self.scan_file_edits();
        output
    }

    pub fn snapshot(&self) -> ObserverSnapshot {
        let fields = self
            .fields
            .iter()
            .filter(|f| !f.decoded.is_empty())
            .map(|f| (f.name.clone(), f.decoded.clone()))
            .collect();
        let tail_start = self
            .buffer
            .char_indices()
            .rev()
            .nth(RAW_TAIL_CHARS.saturating_sub(1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        ObserverSnapshot {
            fields,
            raw_tail: self.buffer[tail_start..].to_string(),
            seen_schema_keys: self.seen_schema_keys.clone(),
            seen_tool_keys: self
                .tool_keys
                .iter()
                .filter(|k| k.signaled)
                .map(|k| k.name.clone())
                .collect(),
        }
    }

    /// The concatenated raw stream.
    pub fn raw(&self) -> &str {
        &self.buffer
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name && !f.decoded.is_empty())
            .map(|f| f.decoded.as_str())
    }

    pub fn saw_tool_key(&self, name: &str) -> bool {
        self.tool_keys.iter().any(|k| k.name == name && k.signaled)
    }

    pub fn file_edits(&self) -> &[String] {
        &self.file_order
    }

    /// Locate the field's opening `"name" : "` if not found yet, then
    /// consume as much of the value as the buffer allows.
    fn advance_field(&mut self, idx: usize) {
        let (name, mut search_from, mut pos) = {
            let field = &self.fields[idx];
            if field.closed || field.not_a_string {
                return;
            }
            (field.name.clone(), field.search_from, field.pos)
        };

        if pos.is_none() {
            match find_string_value_start(&self.buffer, &name, search_from) {
                FieldStart::Found(start) => pos = Some(start),
                FieldStart::NotAString => {
                    self.fields[idx].not_a_string = true;
                    return;
                }
                FieldStart::Pending(resume_at) => {
                    search_from = resume_at;
                    self.fields[idx].search_from = search_from;
                    return;
                }
            }
        }

        let field = &mut self.fields[idx];
        field.pos = pos;
        let Some(start) = pos else {
            return;
        };
        let (consumed, closed) = decode_incremental(
            &self.buffer,
            start,
            &mut field.decoded,
            &mut field.held_quote,
        );
        field.pos = Some(consumed);
        field.closed = closed;
    }

    fn scan_schema_keys(&mut self) -> Vec<String> {
        let bytes = self.buffer.as_bytes();
        let scan = &mut self.key_scan;
        let mut fresh = Vec::new();

        while scan.pos < bytes.len() {
            let b = bytes[scan.pos];

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if b == b'\\' {
                    scan.escaped = true;
                } else if b == b'"' {
                    scan.in_string = false;
                    if scan.object_depth == 1 && scan.array_depth == 0 {
                        scan.pending_key = Some((scan.string_start, scan.pos));
                    }
                }
                scan.pos += 1;
                continue;
            }

            if let Some((start, end)) = scan.pending_key {
                if b.is_ascii_whitespace() {
                    scan.pos += 1;
                    continue;
                }
                if b == b':' {
                    let key = self.buffer[start..end].to_string();
                    if !self.seen_schema_keys.contains(&key) {
                        self.seen_schema_keys.push(key.clone());
                        fresh.push(key);
                    }
                }
                scan.pending_key = None;
                continue;
            }

            match b {
                b'"' => {
                    scan.in_string = true;
                    scan.escaped = false;
                    scan.string_start = scan.pos + 1;
                }
                b'{' => scan.object_depth += 1,
                b'}' => scan.object_depth -= 1,
                b'[' => scan.array_depth += 1,
                b']' => scan.array_depth -= 1,
                _ => {}
            }
            scan.pos += 1;
        }
        fresh
    }

    fn scan_tool_signals(&mut self) -> Vec<String> {
        let mut fresh = Vec::new();
        for key in &mut self.tool_keys {
            if !key.signaled && find_key_colon(&self.buffer, &key.name) {
                key.signaled = true;
                fresh.push(key.name.clone());
            }
        }
        fresh
    }

    fn scan_file_edits(&mut self) -> Vec<String> {
        let mut fresh = Vec::new();
        let mut from = 0;
        while let Some(start) = find_string_value_at(&self.buffer, "file", from) {
            match decode_complete_string(&self.buffer, start) {
                Some((path, after)) => {
                    if !path.is_empty() && self.seen_files.insert(path.clone()) {
                        self.file_order.push(path.clone());
                        fresh.push(path);
                    }
                    from = after;
                }
                // Value still streaming; try again on the next ingest.
                None => break,
            }
        }
        fresh
    }
}

enum FieldStart {
    /// Byte offset of the first value byte (after the opening quote).
    Found(usize),
    /// The key is present but its value is not a string.
    NotAString,
    /// Not found yet; resume searching at the given offset.
    Pending(usize),
}

/// Search for `"name"` ws `:` ws `"` from `from`, tolerating a chunk
/// boundary anywhere inside the pattern.
fn find_string_value_start(buffer: &str, name: &str, from: usize) -> FieldStart {
    let needle = format!("\"{name}\"");
    let bytes = buffer.as_bytes();
    let mut search = from;

    while let Some(found) = buffer[search..].find(&needle).map(|i| search + i) {
        let mut i = found + needle.len();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == bytes.len() {
            // Pattern may still complete; do not skip past this occurrence.
            return FieldStart::Pending(found);
        }
        if bytes[i] != b':' {
            search = found + 1;
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i == bytes.len() {
            return FieldStart::Pending(found);
        }
        return if bytes[i] == b'"' {
            FieldStart::Found(i + 1)
        } else {
            FieldStart::NotAString
        };
    }

    // Keep a small overlap so a needle split across chunks is still found.
    let mut resume = buffer.len().saturating_sub(needle.len() + 1).max(from);
    while resume > 0 && !buffer.is_char_boundary(resume) {
        resume -= 1;
    }
    FieldStart::Pending(resume)
}

/// Like [`find_string_value_start`] but returns only complete `Found`
/// positions, for patterns that may repeat (`"file"`).
fn find_string_value_at(buffer: &str, name: &str, from: usize) -> Option<usize> {
    match find_string_value_start(buffer, name, from) {
        FieldStart::Found(start) => Some(start),
        _ => None,
    }
}

/// Consume value bytes from `start`, appending decoded characters. Returns
/// `(next_offset, closed)`. Incomplete escapes and ambiguous quotes are
/// left unconsumed so the next call resumes exactly where this one left
/// off.
fn decode_incremental(
    buffer: &str,
    start: usize,
    decoded: &mut String,
    held_quote: &mut Option<usize>,
) -> (usize, bool) {
    let bytes = buffer.as_bytes();
    let mut pos = start;

    loop {
        // Resolve a held closing-candidate quote first.
        if let Some(quote_at) = *held_quote {
            let mut peek = quote_at + 1;
            while peek < bytes.len() && bytes[peek].is_ascii_whitespace() {
                peek += 1;
            }
            if peek == bytes.len() {
                // Still ambiguous.
                return (quote_at, false);
            }
            if matches!(bytes[peek], b',' | b'}' | b']' | b'"') {
                *held_quote = None;
                return (quote_at + 1, true);
            }
            // Embedded quote: emit it and resume right after.
            decoded.push('"');
            *held_quote = None;
            pos = quote_at + 1;
        }

        if pos >= bytes.len() {
            return (pos, false);
        }

        match bytes[pos] {
            b'"' => {
                *held_quote = Some(pos);
                // Loop around to resolve (or hold) it.
            }
            b'\\' => match decode_escape(bytes, pos) {
                EscapeResult::Decoded(c, next) => {
                    decoded.push(c);
                    pos = next;
                }
                EscapeResult::Incomplete => return (pos, false),
                EscapeResult::Invalid(next) => {
                    decoded.push('\u{fffd}');
                    pos = next;
                }
            },
            _ => {
                // One full UTF-8 character.
                let Some(c) = buffer[pos..].chars().next() else {
                    return (pos, false);
                };
                decoded.push(c);
                pos += c.len_utf8();
            }
        }
    }
}

enum EscapeResult {
    Decoded(char, usize),
    /// The escape continues past the end of the buffer.
    Incomplete,
    Invalid(usize),
}

fn decode_escape(bytes: &[u8], backslash: usize) -> EscapeResult {
    let Some(kind) = bytes.get(backslash + 1) else {
        return EscapeResult::Incomplete;
    };
    let simple = match kind {
        b'n' => Some('\n'),
        b'r' => Some('\r'),
        b't' => Some('\t'),
        b'"' => Some('"'),
        b'\\' => Some('\\'),
        b'/' => Some('/'),
        b'b' => Some('\u{8}'),
        b'f' => Some('\u{c}'),
        b'u' => None,
        _ => return EscapeResult::Invalid(backslash + 2),
    };
    if let Some(c) = simple {
        return EscapeResult::Decoded(c, backslash + 2);
    }

    let Some(high) = read_hex4(bytes, backslash + 2) else {
        return if bytes.len() < backslash + 6 {
            EscapeResult::Incomplete
        } else {
            EscapeResult::Invalid(backslash + 2)
        };
    };

    if (0xd800..0xdc00).contains(&high) {
        // High surrogate: needs a following `\uXXXX`.
        let tail = backslash + 6;
        if bytes.len() < tail + 6 {
            if bytes.get(tail).is_none_or(|b| *b == b'\\') {
                return EscapeResult::Incomplete;
            }
            return EscapeResult::Invalid(tail);
        }
        if bytes[tail] == b'\\' && bytes[tail + 1] == b'u' {
            if let Some(low) = read_hex4(bytes, tail + 2)
                && (0xdc00..0xe000).contains(&low)
            {
                let combined =
                    0x10000 + ((high as u32 - 0xd800) << 10) + (low as u32 - 0xdc00);
                if let Some(c) = char::from_u32(combined) {
                    return EscapeResult::Decoded(c, tail + 6);
                }
            }
        }
        return EscapeResult::Invalid(tail);
    }

    match char::from_u32(high as u32) {
        Some(c) => EscapeResult::Decoded(c, backslash + 6),
        None => EscapeResult::Invalid(backslash + 6),
    }
}

fn read_hex4(bytes: &[u8], at: usize) -> Option<u16> {
    if bytes.len() < at + 4 {
        return None;
    }
    let mut value: u16 = 0;
    for b in &bytes[at..at + 4] {
        let digit = (*b as char).to_digit(16)?;
        value = value.wrapping_shl(4) | digit as u16;
    }
    Some(value)
}

/// Completed-string decode used for `"file"` values: returns `None` while
/// the closing quote has not arrived.
fn decode_complete_string(buffer: &str, start: usize) -> Option<(String, usize)> {
    let mut decoded = String::new();
    let mut held = None;
    let (pos, closed) = decode_incremental(buffer, start, &mut decoded, &mut held);
    if closed { Some((decoded, pos)) } else { None }
}

/// One-shot signal scan: `"key"` ws `:` anywhere in the buffer.
fn find_key_colon(buffer: &str, key: &str) -> bool {
    let needle = format!("\"{key}\"");
    let bytes = buffer.as_bytes();
    let mut search = 0;
    while let Some(found) = buffer[search..].find(&needle).map(|i| search + i) {
        let mut i = found + needle.len();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b':' {
            return true;
        }
        search = found + 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ingest_all(observer: &mut StreamObserver, text: &str, splits: &[usize]) -> Vec<IngestOutput> {
        let mut outputs = Vec::new();
        let mut last = 0;
        for &split in splits {
            outputs.push(observer.ingest(&text[last..split]));
            last = split;
        }
        outputs.push(observer.ingest(&text[last..]));
        outputs
    }

    #[test]
    fn delta_accumulation_across_fixed_splits() {
        let payload = r#"{"response":"Hello world","thought":"plan","web_search":["q"],"changes":[{"file":"src/a.ts","original":"","edited":"x"}]}"#;
        let mut observer = StreamObserver::default();
        let outputs = ingest_all(&mut observer, payload, &[17, 43, 88]);

        let response: String = outputs
            .iter()
            .filter_map(|o| o.deltas.get("response"))
            .cloned()
            .collect();
        assert_eq!(response, "Hello world");

        let snapshot = observer.snapshot();
        assert_eq!(snapshot.fields.get("response").map(String::as_str), Some("Hello world"));
        assert_eq!(snapshot.fields.get("thought").map(String::as_str), Some("plan"));
        assert!(snapshot.seen_tool_keys.contains(&"web_search".to_string()));
        assert!(snapshot.seen_tool_keys.contains(&"changes".to_string()));
        assert_eq!(observer.file_edits(), &["src/a.ts".to_string()]);
    }

    #[test]
    fn arbitrary_split_points_match_whole_stream_ingest() {
        let payload = r#"{"response":"line one\nline \"two\"","thought":"t é ok","changes":[{"file":"a/b.rs","original":"x","edited":"y"}]}"#;

        let mut whole = StreamObserver::default();
        whole.ingest(payload);
        let expected = whole.snapshot();

        for split in 1..payload.len() {
            if !payload.is_char_boundary(split) {
                continue;
            }
            let mut observer = StreamObserver::default();
            observer.ingest(&payload[..split]);
            observer.ingest(&payload[split..]);
            assert_eq!(observer.snapshot(), expected, "split at {split}");
        }
    }

    #[test]
    fn escape_split_across_chunks_produces_no_spurious_delta() {
        let mut observer = StreamObserver::default();
        observer.ingest(r#"{"response":"a\"#);
        let out = observer.ingest(r#"nb"}"#);
        assert_eq!(out.deltas.get("response").map(String::as_str), Some("\nb"));
        assert_eq!(observer.field("response"), Some("a\nb"));
    }

    #[test]
    fn unicode_escape_split_is_held_until_complete() {
        let mut observer = StreamObserver::default();
        let first = observer.ingest(r#"{"response":"x\u00"#);
        assert_eq!(first.deltas.get("response").map(String::as_str), Some("x"));
        let second = observer.ingest(r#"e9!"}"#);
        assert_eq!(second.deltas.get("response").map(String::as_str), Some("é!"));
    }

    #[test]
    fn embedded_quote_followed_by_text_is_content() {
        let mut observer = StreamObserver::default();
        observer.ingest(r#"{"response":"he said " loudly","thought":"t"}"#);
        assert_eq!(observer.field("response"), Some("he said \" loudly"));
        assert_eq!(observer.field("thought"), Some("t"));
    }

    #[test]
    fn quote_before_next_key_terminates_the_field() {
        let mut observer = StreamObserver::default();
        observer.ingest(r#"{"response":"done","plan":"next"}"#);
        assert_eq!(observer.field("response"), Some("done"));
        assert_eq!(observer.field("plan"), Some("next"));
    }

    #[test]
    fn schema_keys_are_top_level_only() {
        let mut observer = StreamObserver::default();
        let out = observer.ingest(r#"{"response":"r","changes":[{"file":"f","original":"o","edited":"e"}],"plan":"p"}"#);
        assert_eq!(
            out.new_schema_keys,
            vec!["response".to_string(), "changes".to_string(), "plan".to_string()]
        );
    }

    #[test]
    fn tool_signals_fire_once() {
        let mut observer = StreamObserver::default();
        let first = observer.ingest(r#"{"web_search": ["a"]"#);
        assert_eq!(first.tool_signals, vec!["web_search".to_string()]);
        let second = observer.ingest(r#", "lint_project": true}"#);
        assert_eq!(second.tool_signals, vec!["lint_project".to_string()]);
        assert!(second.deltas.is_empty());
    }

    #[test]
    fn list_valued_plan_is_left_to_the_final_parse() {
        let mut observer = StreamObserver::default();
        observer.ingest(r#"{"plan":["a","b"],"response":"ok"}"#);
        assert_eq!(observer.field("plan"), None);
        assert_eq!(observer.field("response"), Some("ok"));
    }

    #[test]
    fn file_paths_are_deduplicated() {
        let mut observer = StreamObserver::default();
        let out = observer.ingest(
            r#"{"changes":[{"file":"a.rs","original":"1","edited":"2"},{"file":"a.rs","original":"3","edited":"4"},{"file":"b.rs","original":"","edited":"z"}]}"#,
        );
        assert_eq!(out.file_edits, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }

    #[test]
    fn malformed_input_never_panics() {
        let mut observer = StreamObserver::default();
        observer.ingest(r#"{{{"" \u zz "response" : : "#);
        observer.ingest("\"partial");
        let snapshot = observer.snapshot();
        assert!(snapshot.raw_tail.contains("partial"));
    }
}
