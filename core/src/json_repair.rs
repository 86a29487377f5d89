//! Lenient JSON extraction and repair for model output.
//!
//! Strict parsing is always attempted first; the repair steps run in
//! sequence only as fallbacks, re-trying a strict parse after each stage:
//! fence stripping, smart-quote/BOM normalization, comment and
//! trailing-comma removal, bare-key quoting, balanced-span extraction,
//! single-quote conversion and closer balancing.

use regex_lite::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static BARE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    // `{foo:` / `, foo:` -> quoted key. The pattern is hardcoded.
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap();
    re
});

static SINGLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    let re = Regex::new(r#"'([^'\\]*)'"#).unwrap();
    re
});

/// Parse `text` as JSON, repairing it step by step when strict parsing
/// fails. Returns `None` only when no stage produces a parseable document.
pub fn parse_lenient(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let mut work = strip_fences(trimmed);
    work = normalize_quotes(&strip_bom(&work));
    if let Ok(value) = serde_json::from_str(&work) {
        return Some(value);
    }

    work = strip_comments(&work);
    work = strip_trailing_commas(&work);
    if let Ok(value) = serde_json::from_str(&work) {
        return Some(value);
    }

    work = BARE_KEY.replace_all(&work, "${1}\"${2}\":").into_owned();
    if let Ok(value) = serde_json::from_str(&work) {
        return Some(value);
    }

    if !work.starts_with('{') && !work.starts_with('[') {
        if let Some(span) = first_balanced_span(&work) {
            if let Ok(value) = serde_json::from_str(span) {
                return Some(value);
            }
            work = span.to_string();
        }
    }

    let converted = SINGLE_QUOTED.replace_all(&work, "\"${1}\"").into_owned();
    if let Ok(value) = serde_json::from_str(&converted) {
        return Some(value);
    }

    let balanced = balance_closers(&converted);
    serde_json::from_str(&balanced).ok()
}

/// Find the first `{…}` or `[…]` span that parses on its own, respecting
/// strings and escapes. Useful when the model prefaces JSON with prose.
pub fn first_balanced_span(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(start) = bytes[search_from..]
        .iter()
        .position(|b| *b == b'{' || *b == b'[')
        .map(|offset| search_from + offset)
    {
        if let Some(end) = balanced_end(bytes, start) {
            let span = &text[start..end];
            if serde_json::from_str::<Value>(span).is_ok() {
                return Some(span);
            }
        }
        search_from = start + 1;
    }
    None
}

/// Byte offset one past the close of the bracket opened at `start`, or
/// `None` when the input ends first.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if *byte == b'\\' {
                escaped = true;
            } else if *byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fences(text: &str) -> String {
    let mut out = Vec::new();
    for line in text.lines() {
        let lead = line.trim_start();
        if lead.starts_with("```") {
            continue;
        }
        out.push(line);
    }
    out.join("\n").trim().to_string()
}

fn strip_bom(text: &str) -> String {
    text.trim_start_matches('\u{feff}').to_string()
}

fn normalize_quotes(text: &str) -> String {
    text.replace(['\u{201c}', '\u{201d}', '\u{201e}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

/// Remove `//` line comments and `/* */` block comments outside strings.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    let mut escaped = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Remove commas directly preceding a `}` or `]`.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Append the closers a truncated document is missing, inferred from the
/// bracket stack outside strings.
fn balance_closers(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn strict_json_passes_through() {
        let value = parse_lenient(r#"{"response":"ok"}"#).expect("parse");
        assert_eq!(value, json!({"response": "ok"}));
    }

    #[test]
    fn fenced_json_with_prose_is_extracted() {
        let text = "Some preface text\n```json\n{\"response\":\"ok\",\"plan\":[\"a\",\"b\"]}\n```\nsuffix";
        let value = parse_lenient(text).expect("parse");
        assert_eq!(value, json!({"response": "ok", "plan": ["a", "b"]}));
    }

    #[test]
    fn comments_and_trailing_commas_are_repaired() {
        let text = "{\n  // a comment\n  \"a\": 1, /* block */\n  \"b\": [1, 2,],\n}";
        let value = parse_lenient(text).expect("parse");
        assert_eq!(value, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn bare_keys_are_quoted() {
        let value = parse_lenient(r#"{foo: "bar", baz: 2}"#).expect("parse");
        assert_eq!(value, json!({"foo": "bar", "baz": 2}));
    }

    #[test]
    fn smart_quotes_are_normalized() {
        let value = parse_lenient("{\u{201c}a\u{201d}: \u{201c}b\u{201d}}").expect("parse");
        assert_eq!(value, json!({"a": "b"}));
    }

    #[test]
    fn missing_closers_are_balanced() {
        let value = parse_lenient(r#"{"a": {"b": [1, 2"#).expect("parse");
        assert_eq!(value, json!({"a": {"b": [1, 2]}}));
    }

    #[test]
    fn balanced_span_skips_non_json_brackets() {
        let text = "look at {this} first {\"real\": true} later";
        assert_eq!(first_balanced_span(text), Some("{\"real\": true}"));
    }

    #[test]
    fn unsalvageable_text_returns_none() {
        assert_eq!(parse_lenient("no json here at all"), None);
        assert_eq!(parse_lenient(""), None);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"prefix {"a": "has } inside"} tail"#;
        let value = parse_lenient(text).expect("parse");
        assert_eq!(value, json!({"a": "has } inside"}));
    }
}
