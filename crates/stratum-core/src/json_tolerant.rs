//! Tolerant JSON parsing shared by short-term decision parsing and
//! long-term graph-edit program parsing.
//!
//! LLM output is rarely clean JSON: it may be wrapped in a code fence, use
//! trailing commas, include a `//` comment, or otherwise almost-but-not-quite
//! parse. This module implements the repair pipeline from `spec.md` §4.2:
//! strip fences, try a strict parse, then fall back to a bracket-balanced
//! extraction plus comment/trailing-comma cleanup.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^\s*```[a-zA-Z0-9_-]*\s*\n?(.*?)\n?```\s*$").unwrap());
static LINE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"//[^\n]*").unwrap());
static BLOCK_COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static TRAILING_COMMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",(\s*[}\]])").unwrap());

/// Strip a surrounding ```lang fence if present, otherwise return unchanged.
pub fn strip_code_fence(text: &str) -> String {
    if let Some(caps) = FENCE_RE.captures(text.trim()) {
        caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default()
    } else {
        text.trim().to_string()
    }
}

/// Find the first balanced `{...}` or `[...]` span in `text`, respecting
/// string literals so brackets inside quoted strings don't confuse the
/// balance count.
fn extract_balanced_span(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove `//` and `/* */` comments and trailing commas before `}`/`]`.
fn clean_up(text: &str) -> String {
    let no_block = BLOCK_COMMENT_RE.replace_all(text, "");
    let no_line = LINE_COMMENT_RE.replace_all(&no_block, "");
    TRAILING_COMMA_RE.replace_all(&no_line, "$1").into_owned()
}

/// Parse `raw` as JSON, tolerating code fences, comments, trailing commas,
/// and leading/trailing prose around the JSON payload. Returns `None` if no
/// repair pass produces valid JSON.
pub fn parse_tolerant(raw: &str) -> Option<Value> {
    let unfenced = strip_code_fence(raw);

    if let Ok(v) = serde_json::from_str::<Value>(&unfenced) {
        return Some(v);
    }

    let span = extract_balanced_span(&unfenced)?;
    if let Ok(v) = serde_json::from_str::<Value>(span) {
        return Some(v);
    }

    let repaired = clean_up(span);
    serde_json::from_str::<Value>(&repaired).ok()
}

/// Normalize an `op` string per `spec.md` §4.2 step 4: lowercase, `-` → `_`.
pub fn normalize_op(op: &str) -> String {
    op.trim().to_lowercase().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fence_with_language() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\": 1}");
    }

    #[test]
    fn strips_fence_without_language() {
        let raw = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(raw), "{\"a\": 1}");
    }

    #[test]
    fn parses_strict_json_directly() {
        let v = parse_tolerant(r#"{"op":"create_new"}"#).unwrap();
        assert_eq!(v["op"], "create_new");
    }

    #[test]
    fn repairs_trailing_comma_and_comments() {
        let raw = r#"{
            "op": "create_new", // decided to make a fresh row
            "reasoning": "new subject",
        }"#;
        let v = parse_tolerant(raw).unwrap();
        assert_eq!(v["op"], "create_new");
    }

    #[test]
    fn extracts_json_from_surrounding_prose() {
        let raw = "op: create-new\n{\"subject\":\"alice\",\"memory_type\":\"fact\"}";
        let v = parse_tolerant(raw).unwrap();
        assert_eq!(v["subject"], "alice");
    }

    #[test]
    fn normalizes_op_casing_and_dashes() {
        assert_eq!(normalize_op("CREATE-NEW"), "create_new");
        assert_eq!(normalize_op("  Merge "), "merge");
    }

    #[test]
    fn returns_none_on_garbage() {
        assert!(parse_tolerant("not json at all").is_none());
    }

    #[test]
    fn balanced_span_ignores_braces_inside_strings() {
        let raw = r#"prefix {"text": "a } b", "op": "merge"} suffix"#;
        let v = parse_tolerant(raw).unwrap();
        assert_eq!(v["op"], "merge");
    }
}
