//! One-line outline titles for log steps.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::LogRole;

pub const DEFAULT_SUMMARY_LEN: usize = 50;

static FENCED_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[\s\S]*?```").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`]+`").unwrap());
static IMAGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap());
static LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]*\)").unwrap());
static LINE_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s{0,3}(?:#{1,6}\s+|[-*+]\s+|\d+\.\s+|>\s+)").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static FIRST_SENTENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\s\S]*?[。！？!?.](?:\s|$)").unwrap());

/// Collapses Markdown-ish text into its first sentence, truncated to `max_len` chars.
pub fn summarize_content(raw: &str, max_len: usize) -> String {
    let text = raw.trim();
    if text.is_empty() {
        return String::new();
    }

    let text = FENCED_CODE.replace_all(text, " ");
    let text = INLINE_CODE.replace_all(&text, " ");
    let text = IMAGE.replace_all(&text, " ");
    let text = LINK.replace_all(&text, "$1");
    let text = LINE_MARKERS.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let first = FIRST_SENTENCE
        .find(text)
        .map(|m| m.as_str().trim())
        .unwrap_or(text);

    if first.chars().count() <= max_len {
        return first.to_string();
    }
    let head: String = first.chars().take(max_len.saturating_sub(1)).collect();
    format!("{}…", head.trim_end())
}

/// Tool names from an opaque tool-call payload, deduplicated in first-seen order.
pub fn extract_tool_names(tool_calls: &Value) -> Vec<String> {
    fn non_empty(v: Option<&Value>) -> Option<&str> {
        v.and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    fn read_name(call: &Value) -> Option<&str> {
        non_empty(call.get("function").and_then(|f| f.get("name")))
            .or_else(|| non_empty(call.get("name")))
            .or_else(|| non_empty(call.get("toolName")))
    }

    let calls: Vec<&Value> = match tool_calls {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![tool_calls],
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter_map(read_name)
        .filter(|name| seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// `a, b +N` with at most `max_shown` names spelled out.
pub fn format_tool_names(names: &[String], max_shown: usize) -> String {
    let mut seen = HashSet::new();
    let unique: Vec<&str> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty() && seen.insert(*n))
        .collect();

    if unique.len() <= max_shown {
        return unique.join(", ");
    }
    format!(
        "{} +{}",
        unique[..max_shown].join(", "),
        unique.len() - max_shown
    )
}

pub fn build_step_summary(
    index: u64,
    role: LogRole,
    content: &str,
    tool_calls: Option<&Value>,
    tool_call_id: Option<&str>,
    max_len: usize,
) -> String {
    let prefix = format!("step#{}", index);

    let names = tool_calls.map(extract_tool_names).unwrap_or_default();
    if !names.is_empty() {
        return format!("{} • calling tools: {}", prefix, format_tool_names(&names, 2));
    }

    let is_tool_result =
        role == LogRole::ToolResult || tool_call_id.is_some_and(|id| !id.is_empty());
    let brief = summarize_content(content, max_len);
    match (is_tool_result, brief.is_empty()) {
        (_, true) => prefix,
        (true, false) => format!("{} • tool result: {}", prefix, brief),
        (false, false) => format!("{} • {}", prefix, brief),
    }
}
