//! Compaction of operation results before they go back to the model.
//!
//! Each result becomes one tool message: `OK: <payload>` or
//! `ERROR: <message>`. Binary-looking strings inside payloads are replaced
//! with a short placeholder, each result is capped at `result_chars`, and
//! a whole round at `round_chars`.

use parley_core::operation::OperationResult;

/// Strings at least this long are checked for binary content.
const BINARY_MIN_LEN: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct CompactionLimits {
    pub result_chars: usize,
    pub round_chars: usize,
}

impl Default for CompactionLimits {
    fn default() -> Self {
        Self {
            result_chars: 1500,
            round_chars: 6000,
        }
    }
}

/// One compacted result, keyed by the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactedResult {
    pub request_id: String,
    pub content: String,
}

/// Compact a round of results, in order. Every result gets an entry.
pub fn compact_round(results: &[OperationResult], limits: CompactionLimits) -> Vec<CompactedResult> {
    let mut used = 0usize;
    results
        .iter()
        .map(|result| {
            let remaining = limits.round_chars.saturating_sub(used);
            let content = if remaining == 0 {
                format!("{}: [omitted, round summary limit reached]", status(result))
            } else {
                summarize_result(result, limits.result_chars.min(remaining))
            };
            used += content.chars().count();
            CompactedResult {
                request_id: result.request_id.clone(),
                content,
            }
        })
        .collect()
}

fn status(result: &OperationResult) -> &'static str {
    if result.success { "OK" } else { "ERROR" }
}

/// Render one result as `OK: ...` / `ERROR: ...`, capped at `max_chars`
/// of body text.
pub fn summarize_result(result: &OperationResult, max_chars: usize) -> String {
    let body = if result.success {
        match &result.payload {
            Some(payload) => render_payload(payload),
            None => String::new(),
        }
    } else {
        result
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "operation failed".into())
    };
    format!("{}: {}", status(result), truncate_chars(&body, max_chars))
}

/// Payload as text with binary blobs swapped for placeholders.
pub fn render_payload(payload: &serde_json::Value) -> String {
    match strip_binary(payload) {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn strip_binary(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) if looks_binary(s) => Value::String(format!(
            "[binary data: {} bytes omitted]",
            approx_decoded_len(s)
        )),
        Value::Array(items) => Value::Array(items.iter().map(strip_binary).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), strip_binary(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Control characters, or a long unbroken base64 run.
fn looks_binary(s: &str) -> bool {
    if s.chars().any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t')) {
        return true;
    }
    let compact = s.trim_end_matches('=');
    s.len() >= BINARY_MIN_LEN
        && compact
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_'))
}

fn approx_decoded_len(s: &str) -> usize {
    if s.chars().any(char::is_control) {
        s.len()
    } else {
        s.len() / 4 * 3
    }
}

/// Keep at most `max` characters, noting how many were cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some((cut, _)) => {
            let omitted = s[cut..].chars().count();
            format!("{}... [truncated, {omitted} chars omitted]", &s[..cut])
        }
    }
}
