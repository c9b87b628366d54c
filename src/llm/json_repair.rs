//! Bounded JSON repair for model output.
//!
//! Models occasionally wrap JSON in prose or code fences, or get truncated
//! mid-document. The repair pass is deliberately bounded: strip wrappers,
//! close unbalanced strings/braces/arrays, and as a last resort salvage the
//! longest valid prefix. It never invents content.

use serde_json::Value;

use crate::FabulaError;

/// Decode `raw` as a JSON value, repairing if a direct parse fails.
pub fn extract_json(raw: &str) -> Result<Value, FabulaError> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let core = strip_wrappers(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(core) {
        return Ok(value);
    }

    if let Some(value) = close_unbalanced(core) {
        return Ok(value);
    }

    if let Some(value) = salvage_prefix(core) {
        return Ok(value);
    }

    Err(FabulaError::JsonParse(format!(
        "unrepairable model output ({} chars)",
        raw.chars().count()
    )))
}

/// Drop code fences and any prose before the first `{` / after the last `}`.
fn strip_wrappers(s: &str) -> &str {
    let s = s.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    let s = s.strip_suffix("```").unwrap_or(s).trim();

    let start = s.find('{');
    let end = s.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if end > start => &s[start..=end],
        (Some(start), _) => &s[start..],
        _ => s,
    }
}

/// Scan with a bracket stack and append whatever closers are missing.
fn close_unbalanced(s: &str) -> Option<Value> {
    let (mut stack, in_string) = scan(s);
    let mut candidate = s.to_string();
    // Trim a dangling comma or colon before closing.
    while candidate
        .trim_end()
        .ends_with(|c| c == ',' || c == ':')
    {
        let trimmed_len = candidate.trim_end().len();
        candidate.truncate(trimmed_len.saturating_sub(1));
    }
    if in_string {
        candidate.push('"');
    }
    while let Some(open) = stack.pop() {
        candidate.push(if open == '{' { '}' } else { ']' });
    }
    serde_json::from_str(&candidate).ok()
}

/// Cut back to the last comma at depth 1, close, and retry; at most 50 cuts.
fn salvage_prefix(s: &str) -> Option<Value> {
    let boundaries = member_boundaries(s);
    for &cut in boundaries.iter().rev().take(50) {
        let prefix = &s[..cut];
        if let Some(value) = close_unbalanced(prefix) {
            return Some(value);
        }
    }
    None
}

/// Byte offsets of commas at nesting depth 1 (top-level member separators).
fn member_boundaries(s: &str) -> Vec<usize> {
    let mut boundaries = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth -= 1,
            ',' if !in_string && depth == 1 => boundaries.push(idx),
            _ => {}
        }
    }
    boundaries
}

/// Returns the stack of unclosed openers and whether the scan ended inside a
/// string literal.
fn scan(s: &str) -> (Vec<char>, bool) {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(c),
            '}' if !in_string => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    (stack, in_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_json_passes_through() {
        let value = extract_json(r#"{"a": 1}"#).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_strips_code_fence_and_prose() {
        let raw = "好的，以下是提取结果：\n```json\n{\"characters\": []}\n```";
        let value = extract_json(raw).unwrap();
        assert!(value["characters"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_closes_truncated_document() {
        let raw = r#"{"characters": [{"name": "韩立", "new_aliases": ["韩"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["characters"][0]["name"], "韩立");
    }

    #[test]
    fn test_trailing_comma_trimmed() {
        let raw = r#"{"locations": [{"name": "七玄门"},"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["locations"][0]["name"], "七玄门");
    }

    #[test]
    fn test_salvages_longest_prefix() {
        // The tail member is hopeless garbage; the salvage pass cuts back to
        // the previous top-level member.
        let raw = r#"{"a": [1, 2], "b": {"c": 3}, "d": }}}"{{"#;
        let value = extract_json(raw).unwrap();
        assert_eq!(value["b"]["c"], 3);
    }

    #[test]
    fn test_hopeless_input_errors() {
        assert!(extract_json("完全不是 JSON 的内容").is_err());
    }
}
