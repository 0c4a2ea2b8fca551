//! JSON repair — best-effort parsing of messy LLM output.
//!
//! Handles markdown fences, prose around the payload, trailing commas,
//! and unclosed brackets. Gives up to `None` rather than guessing; the
//! pipeline treats that as a discarded stage.

use serde_json::Value;

/// Attempt to parse and repair common LLM JSON output issues.
pub fn repair_llm_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let text = strip_code_fences(trimmed);

    // Extract only the first complete JSON payload, dropping any prose.
    let candidate = extract_first_json_block(text).or_else(|| extract_first_json_block(trimmed))?;

    let cleaned = strip_trailing_commas(candidate);
    if let Ok(value) = serde_json::from_str(&cleaned) {
        return Some(value);
    }

    // Best effort: close unclosed brackets, then retry once.
    let open_square = cleaned.matches('[').count().saturating_sub(cleaned.matches(']').count());
    let open_curly = cleaned.matches('{').count().saturating_sub(cleaned.matches('}').count());
    let mut repaired = cleaned;
    repaired.push_str(&"]".repeat(open_square));
    repaired.push_str(&"}".repeat(open_curly));
    let repaired = strip_trailing_commas(repaired);

    serde_json::from_str(&repaired).ok()
}

/// If a fenced block exists, prefer its content.
fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else { return text };
    let after_fence = &text[open + 3..];
    // Skip an optional language tag up to the first newline
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Extract the first syntactically complete JSON object or array,
/// respecting strings and escape sequences.
fn extract_first_json_block(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{' || b == b'[')?;
    let opener = bytes[start];
    let closer = if opener == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == opener => depth += 1,
            _ if b == closer => {
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

/// Remove commas that directly precede a closing bracket or brace,
/// outside of strings.
fn strip_trailing_commas(text: impl Into<String>) -> String {
    let text = text.into();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;

    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                // Drop a dangling comma (and the whitespace after it)
                while out.ends_with(|c: char| c.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_json_passes_through() {
        let value = repair_llm_json(r#"{"entities": [], "relations": []}"#).unwrap();
        assert_eq!(value, json!({"entities": [], "relations": []}));
    }

    #[test]
    fn test_markdown_fence_with_language_tag() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nHope that helps!";
        assert_eq!(repair_llm_json(raw).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_bare_fence() {
        let raw = "```\n[1, 2, 3]\n```";
        assert_eq!(repair_llm_json(raw).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_preamble_and_trailing_prose() {
        let raw = "Sure! The extraction is {\"a\": [1]} — let me know if you need more.";
        assert_eq!(repair_llm_json(raw).unwrap(), json!({"a": [1]}));
    }

    #[test]
    fn test_trailing_commas_removed() {
        let raw = r#"{"entities": [{"name": "Lena",},], "relations": [],}"#;
        let value = repair_llm_json(raw).unwrap();
        assert_eq!(value["entities"][0]["name"], "Lena");
    }

    #[test]
    fn test_unclosed_brackets_closed() {
        let raw = r#"{"entities": [{"name": "Lena"}"#;
        let value = repair_llm_json(raw).unwrap();
        assert_eq!(value["entities"][0]["name"], "Lena");
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let raw = r#"{"text": "curly {braces} and \"quotes\" inside"}"#;
        let value = repair_llm_json(raw).unwrap();
        assert_eq!(value["text"], "curly {braces} and \"quotes\" inside");
    }

    #[test]
    fn test_first_of_multiple_blocks_wins() {
        let raw = r#"{"first": true} and also {"second": true}"#;
        assert_eq!(repair_llm_json(raw).unwrap(), json!({"first": true}));
    }

    #[test]
    fn test_hopeless_input_gives_none() {
        assert!(repair_llm_json("").is_none());
        assert!(repair_llm_json("I could not extract anything.").is_none());
        assert!(repair_llm_json("   ").is_none());
    }

    #[test]
    fn test_array_payload() {
        let raw = "Result: [\"a\", \"b\"]";
        assert_eq!(repair_llm_json(raw).unwrap(), json!(["a", "b"]));
    }
}
