//! Tolerant JSON-block extraction for mechanical-stage LLM output.
//!
//! Try a direct parse, then a fenced ` ```json ` block, then the first
//! bracketed span, and fall back to an empty object/array rather than
//! erroring — a model that wraps its JSON in prose should not fail the
//! whole stage.

use serde_json::Value;

/// Extract a JSON object from `text`, defaulting to `{}` if none parses.
pub fn parse_json_object(text: &str) -> Value {
    extract_candidate(text, '{', '}')
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// Extract a JSON array from `text`, defaulting to `[]` if none parses.
pub fn parse_json_array(text: &str) -> Vec<Value> {
    extract_candidate(text, '[', ']')
        .and_then(|s| serde_json::from_str::<Vec<Value>>(&s).ok())
        .unwrap_or_default()
}

fn extract_candidate(text: &str, open: char, close: char) -> Option<String> {
    let trimmed = text.trim();

    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return Some(trimmed.to_string());
    }

    if let Some(fenced) = extract_fenced(trimmed) {
        if serde_json::from_str::<Value>(&fenced).is_ok() {
            return Some(fenced);
        }
    }

    let start = trimmed.find(open)?;
    let end = trimmed.rfind(close)?;
    if end > start {
        Some(trimmed[start..=end].to_string())
    } else {
        None
    }
}

fn extract_fenced(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_marker = &text[start + 3..];
    let after_marker = after_marker.strip_prefix("json").unwrap_or(after_marker);
    let after_marker = after_marker.strip_prefix('\n').unwrap_or(after_marker);
    let end = after_marker.find("```")?;
    Some(after_marker[..end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_object() {
        let v = parse_json_object(r#"{"a": 1}"#);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn parses_fenced_object() {
        let v = parse_json_object("Here you go:\n```json\n{\"a\": 2}\n```\nThanks.");
        assert_eq!(v["a"], 2);
    }

    #[test]
    fn parses_object_embedded_in_prose() {
        let v = parse_json_object("Sure, the result is {\"a\": 3} as requested.");
        assert_eq!(v["a"], 3);
    }

    #[test]
    fn falls_back_to_empty_object() {
        let v = parse_json_object("no json here");
        assert_eq!(v, serde_json::json!({}));
    }

    #[test]
    fn parses_bare_array() {
        let v = parse_json_array("[1, 2, 3]");
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn falls_back_to_empty_array() {
        let v = parse_json_array("nothing to see");
        assert!(v.is_empty());
    }
}
