//! Named-placeholder prompt template expansion.
//!
//! A placeholder with no supplied value simply expands to the empty string
//! rather than panicking or requiring every template field to be mapped, so
//! callers pass exactly the keys they have and get deterministic output
//! either way.

use std::collections::HashMap;

/// Replace every `{name}` placeholder in `template` with the matching entry
/// from `values`, or the empty string when `name` is absent. `{{` and `}}`
/// are not treated as escapes — templates in this crate never need a
/// literal brace.
pub fn expand(template: &str, values: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let key = &template[i + 1..i + 1 + end];
                let replacement = values.get(key).copied().unwrap_or("");
                out.push_str(replacement);
                i = i + 1 + end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    let _ = &mut chars;
    out
}

/// Convenience wrapper for the common one- or two-key case.
pub fn expand_owned(template: &str, values: &[(&str, &str)]) -> String {
    let map: HashMap<&str, &str> = values.iter().copied().collect();
    expand(template, &map)
}

/// Every `{name}` found in `template`, in first-seen order, deduplicated.
/// Used by the mechanical and synthesis stages to discover which
/// placeholders a caller-supplied template expects.
pub fn placeholder_names(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let key = template[i + 1..i + 1 + end].to_string();
                if !names.contains(&key) {
                    names.push(key);
                }
                i = i + 1 + end + 1;
                continue;
            }
        }
        i += 1;
    }
    names
}

/// Expand `template`, mapping every discovered placeholder to the same
/// `value` — the mechanical stage's "one blob of combined input, whatever
/// the template calls it" behavior.
pub fn expand_uniform(template: &str, value: &str) -> String {
    let names = placeholder_names(template);
    let map: HashMap<&str, &str> = names.iter().map(|n| (n.as_str(), value)).collect();
    expand(template, &map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_keys() {
        let mut values = HashMap::new();
        values.insert("question", "what next?");
        let out = expand("Q: {question}", &values);
        assert_eq!(out, "Q: what next?");
    }

    #[test]
    fn missing_key_becomes_empty_string() {
        let values = HashMap::new();
        let out = expand("before {missing} after", &values);
        assert_eq!(out, "before  after");
    }

    #[test]
    fn repeated_placeholder_expands_every_occurrence() {
        let mut values = HashMap::new();
        values.insert("x", "Z");
        let out = expand("{x}-{x}", &values);
        assert_eq!(out, "Z-Z");
    }

    #[test]
    fn unterminated_brace_is_passed_through_literally() {
        let values = HashMap::new();
        let out = expand("a {unterminated", &values);
        assert_eq!(out, "a {unterminated");
    }

    #[test]
    fn placeholder_names_are_deduplicated_in_order() {
        let names = placeholder_names("{b} and {a} and {b} again");
        assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn expand_uniform_maps_every_placeholder_to_one_value() {
        let out = expand_uniform("{summary} / {notes}", "blob");
        assert_eq!(out, "blob / blob");
    }
}
