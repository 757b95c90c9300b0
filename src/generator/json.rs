//! JSON recovery from model text.
//!
//! Strategy:
//! 1. Strip markdown code fences.
//! 2. Take the greedy `{ ... }` span (first `{` to last `}`) and parse it.
//! 3. If that fails, walk from the first `{` counting braces (string-aware)
//!    to its matching `}` and parse that.
//! 4. No braces at all is `NoJsonFound`; unparsable spans are `JsonParse`.

use crate::graph::{Edge, GraphDelta, Node};
use crate::{excerpt, MindmapError, Result};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};

const EXCERPT_CHARS: usize = 200;

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)```(?:json)?").expect("valid fence regex"))
}

fn greedy_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid object regex"))
}

/// Remove ```json / ``` fences, keeping what is between them.
pub fn strip_code_fences(text: &str) -> String {
    fence_regex().replace_all(text, "").trim().to_string()
}

/// The first `{` and its matching `}`, ignoring braces inside strings.
pub fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
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
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return Some(&text[start..end]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Recover a JSON object from free-form model output.
pub fn extract_json_object(text: &str) -> Result<Value> {
    let cleaned = strip_code_fences(text);

    let Some(greedy) = greedy_object_regex().find(&cleaned).map(|m| m.as_str()) else {
        return Err(MindmapError::NoJsonFound {
            excerpt: excerpt(&cleaned, EXCERPT_CHARS),
        });
    };

    let first_error = match serde_json::from_str::<Value>(greedy) {
        Ok(value) => return ensure_object(value, greedy),
        Err(e) => e,
    };

    debug!("Greedy JSON span failed to parse ({}), trying balanced scan", first_error);
    if let Some(balanced) = balanced_object(&cleaned) {
        if balanced != greedy {
            if let Ok(value) = serde_json::from_str::<Value>(balanced) {
                return ensure_object(value, balanced);
            }
        }
    }

    Err(MindmapError::JsonParse {
        excerpt: excerpt(greedy, EXCERPT_CHARS),
        message: first_error.to_string(),
    })
}

fn ensure_object(value: Value, source: &str) -> Result<Value> {
    if value.is_object() {
        Ok(value)
    } else {
        Err(MindmapError::JsonParse {
            excerpt: excerpt(source, EXCERPT_CHARS),
            message: "expected a JSON object".to_string(),
        })
    }
}

/// Read `nodes`/`edges` out of a payload object.
///
/// Missing arrays become empty; individual entries that do not fit the node
/// or edge shape are skipped so a partly broken answer still renders.
pub fn payload_to_delta(payload: &Value) -> GraphDelta {
    let nodes = entries(payload, "nodes")
        .filter_map(|raw| match serde_json::from_value::<Node>(raw.clone()) {
            Ok(node) => Some(node),
            Err(e) => {
                warn!("Skipping malformed node {}: {}", raw, e);
                None
            }
        })
        .collect();

    let edges = entries(payload, "edges")
        .filter_map(|raw| match serde_json::from_value::<Edge>(raw.clone()) {
            Ok(edge) => Some(edge),
            Err(e) => {
                warn!("Skipping malformed edge {}: {}", raw, e);
                None
            }
        })
        .collect();

    GraphDelta { nodes, edges }
}

fn entries<'a>(payload: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    payload
        .get(key)
        .and_then(|v| v.as_array())
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```JSON\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{}"), "{}");
    }

    #[test]
    fn test_extract_with_surrounding_prose() {
        let value = extract_json_object("Here you go:\n{\"nodes\":[],\"edges\":[]}\nHope that helps").unwrap();
        assert_eq!(value, json!({"nodes": [], "edges": []}));
    }

    #[test]
    fn test_balanced_fallback_when_greedy_overreaches() {
        let text = "{\"nodes\":[]} and also {\"other\": true}";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value, json!({"nodes": []}));
    }

    #[test]
    fn test_balanced_scan_ignores_braces_in_strings() {
        let text = r#"x {"label":"a } b","n":{"m":1}} trailing }"#;
        assert_eq!(balanced_object(text), Some(r#"{"label":"a } b","n":{"m":1}}"#));
        assert_eq!(balanced_object("{ unterminated"), None);
    }

    #[test]
    fn test_no_json_vs_parse_error() {
        let err = extract_json_object("I cannot help with that.").unwrap_err();
        match err {
            MindmapError::NoJsonFound { excerpt } => assert!(excerpt.contains("cannot help")),
            other => panic!("expected NoJsonFound, got {:?}", other),
        }

        let err = extract_json_object("{\"nodes\": [oops]}").unwrap_err();
        match err {
            MindmapError::JsonParse { excerpt, message } => {
                assert!(excerpt.contains("oops"));
                assert!(!message.is_empty());
            }
            other => panic!("expected JsonParse, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_defaults_and_skips_bad_entries() {
        let delta = payload_to_delta(&json!({"title": "x"}));
        assert!(delta.nodes.is_empty());
        assert!(delta.edges.is_empty());

        let delta = payload_to_delta(&json!({
            "nodes": [{"id": "topic-1", "label": "Budget"}, {"id": "broken"}, 42],
            "edges": [{"from": "topic-1", "to": "x"}, {"to": "x"}]
        }));
        assert_eq!(delta.nodes.len(), 1);
        assert_eq!(delta.edges.len(), 1);
        assert_eq!(delta.edges[0].edge_type, "hierarchical");
    }
}
