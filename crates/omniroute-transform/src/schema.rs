//! Tool-declaration hygiene applied during translation.
//!
//! Upstreams disagree wildly about which JSON-Schema keywords they accept;
//! cleaning happens here so executors stay byte-level transports.

use serde_json::{Map, Value, json};

/// JSON-Schema keywords Gemini's function declarations reject.
const UNSUPPORTED_SCHEMA_CONSTRAINTS: &[&str] = &[
    "minLength",
    "maxLength",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "pattern",
    "minItems",
    "maxItems",
    "format",
    "default",
    "examples",
    "$schema",
    "$defs",
    "definitions",
    "const",
    "$ref",
    "additionalProperties",
    "propertyNames",
    "patternProperties",
    "anyOf",
    "oneOf",
    "allOf",
    "not",
    "dependencies",
    "dependentSchemas",
    "dependentRequired",
    "title",
    "if",
    "then",
    "else",
    "contentMediaType",
    "contentEncoding",
];

/// Recursively rewrite a JSON schema into the subset Gemini accepts.
/// Idempotent: cleaning a cleaned schema is a no-op.
pub fn clean_schema_for_gemini(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => clean_object(map),
        Value::Array(items) => Value::Array(items.iter().map(clean_schema_for_gemini).collect()),
        other => other.clone(),
    }
}

fn clean_object(map: &Map<String, Value>) -> Value {
    // anyOf/oneOf collapse to their first non-null branch before anything
    // else; the keywords themselves are unsupported.
    for combinator in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = map.get(combinator) {
            let picked = branches
                .iter()
                .find(|branch| !is_null_branch(branch))
                .or_else(|| branches.first());
            if let Some(branch) = picked {
                let mut merged = match clean_schema_for_gemini(branch) {
                    Value::Object(obj) => obj,
                    other => return other,
                };
                // Sibling keys (description etc.) survive the flatten.
                for (key, value) in map {
                    if key == combinator || UNSUPPORTED_SCHEMA_CONSTRAINTS.contains(&key.as_str())
                    {
                        continue;
                    }
                    merged
                        .entry(key.clone())
                        .or_insert_with(|| clean_schema_for_gemini(value));
                }
                return finalize_object(merged);
            }
        }
    }

    let mut out = Map::new();
    for (key, value) in map {
        if UNSUPPORTED_SCHEMA_CONSTRAINTS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "type" => out.insert(key.clone(), coalesce_type(value)),
            "properties" => {
                let cleaned = match value {
                    Value::Object(props) => Value::Object(
                        props
                            .iter()
                            .map(|(name, prop)| (name.clone(), clean_schema_for_gemini(prop)))
                            .collect(),
                    ),
                    other => clean_schema_for_gemini(other),
                };
                out.insert(key.clone(), cleaned)
            }
            "items" | "contains" => out.insert(key.clone(), clean_schema_for_gemini(value)),
            _ => out.insert(key.clone(), value.clone()),
        };
    }
    finalize_object(out)
}

fn finalize_object(mut map: Map<String, Value>) -> Value {
    // `required` may only name keys that survived cleaning.
    if let Some(Value::Array(required)) = map.get("required") {
        let known: Vec<Value> = match map.get("properties") {
            Some(Value::Object(props)) => required
                .iter()
                .filter(|entry| {
                    entry
                        .as_str()
                        .map(|name| props.contains_key(name))
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        if known.is_empty() {
            map.remove("required");
        } else {
            map.insert("required".to_string(), Value::Array(known));
        }
    }

    // Gemini rejects `{"type":"object"}` with no properties at all.
    let is_object_type = map.get("type").and_then(Value::as_str) == Some("object");
    let has_properties = matches!(map.get("properties"), Some(Value::Object(props)) if !props.is_empty());
    if is_object_type && !has_properties {
        map.insert(
            "properties".to_string(),
            json!({"reason": {"type": "string", "description": "Why this tool is being called"}}),
        );
    }

    Value::Object(map)
}

fn is_null_branch(branch: &Value) -> bool {
    branch.get("type").and_then(Value::as_str) == Some("null")
}

fn coalesce_type(value: &Value) -> Value {
    match value {
        Value::Array(types) => types
            .iter()
            .find(|entry| entry.as_str() != Some("null"))
            .cloned()
            .unwrap_or_else(|| Value::String("string".to_string())),
        other => other.clone(),
    }
}

// ---- Claude tool-schema modes ----

/// What a Claude-dialect target accepts in tool `input_schema`s. The plain
/// messages API keeps `default`/`examples`; Antigravity-backed endpoints
/// (and strict-mode tools) reject them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaudeSchemaMode {
    #[default]
    Api,
    Antigravity,
}

/// Rewrite a tool schema for a Claude-dialect target, honouring the mode's
/// `default`/`examples` rules. Idempotent.
pub fn clean_schema_for_claude(schema: &Value, mode: ClaudeSchemaMode) -> Value {
    match mode {
        ClaudeSchemaMode::Api => schema.clone(),
        ClaudeSchemaMode::Antigravity => strip_schema_hints(schema),
    }
}

fn strip_schema_hints(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                if matches!(key.as_str(), "default" | "examples") {
                    continue;
                }
                out.insert(key.clone(), strip_schema_hints(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_schema_hints).collect()),
        other => other.clone(),
    }
}

// ---- GitHub Copilot tool sanitation ----

const GITHUB_MAX_TOOLS: usize = 128;
const GITHUB_MAX_NAME_LEN: usize = 64;

/// Cap, truncate, validate, and deduplicate a chat-completions tool list for
/// GitHub Copilot. Idempotent.
pub fn sanitize_tools_for_github(tools: &[Value]) -> Vec<Value> {
    let mut seen = Vec::new();
    let mut out = Vec::new();
    for tool in tools {
        if out.len() == GITHUB_MAX_TOOLS {
            break;
        }
        let Some(name) = tool
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let truncated: String = name.chars().take(GITHUB_MAX_NAME_LEN).collect();
        if !valid_github_tool_name(&truncated) {
            continue;
        }
        if seen.contains(&truncated) {
            continue;
        }
        seen.push(truncated.clone());
        let mut tool = tool.clone();
        if truncated != name
            && let Some(function) = tool.get_mut("function").and_then(Value::as_object_mut)
        {
            function.insert("name".to_string(), Value::String(truncated));
        }
        out.push(tool);
    }
    out
}

fn valid_github_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_key(value: &Value, key: &str) -> bool {
        match value {
            Value::Object(map) => {
                map.contains_key(key) || map.values().any(|v| contains_key(v, key))
            }
            Value::Array(items) => items.iter().any(|v| contains_key(v, key)),
            _ => false,
        }
    }

    #[test]
    fn strips_unsupported_keywords_recursively() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 1, "pattern": "^a"},
                "tags": {"type": "array", "items": {"type": "string", "format": "uri"}, "maxItems": 5}
            },
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#"
        });
        let cleaned = clean_schema_for_gemini(&schema);
        for key in UNSUPPORTED_SCHEMA_CONSTRAINTS {
            assert!(!contains_key(&cleaned, key), "{key} should be stripped");
        }
    }

    #[test]
    fn flattens_any_of_to_first_non_null() {
        let schema = json!({
            "description": "maybe a count",
            "anyOf": [{"type": "null"}, {"type": "integer"}]
        });
        let cleaned = clean_schema_for_gemini(&schema);
        assert_eq!(cleaned["type"], "integer");
        assert_eq!(cleaned["description"], "maybe a count");
    }

    #[test]
    fn coalesces_nullable_type_arrays() {
        let cleaned = clean_schema_for_gemini(&json!({"type": ["string", "null"]}));
        assert_eq!(cleaned["type"], "string");
    }

    #[test]
    fn drops_required_without_matching_property() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "required": ["a", "gone"]
        });
        let cleaned = clean_schema_for_gemini(&schema);
        assert_eq!(cleaned["required"], json!(["a"]));
    }

    #[test]
    fn empty_object_gets_placeholder_property() {
        let cleaned = clean_schema_for_gemini(&json!({"type": "object"}));
        assert!(cleaned["properties"]["reason"].is_object());
    }

    #[test]
    fn cleaning_is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "q": {"anyOf": [{"type": "null"}, {"type": "string", "minLength": 2}]},
                "n": {"type": ["integer", "null"], "default": 3}
            },
            "required": ["q", "missing"],
            "allOf": [{"type": "object"}]
        });
        let once = clean_schema_for_gemini(&schema);
        let twice = clean_schema_for_gemini(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn claude_api_mode_keeps_schema_hints() {
        let schema = json!({
            "type": "object",
            "properties": {"n": {"type": "integer", "default": 3, "examples": [1, 2]}}
        });
        assert_eq!(
            clean_schema_for_claude(&schema, ClaudeSchemaMode::Api),
            schema
        );
    }

    #[test]
    fn claude_antigravity_mode_strips_defaults_and_examples_recursively() {
        let schema = json!({
            "type": "object",
            "default": {},
            "properties": {
                "n": {"type": "integer", "default": 3},
                "tags": {"type": "array", "items": {"type": "string", "examples": ["a"]}}
            }
        });
        let cleaned = clean_schema_for_claude(&schema, ClaudeSchemaMode::Antigravity);
        assert!(!contains_key(&cleaned, "default"));
        assert!(!contains_key(&cleaned, "examples"));
        assert!(cleaned["properties"]["n"]["type"] == "integer");
    }

    #[test]
    fn claude_cleaning_is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string", "default": "x", "examples": ["y"]}}
        });
        let once = clean_schema_for_claude(&schema, ClaudeSchemaMode::Antigravity);
        let twice = clean_schema_for_claude(&once, ClaudeSchemaMode::Antigravity);
        assert_eq!(once, twice);
    }

    fn tool(name: &str) -> Value {
        json!({"type": "function", "function": {"name": name, "parameters": {}}})
    }

    #[test]
    fn valid_tool_list_is_untouched() {
        let tools: Vec<Value> = (0..10).map(|i| tool(&format!("tool_{i}"))).collect();
        assert_eq!(sanitize_tools_for_github(&tools), tools);
    }

    #[test]
    fn caps_at_128_and_dedupes() {
        let mut tools: Vec<Value> = (0..200).map(|i| tool(&format!("t{i}"))).collect();
        tools.push(tool("t0"));
        let out = sanitize_tools_for_github(&tools);
        assert_eq!(out.len(), 128);
    }

    #[test]
    fn truncates_and_rejects_names() {
        let long_name = "a".repeat(100);
        let tools = vec![tool(&long_name), tool("9bad"), tool("ok-name.v2:x")];
        let out = sanitize_tools_for_github(&tools);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["function"]["name"].as_str().unwrap().len(), 64);
        assert_eq!(out[1]["function"]["name"], "ok-name.v2:x");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let tools: Vec<Value> = (0..150)
            .map(|i| tool(&format!("{}_{i}", "x".repeat(70))))
            .collect();
        let once = sanitize_tools_for_github(&tools);
        let twice = sanitize_tools_for_github(&once);
        assert_eq!(once, twice);
    }
}
