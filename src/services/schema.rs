//! JSON Schema sanitizer for Gemini-family providers
//!
//! Gemini's function-declaration schema accepts only a narrow JSON Schema
//! subset. This module rewrites arbitrary tool schemas into that subset
//! instead of letting the upstream reject the request.

use serde_json::{json, Map, Value};

/// Keywords Gemini rejects outright. Composition keywords are handled
/// (merged or flattened) before this list is applied.
const UNSUPPORTED_KEYWORDS: &[&str] = &[
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

/// Rewrite a tool parameter schema into the Gemini-accepted subset.
///
/// Idempotent: sanitizing an already-sanitized schema is a no-op.
pub fn sanitize_tool_schema(schema: Option<Value>) -> Option<Value> {
    schema.map(sanitize_value)
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => sanitize_object(map),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        other => other,
    }
}

// Depth-first: children are rewritten before the parent so that branch
// selection and merging operate on already-clean subschemas.
fn sanitize_object(map: Map<String, Value>) -> Value {
    let mut map: Map<String, Value> = map
        .into_iter()
        .map(|(key, value)| match key.as_str() {
            // Keep enum member values themselves untouched here; they are
            // stringified below, not recursed into as schemas.
            "enum" => (key, value),
            _ => (key, sanitize_value(value)),
        })
        .collect();

    // const → singleton enum
    if let Some(constant) = map.remove("const") {
        map.insert("enum".to_string(), Value::Array(vec![constant]));
    }

    // Gemini only accepts string enum members
    if let Some(Value::Array(members)) = map.remove("enum") {
        let stringified = members
            .into_iter()
            .map(|member| match member {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            })
            .collect();
        map.insert("enum".to_string(), Value::Array(stringified));
        map.insert("type".to_string(), json!("string"));
    }

    // allOf: merge property sets and required lists into the parent
    if let Some(Value::Array(branches)) = map.remove("allOf") {
        merge_all_of(&mut map, branches);
    }

    // anyOf / oneOf: keep the richest non-null branch
    for keyword in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = map.remove(keyword) {
            if let Some(branch) = pick_richest_branch(branches) {
                if let Value::Object(branch_map) = branch {
                    for (key, value) in branch_map {
                        map.entry(key).or_insert(value);
                    }
                }
            }
        }
    }

    // type arrays (e.g. ["string", "null"]) → first non-null entry
    if let Some(Value::Array(types)) = map.get("type").cloned() {
        let picked = types
            .iter()
            .find(|t| t.as_str() != Some("null"))
            .cloned()
            .unwrap_or(json!("string"));
        map.insert("type".to_string(), picked);
    }

    for keyword in UNSUPPORTED_KEYWORDS {
        map.remove(*keyword);
    }

    prune_required(&mut map);

    // An object schema with no properties is rejected upstream; give it a
    // single required free-text field.
    let is_empty_object = map.get("type").and_then(Value::as_str) == Some("object")
        && map
            .get("properties")
            .and_then(Value::as_object)
            .map(Map::is_empty)
            .unwrap_or(true);
    if is_empty_object {
        map.insert(
            "properties".to_string(),
            json!({"reason": {"type": "string", "description": "Why this tool is being called"}}),
        );
        map.insert("required".to_string(), json!(["reason"]));
    }

    Value::Object(map)
}

fn merge_all_of(map: &mut Map<String, Value>, branches: Vec<Value>) {
    let mut properties = map
        .remove("properties")
        .and_then(|p| match p {
            Value::Object(m) => Some(m),
            _ => None,
        })
        .unwrap_or_default();
    let mut required: Vec<Value> = map
        .remove("required")
        .and_then(|r| match r {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default();

    for branch in branches {
        let Value::Object(branch_map) = branch else { continue };
        if let Some(Value::Object(branch_props)) = branch_map.get("properties") {
            for (name, schema) in branch_props {
                properties.entry(name.clone()).or_insert_with(|| schema.clone());
            }
        }
        if let Some(Value::Array(branch_required)) = branch_map.get("required") {
            for name in branch_required {
                if !required.contains(name) {
                    required.push(name.clone());
                }
            }
        }
    }

    if !properties.is_empty() {
        map.insert("properties".to_string(), Value::Object(properties));
        map.entry("type".to_string()).or_insert(json!("object"));
    }
    if !required.is_empty() {
        map.insert("required".to_string(), Value::Array(required));
    }
}

// object > array > scalar; null branches lose to everything else
fn pick_richest_branch(branches: Vec<Value>) -> Option<Value> {
    fn rank(branch: &Value) -> u8 {
        let branch_type = branch.get("type").and_then(Value::as_str);
        match branch_type {
            Some("null") => 0,
            Some("object") => 3,
            Some("array") => 2,
            Some(_) => 1,
            None => {
                if branch.get("properties").is_some() {
                    3
                } else {
                    1
                }
            }
        }
    }
    branches.into_iter().max_by_key(rank)
}

fn prune_required(map: &mut Map<String, Value>) {
    let property_names: Vec<String> = map
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default();

    if let Some(Value::Array(required)) = map.get_mut("required") {
        required.retain(|name| {
            name.as_str()
                .map(|n| property_names.iter().any(|p| p == n))
                .unwrap_or(false)
        });
        if required.is_empty() {
            map.remove("required");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_becomes_string_enum() {
        let schema = json!({"const": 5});
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["enum"], json!(["5"]));
        assert_eq!(sanitized["type"], json!("string"));
    }

    #[test]
    fn test_any_of_picks_non_null_branch() {
        let schema = json!({
            "anyOf": [{"type": "string"}, {"type": "null"}]
        });
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["type"], json!("string"));
        assert!(sanitized.get("anyOf").is_none());
    }

    #[test]
    fn test_any_of_prefers_object_over_scalar() {
        let schema = json!({
            "anyOf": [
                {"type": "string"},
                {"type": "object", "properties": {"a": {"type": "number"}}}
            ]
        });
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["type"], json!("object"));
        assert!(sanitized["properties"]["a"].is_object());
    }

    #[test]
    fn test_all_of_merges_properties_and_required() {
        let schema = json!({
            "type": "object",
            "allOf": [
                {"properties": {"a": {"type": "string"}}, "required": ["a"]},
                {"properties": {"b": {"type": "number"}}, "required": ["b"]}
            ]
        });
        let sanitized = sanitize_value(schema);
        assert!(sanitized["properties"]["a"].is_object());
        assert!(sanitized["properties"]["b"].is_object());
        let required = sanitized["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")));
        assert!(required.contains(&json!("b")));
    }

    #[test]
    fn test_unsupported_keywords_dropped() {
        let schema = json!({
            "type": "string",
            "minLength": 1,
            "maxLength": 10,
            "pattern": "^a",
            "format": "uri",
            "title": "Name",
            "default": "x"
        });
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized, json!({"type": "string"}));
    }

    #[test]
    fn test_type_array_flattened() {
        let schema = json!({"type": ["null", "integer"]});
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["type"], json!("integer"));
    }

    #[test]
    fn test_required_pruned_to_existing_properties() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "required": ["a", "ghost"]
        });
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["required"], json!(["a"]));
    }

    #[test]
    fn test_empty_object_gets_reason_property() {
        let schema = json!({"type": "object"});
        let sanitized = sanitize_value(schema);
        assert_eq!(sanitized["required"], json!(["reason"]));
        assert_eq!(sanitized["properties"]["reason"]["type"], json!("string"));
    }

    #[test]
    fn test_nested_schemas_sanitized_depth_first() {
        let schema = json!({
            "type": "object",
            "properties": {
                "outer": {
                    "type": "object",
                    "properties": {
                        "inner": {"anyOf": [{"type": "null"}, {"type": "boolean"}]}
                    }
                }
            }
        });
        let sanitized = sanitize_value(schema);
        assert_eq!(
            sanitized["properties"]["outer"]["properties"]["inner"]["type"],
            json!("boolean")
        );
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"const": "fast"},
                "value": {"anyOf": [{"type": "string"}, {"type": "null"}]},
                "empty": {"type": "object"}
            },
            "required": ["mode", "missing"],
            "allOf": [{"properties": {"extra": {"type": "number", "format": "int32"}}}]
        });
        let once = sanitize_value(schema);
        let twice = sanitize_value(once.clone());
        assert_eq!(once, twice);
    }
}
