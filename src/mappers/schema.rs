// Normalizes arbitrary JSON-Schema tool declarations into the restricted
// dialect the Responses wire accepts. The pass is idempotent: running it on
// its own output changes nothing.

use serde_json::{json, Map, Value};

const STRIP_KEYS: &[&str] = &[
    "additionalProperties",
    "default",
    "$schema",
    "$defs",
    "definitions",
    "$id",
    "$comment",
    "minLength",
    "maxLength",
    "minItems",
    "maxItems",
    "pattern",
    "format",
    "examples",
    "const",
];

fn placeholder_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "reason": { "type": "string" } },
        "required": ["reason"]
    })
}

fn ref_replacement(reference: &str) -> Value {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    json!({ "type": "object", "description": format!("See: {}", name) })
}

// Branch preference for anyOf/oneOf flattening: structured branches first.
fn branch_rank(branch: &Value) -> u8 {
    if branch.get("properties").is_some() {
        3
    } else if branch.get("items").is_some() {
        2
    } else if branch.get("type").is_some() {
        1
    } else {
        0
    }
}

fn merge_object_into(target: &mut Map<String, Value>, source: &Value) {
    if let Value::Object(entries) = source {
        for (key, value) in entries {
            match (target.get_mut(key), value) {
                // Union of properties, union of required.
                (Some(Value::Object(existing)), Value::Object(incoming))
                    if key == "properties" =>
                {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                (Some(Value::Array(existing)), Value::Array(incoming)) if key == "required" => {
                    for item in incoming {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

pub fn sanitize_schema(schema: &Value) -> Value {
    let Value::Object(source) = schema else {
        return schema.clone();
    };

    if let Some(reference) = source.get("$ref").and_then(|v| v.as_str()) {
        return ref_replacement(reference);
    }

    let mut map = source.clone();

    // allOf: fold every branch into the parent.
    if let Some(Value::Array(branches)) = map.remove("allOf") {
        for branch in &branches {
            let cleaned = sanitize_schema(branch);
            merge_object_into(&mut map, &cleaned);
        }
    }

    // anyOf/oneOf: keep the single most structured branch.
    for keyword in ["anyOf", "oneOf"] {
        if let Some(Value::Array(branches)) = map.remove(keyword) {
            if let Some(best) = branches.iter().max_by_key(|b| branch_rank(b)) {
                let cleaned = sanitize_schema(best);
                merge_object_into(&mut map, &cleaned);
            }
        }
    }

    // Nullable unions collapse to the first non-null member.
    if let Some(Value::Array(types)) = map.get("type").cloned() {
        let chosen = types
            .iter()
            .find(|t| t.as_str() != Some("null"))
            .cloned()
            .unwrap_or(Value::String("string".to_string()));
        map.insert("type".to_string(), chosen);
    }

    for key in STRIP_KEYS {
        map.remove(*key);
    }

    if let Some(properties) = map.get_mut("properties") {
        if let Value::Object(entries) = properties {
            let cleaned: Vec<(String, Value)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect();
            entries.clear();
            for (k, v) in cleaned {
                entries.insert(k, v);
            }
        }
    }

    if let Some(items) = map.get("items").cloned() {
        let cleaned = match &items {
            Value::Array(entries) => Value::Array(entries.iter().map(sanitize_schema).collect()),
            other => sanitize_schema(other),
        };
        map.insert("items".to_string(), cleaned);
    }

    // required must only name declared properties.
    let declared: Vec<String> = map
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|p| p.keys().cloned().collect())
        .unwrap_or_default();
    if let Some(Value::Array(required)) = map.get("required").cloned() {
        let kept: Vec<Value> = required
            .into_iter()
            .filter(|r| {
                r.as_str()
                    .map(|name| declared.iter().any(|d| d == name))
                    .unwrap_or(false)
            })
            .collect();
        if kept.is_empty() {
            map.remove("required");
        } else {
            map.insert("required".to_string(), Value::Array(kept));
        }
    }

    if map.is_empty() {
        return placeholder_schema();
    }

    Value::Object(map)
}

// Top-level function parameters must be an object schema.
pub fn sanitize_function_parameters(schema: &Value) -> Value {
    let cleaned = sanitize_schema(schema);
    let declared_type = cleaned.get("type").and_then(|t| t.as_str());
    match declared_type {
        Some("object") => cleaned,
        None if cleaned.get("properties").is_some() => {
            let mut map = cleaned.as_object().cloned().unwrap_or_default();
            map.insert("type".to_string(), Value::String("object".to_string()));
            Value::Object(map)
        }
        _ => json!({
            "type": "object",
            "properties": { "input": cleaned },
            "required": ["input"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_key_recursive(value: &Value, key: &str) -> bool {
        match value {
            Value::Object(map) => {
                map.contains_key(key) || map.values().any(|v| contains_key_recursive(v, key))
            }
            Value::Array(items) => items.iter().any(|v| contains_key_recursive(v, key)),
            _ => false,
        }
    }

    fn gnarly_schema() -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "path": { "type": ["string", "null"], "minLength": 1, "pattern": ".*" },
                "count": { "type": "integer", "default": 1, "examples": [1, 2] },
                "target": { "$ref": "#/$defs/Target" },
                "mode": { "anyOf": [
                    { "type": "object", "properties": { "fast": { "type": "boolean" } } },
                    { "type": "string" }
                ]}
            },
            "required": ["path", "ghost"],
            "$defs": { "Target": { "type": "object" } }
        })
    }

    #[test]
    fn disallowed_keywords_are_removed() {
        let cleaned = sanitize_schema(&gnarly_schema());
        for key in STRIP_KEYS {
            assert!(
                !contains_key_recursive(&cleaned, key),
                "{} should be stripped",
                key
            );
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_schema(&gnarly_schema());
        let twice = sanitize_schema(&once);
        assert_eq!(once, twice);

        let params_once = sanitize_function_parameters(&json!({"type": "string"}));
        let params_twice = sanitize_function_parameters(&params_once);
        assert_eq!(params_once, params_twice);
    }

    #[test]
    fn nullable_type_collapses_to_first_non_null() {
        let cleaned = sanitize_schema(&json!({"type": ["string", "null"]}));
        assert_eq!(cleaned["type"], "string");
    }

    #[test]
    fn ref_becomes_described_object() {
        let cleaned = sanitize_schema(&json!({"$ref": "#/$defs/ExecRequest"}));
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["description"], "See: ExecRequest");
    }

    #[test]
    fn all_of_merges_properties_and_required() {
        let cleaned = sanitize_schema(&json!({
            "allOf": [
                { "type": "object", "properties": { "a": { "type": "string" } }, "required": ["a"] },
                { "type": "object", "properties": { "b": { "type": "integer" } }, "required": ["b"] }
            ]
        }));
        assert!(cleaned["properties"].get("a").is_some());
        assert!(cleaned["properties"].get("b").is_some());
        let required = cleaned["required"].as_array().unwrap();
        assert!(required.contains(&json!("a")) && required.contains(&json!("b")));
    }

    #[test]
    fn any_of_prefers_branch_with_properties() {
        let cleaned = sanitize_schema(&json!({
            "anyOf": [
                { "type": "string" },
                { "type": "object", "properties": { "q": { "type": "string" } } }
            ]
        }));
        assert_eq!(cleaned["type"], "object");
        assert!(cleaned["properties"].get("q").is_some());
    }

    #[test]
    fn required_is_intersected_with_declared_properties() {
        let cleaned = sanitize_schema(&gnarly_schema());
        let required = cleaned["required"].as_array().unwrap();
        assert_eq!(required, &vec![json!("path")]);
    }

    #[test]
    fn empty_schema_becomes_reason_placeholder() {
        let cleaned = sanitize_schema(&json!({}));
        assert_eq!(cleaned["type"], "object");
        assert!(cleaned["properties"].get("reason").is_some());
        assert_eq!(cleaned["required"], json!(["reason"]));
    }

    #[test]
    fn non_object_parameters_are_wrapped() {
        let cleaned = sanitize_function_parameters(&json!({"type": "array", "items": {"type": "string"}}));
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["required"], json!(["input"]));
        assert_eq!(cleaned["properties"]["input"]["type"], "array");
    }

    #[test]
    fn untyped_object_with_properties_gains_object_type() {
        let cleaned = sanitize_function_parameters(&json!({
            "properties": { "cmd": { "type": "string" } }
        }));
        assert_eq!(cleaned["type"], "object");
        assert!(cleaned["properties"].get("cmd").is_some());
    }
}
