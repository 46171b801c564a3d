//! Body validation against a JSON-Schema subset.
//!
//! Supports `type`, `required`, `properties`, `items` (uniform and
//! positional), and `enum`. Issues are collected, not short-circuited, so a
//! report covers the whole body.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

/// Validate `data` against `schema`, returning every issue found.
pub fn validate_schema(schema: &Value, data: &Value) -> Vec<SchemaIssue> {
    let mut issues = Vec::new();
    check(schema, data, "/", &mut issues);
    issues
}

fn check(schema: &Value, data: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, data) {
            issues.push(SchemaIssue {
                path: path.to_string(),
                message: format!(
                    "expected type {}, got {}",
                    render_type(expected),
                    type_name(data)
                ),
            });
            return;
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(data) {
            issues.push(SchemaIssue {
                path: path.to_string(),
                message: format!("value {data} is not one of the allowed values"),
            });
        }
    }

    if let Value::Object(object) = data {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    issues.push(SchemaIssue {
                        path: path.to_string(),
                        message: format!("missing required property {name:?}"),
                    });
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, property_schema) in properties {
                if let Some(value) = object.get(name) {
                    check(property_schema, value, &join(path, name), issues);
                }
            }
        }
    }

    if let Value::Array(items) = data {
        match schema.get("items") {
            Some(Value::Array(positional)) => {
                for (i, item) in items.iter().enumerate() {
                    if let Some(item_schema) = positional.get(i) {
                        check(item_schema, item, &join(path, &i.to_string()), issues);
                    }
                }
            }
            Some(uniform) => {
                for (i, item) in items.iter().enumerate() {
                    check(uniform, item, &join(path, &i.to_string()), issues);
                }
            }
            None => {}
        }
    }
}

fn join(path: &str, segment: &str) -> String {
    if path == "/" {
        format!("/{segment}")
    } else {
        format!("{path}/{segment}")
    }
}

fn type_matches(expected: &Value, data: &Value) -> bool {
    match expected {
        Value::String(name) => single_type_matches(name, data),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| single_type_matches(name, data)),
        _ => true,
    }
}

fn single_type_matches(name: &str, data: &Value) -> bool {
    match name {
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => data.is_i64() || data.is_u64(),
        "boolean" => data.is_boolean(),
        "array" => data.is_array(),
        "object" => data.is_object(),
        "null" => data.is_null(),
        _ => true,
    }
}

fn render_type(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        other => other.to_string(),
    }
}

fn type_name(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
