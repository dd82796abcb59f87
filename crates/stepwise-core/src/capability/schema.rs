//! Minimal JSON-schema checks for capability contracts
//!
//! Supported keywords: `type` (string or list), `const`, `enum`, `required`,
//! `properties`, `additionalProperties: false`, `items`. Anything else is ignored.

use serde_json::{Map, Value};
use thiserror::Error;

/// First mismatch found, with a `$.a.b[0]` style path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {reason}")]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn at(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Check `value` against `schema`. A null schema accepts everything.
pub fn check(value: &Value, schema: &Value) -> Result<(), SchemaViolation> {
    if schema.is_null() {
        return Ok(());
    }
    check_at(value, schema, "$")
}

fn check_at(value: &Value, schema: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(rules) = schema.as_object() else {
        return Err(SchemaViolation::at(path, "schema must be an object"));
    };

    if let Some(expected) = rules.get("type") {
        check_type(value, expected, path)?;
    }
    if let Some(constant) = rules.get("const") {
        if value != constant {
            return Err(SchemaViolation::at(path, format!("expected {}", constant)));
        }
    }
    if let Some(Value::Array(allowed)) = rules.get("enum") {
        if !allowed.contains(value) {
            return Err(SchemaViolation::at(path, "value not in enum"));
        }
    }

    check_object_rules(value, rules, path)?;

    if let Some(item_schema) = rules.get("items") {
        let items = value
            .as_array()
            .ok_or_else(|| SchemaViolation::at(path, "expected an array"))?;
        for (index, item) in items.iter().enumerate() {
            check_at(item, item_schema, &format!("{}[{}]", path, index))?;
        }
    }
    Ok(())
}

fn check_object_rules(
    value: &Value,
    rules: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaViolation> {
    let required = rules.get("required").and_then(Value::as_array);
    let properties = rules.get("properties").and_then(Value::as_object);
    if required.is_none() && properties.is_none() {
        return Ok(());
    }
    let object = value
        .as_object()
        .ok_or_else(|| SchemaViolation::at(path, "expected an object"))?;

    for field in required.into_iter().flatten().filter_map(Value::as_str) {
        if !object.contains_key(field) {
            return Err(SchemaViolation::at(
                path,
                format!("missing required field '{}'", field),
            ));
        }
    }

    let Some(properties) = properties else {
        return Ok(());
    };
    for (key, child) in object {
        match properties.get(key) {
            Some(child_schema) => check_at(child, child_schema, &format!("{}.{}", path, key))?,
            None if rules.get("additionalProperties") == Some(&Value::Bool(false)) => {
                return Err(SchemaViolation::at(path, format!("unknown field '{}'", key)));
            }
            None => {}
        }
    }
    Ok(())
}

fn check_type(value: &Value, expected: &Value, path: &str) -> Result<(), SchemaViolation> {
    let accepted: Vec<&str> = match expected {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => return Err(SchemaViolation::at(path, "`type` must be a string or list")),
    };
    if accepted.iter().any(|name| type_matches(name, value)) {
        Ok(())
    } else {
        Err(SchemaViolation::at(
            path,
            format!("expected type {}", accepted.join(" | ")),
        ))
    }
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => false,
    }
}
