//! Argument validation against a tool's JSON Schema.
//!
//! Covers the subset of JSON Schema that function-calling tool definitions
//! use in practice: `type`, `properties`, `required`, `enum`, `minimum`,
//! `maximum`, `items` and `additionalProperties: false`. Unknown keywords are
//! ignored.

use serde_json::{Map, Value};

/// Validate tool arguments. The error names the offending argument path.
pub fn validate_arguments(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    validate_object(schema, args, "")
}

fn validate_object(schema: &Value, obj: &Map<String, Value>, path: &str) -> Result<(), String> {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match obj.get(key) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required argument '{}'", join(path, key)))
                }
                Some(_) => {}
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in obj {
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => validate_value(prop_schema, value, &join(path, key))?,
            None if closed => {
                return Err(format!("unexpected argument '{}'", join(path, key)));
            }
            None => {}
        }
    }

    Ok(())
}

fn validate_value(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    // Optional arguments sent as null are treated as absent.
    if value.is_null() {
        return Ok(());
    }

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matches {
            return Err(format!(
                "argument '{path}' must be of type {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!(
                "argument '{path}' must be one of {}",
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                return Err(format!("argument '{path}' must be >= {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                return Err(format!("argument '{path}' must be <= {max}"));
            }
        }
    }

    match value {
        Value::Object(obj) => validate_object(schema, obj, path),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}
