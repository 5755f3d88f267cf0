//! Tool descriptor registry: parse a server's advertised catalog.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ToolMeshError};

/// A tool advertised by one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
    /// Output shape hint, when the server advertises one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Parse a raw `tools/list` result into descriptors.
///
/// Accepts `{"tools": [...]}` or a bare array. Unknown fields are ignored.
/// Entries without a name, with a malformed input schema, or with a name
/// already seen in this catalog are rejected.
pub fn parse_catalog(server_id: &str, raw: &Value) -> Result<Vec<ToolDescriptor>> {
    let entries = match raw {
        Value::Array(entries) => entries,
        Value::Object(map) => match map.get("tools") {
            Some(Value::Array(entries)) => entries,
            Some(other) => {
                return Err(ToolMeshError::schema(
                    server_id,
                    format!("`tools` must be an array, got {}", type_name(other)),
                ))
            }
            None => return Err(ToolMeshError::schema(server_id, "catalog has no `tools` field")),
        },
        other => {
            return Err(ToolMeshError::schema(
                server_id,
                format!("catalog must be an object or array, got {}", type_name(other)),
            ))
        }
    };

    let mut seen = HashSet::with_capacity(entries.len());
    let mut descriptors = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let descriptor = parse_entry(server_id, index, entry)?;
        if !seen.insert(descriptor.name.clone()) {
            return Err(ToolMeshError::schema(
                server_id,
                format!("duplicate tool name '{}'", descriptor.name),
            ));
        }
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

fn parse_entry(server_id: &str, index: usize, entry: &Value) -> Result<ToolDescriptor> {
    let Value::Object(fields) = entry else {
        return Err(ToolMeshError::schema(
            server_id,
            format!("tool #{index} must be an object"),
        ));
    };

    let name = match fields.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name.clone(),
        Some(Value::String(_)) => {
            return Err(ToolMeshError::schema(server_id, format!("tool #{index} has an empty name")))
        }
        Some(_) => {
            return Err(ToolMeshError::schema(
                server_id,
                format!("tool #{index} name must be a string"),
            ))
        }
        None => {
            return Err(ToolMeshError::schema(server_id, format!("tool #{index} has no name")))
        }
    };

    let description = fields
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let input_schema = match fields.get("inputSchema").or_else(|| fields.get("input_schema")) {
        None | Some(Value::Null) => serde_json::json!({ "type": "object" }),
        Some(schema) => {
            validate_object_schema(schema)
                .map_err(|reason| ToolMeshError::schema(server_id, format!("tool '{name}': {reason}")))?;
            schema.clone()
        }
    };

    let output_schema = fields
        .get("outputSchema")
        .filter(|schema| schema.is_object())
        .cloned();

    Ok(ToolDescriptor {
        server_id: server_id.to_owned(),
        name,
        description,
        input_schema,
        output_schema,
    })
}

fn validate_object_schema(schema: &Value) -> std::result::Result<(), String> {
    let Value::Object(schema) = schema else {
        return Err(format!("inputSchema must be an object, got {}", type_name(schema)));
    };
    if let Some(kind) = schema.get("type") {
        if kind != "object" {
            return Err(format!("inputSchema type must be \"object\", got {kind}"));
        }
    }
    if let Some(properties) = schema.get("properties") {
        if !properties.is_object() {
            return Err("inputSchema properties must be an object".into());
        }
    }
    if let Some(required) = schema.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err("inputSchema required must be an array of strings".into());
        }
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
