//! Compiled JSON Schema attached to step inputs and outputs.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A JSON Schema (draft-07) compiled once at definition time
#[derive(Clone)]
pub struct StepSchema {
    raw: Value,
    compiled: Arc<JSONSchema>,
}

/// Validation failure: the first offending instance path plus every message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub errors: Vec<String>,
}

impl StepSchema {
    pub fn compile(raw: Value) -> Result<Self, String> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&raw)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            raw,
            compiled: Arc::new(compiled),
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn validate(&self, instance: &Value) -> Result<(), SchemaViolation> {
        match self.compiled.validate(instance) {
            Ok(()) => Ok(()),
            Err(errors) => {
                let mut path = None;
                let messages: Vec<String> = errors
                    .map(|e| {
                        let pointer = e.instance_path.to_string();
                        let pointer = if pointer.is_empty() { "/".to_string() } else { pointer };
                        path.get_or_insert_with(|| pointer.clone());
                        format!("Property '{}': {}", pointer, e.to_string().replace('\n', " "))
                    })
                    .collect();
                Err(SchemaViolation {
                    path: path.unwrap_or_else(|| "/".to_string()),
                    errors: messages,
                })
            }
        }
    }
}

impl fmt::Debug for StepSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StepSchema").field(&self.raw).finish()
    }
}

impl PartialEq for StepSchema {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Serialize for StepSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StepSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        StepSchema::compile(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_schema() -> StepSchema {
        StepSchema::compile(json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer", "minimum": 0}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_instance_passes() {
        assert!(user_schema().validate(&json!({"name": "ada", "age": 36})).is_ok());
    }

    #[test]
    fn test_violation_reports_offending_path() {
        let violation = user_schema()
            .validate(&json!({"name": "ada", "age": -1}))
            .unwrap_err();
        assert_eq!(violation.path, "/age");
        assert_eq!(violation.errors.len(), 1);
    }

    #[test]
    fn test_missing_required_reports_root() {
        let violation = user_schema().validate(&json!({})).unwrap_err();
        assert_eq!(violation.path, "/");
    }

    #[test]
    fn test_malformed_schema_is_rejected() {
        assert!(StepSchema::compile(json!({"type": "not-a-type"})).is_err());
    }

    #[test]
    fn test_schema_round_trips_as_raw_json() {
        let schema = user_schema();
        let value = serde_json::to_value(&schema).unwrap();
        let restored: StepSchema = serde_json::from_value(value).unwrap();
        assert_eq!(restored, schema);
    }
}
