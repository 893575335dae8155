//! Execution scope — the variable map shared by the steps of one run.
//!
//! The scope is owned by the executor task, so it has exactly one writer.

use serde_json::{Map, Value};

use flowcron_core::error::{FlowError, Result};

/// Reserved key holding the whole trigger payload.
pub const INPUT_KEY: &str = "input";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
    vars: Map<String, Value>,
}

impl Scope {
    /// Seed a scope from a trigger payload.
    ///
    /// The payload is stored under `input`. Top-level keys of an object
    /// payload are also exposed directly, except a key named `input`.
    pub fn seeded(input: &Value) -> Self {
        let mut vars = Map::new();
        if let Value::Object(fields) = input {
            for (key, value) in fields {
                if key != INPUT_KEY {
                    vars.insert(key.clone(), value.clone());
                }
            }
        }
        vars.insert(INPUT_KEY.to_string(), input.clone());
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Write a variable. An empty name discards the value.
    pub fn set(&mut self, name: &str, value: Value) {
        if name.is_empty() {
            return;
        }
        self.vars.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Value a step reads: the named variable, or the trigger input when
    /// the name is empty.
    pub fn resolve_input(&self, name: &str) -> Option<&Value> {
        if name.is_empty() {
            self.vars.get(INPUT_KEY)
        } else {
            self.vars.get(name)
        }
    }

    /// Snapshot persisted as the execution record output.
    pub fn to_output(&self) -> Value {
        Value::Object(self.vars.clone())
    }

    /// Rebuild a scope from a persisted record output.
    pub fn from_output(output: &Value) -> Result<Self> {
        match output {
            Value::Object(vars) => Ok(Self { vars: vars.clone() }),
            other => Err(FlowError::Config(format!(
                "execution output must be a JSON object, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seeded_exposes_object_keys() {
        let scope = Scope::seeded(&json!({"city": "Paris", "days": 3}));
        assert_eq!(scope.get("city"), Some(&json!("Paris")));
        assert_eq!(scope.get(INPUT_KEY), Some(&json!({"city": "Paris", "days": 3})));
        assert_eq!(scope.resolve_input(""), scope.get(INPUT_KEY));
    }

    #[test]
    fn test_input_key_is_not_shadowed() {
        let payload = json!({"input": "inner", "x": 1});
        let scope = Scope::seeded(&payload);
        assert_eq!(scope.get(INPUT_KEY), Some(&payload));
        assert_eq!(scope.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_scalar_payload_only_under_input() {
        let scope = Scope::seeded(&json!("hello"));
        assert_eq!(scope.vars().len(), 1);
        assert_eq!(scope.resolve_input(""), Some(&json!("hello")));
    }

    #[test]
    fn test_empty_name_is_ignored() {
        let mut scope = Scope::default();
        scope.set("", json!(1));
        assert!(scope.vars().is_empty());
    }

    #[test]
    fn test_output_roundtrip_keeps_key_values() {
        let mut scope = Scope::seeded(&json!({"q": "rust"}));
        scope.set("summary", json!("short text"));
        scope.set("facts", json!({"n": 2, "tags": ["a", "b"]}));

        let output = scope.to_output();
        let restored = Scope::from_output(&output).unwrap();
        assert_eq!(restored, scope);
        assert_eq!(restored.get("facts"), Some(&json!({"n": 2, "tags": ["a", "b"]})));
    }

    #[test]
    fn test_non_object_output_rejected() {
        assert!(Scope::from_output(&json!([1, 2])).is_err());
    }
}
