//! Tool contract types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool metadata exposed for authoring and validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the accepted parameters.
    pub parameters: Value,
}

/// What kind of work a tool call performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Query,
    Operation,
    Save,
}

/// The only contract between a tool and the pipeline.
///
/// `success = false` halts the pipeline. It is a normal value, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub operation_type: OperationType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Tagged view of a result: carry on with the data, or stop with a reason.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolVerdict {
    Proceed(Value),
    Halt(String),
}

impl ToolExecutionResult {
    fn build(success: bool, operation_type: OperationType, data: Value, message: &str) -> Self {
        Self {
            success,
            operation_type,
            data,
            message: message.to_string(),
            metadata: Map::new(),
        }
    }

    pub fn query_success(data: Value, message: &str) -> Self {
        Self::build(true, OperationType::Query, data, message)
    }

    pub fn operation_success(data: Value, message: &str) -> Self {
        Self::build(true, OperationType::Operation, data, message)
    }

    pub fn save_success(data: Value, message: &str) -> Self {
        Self::build(true, OperationType::Save, data, message)
    }

    pub fn failure(operation_type: OperationType, message: &str) -> Self {
        Self::build(false, operation_type, Value::Null, message)
    }

    /// A query that found nothing. Halts like any other failure.
    pub fn empty(message: Option<&str>) -> Self {
        Self::build(
            false,
            OperationType::Query,
            Value::Null,
            message.unwrap_or("no data found"),
        )
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn verdict(&self) -> ToolVerdict {
        if self.success {
            ToolVerdict::Proceed(self.data.clone())
        } else {
            ToolVerdict::Halt(self.message.clone())
        }
    }

    /// Render the result as plain text suitable for a model prompt.
    pub fn to_ai_message(&self) -> String {
        if !self.success {
            return format!("Tool failed: {}", self.message);
        }
        let data = match &self.data {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        match (self.message.is_empty(), data.is_empty()) {
            (true, _) => data,
            (false, true) => self.message.clone(),
            (false, false) => format!("{}\n{}", self.message, data),
        }
    }
}
