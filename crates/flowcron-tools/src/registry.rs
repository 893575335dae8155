//! Tool registry — name-indexed dispatch with uniform error handling.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use flowcron_core::traits::Tool;
use flowcron_core::types::{OperationType, ToolDefinition, ToolExecutionResult};
use futures::FutureExt;
use serde_json::{Map, Value, json};

/// Metadata flag set when a failure came from a tool error or panic rather
/// than from the tool's own `success = false` answer.
pub const EXCEPTION_FLAG: &str = "exception";

/// Registered tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tools.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::http_request::HttpRequestTool::new()));
        registry
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!("⚠️ Tool '{}' re-registered, previous one replaced", name);
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.get(name).map(|t| t.definition())
    }

    pub fn infos(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Execute a tool and return the serialized `ToolExecutionResult`.
    pub async fn execute(&self, name: &str, arguments: &str) -> String {
        let result = self.execute_result(name, arguments).await;
        serde_json::to_string(&result).unwrap_or_else(|e| {
            json!({
                "success": false,
                "operation_type": "operation",
                "message": format!("failed to serialize result of '{name}': {e}"),
            })
            .to_string()
        })
    }

    /// Execute a tool. Never fails: every problem becomes a failure result.
    pub async fn execute_result(&self, name: &str, arguments: &str) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!("⚠️ Tool not found: {}", name);
            return ToolExecutionResult::failure(
                OperationType::Operation,
                &format!("tool not found: {name}"),
            );
        };

        let params = match parse_arguments(arguments) {
            Ok(params) => params,
            Err(e) => {
                return ToolExecutionResult::failure(
                    OperationType::Operation,
                    &format!("malformed arguments for '{name}': {e}"),
                );
            }
        };

        if let Err(e) = validate_args(&tool.definition(), &Value::Object(params.clone())) {
            return ToolExecutionResult::failure(
                OperationType::Operation,
                &format!("invalid arguments for '{name}': {e}"),
            );
        }

        let start = Instant::now();
        let outcome = AssertUnwindSafe(tool.execute(&params)).catch_unwind().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolExecutionResult::failure(
                OperationType::Operation,
                &format!("tool '{name}' failed: {e}"),
            )
            .with_metadata(EXCEPTION_FLAG, Value::Bool(true)),
            Err(panic) => ToolExecutionResult::failure(
                OperationType::Operation,
                &format!("tool '{name}' panicked: {}", panic_message(panic.as_ref())),
            )
            .with_metadata(EXCEPTION_FLAG, Value::Bool(true)),
        };

        tracing::info!(
            "🔧 Tool '{}' finished in {}ms (success={})",
            name,
            elapsed_ms,
            result.success
        );
        result.with_metadata("elapsed_ms", json!(elapsed_ms))
    }
}

/// Blank input means "no arguments"; anything else must be a JSON object.
fn parse_arguments(arguments: &str) -> Result<Map<String, Value>, String> {
    if arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Validate that a tool call has the required arguments.
pub fn validate_args(definition: &ToolDefinition, args: &Value) -> Result<(), String> {
    let params = &definition.parameters;
    if let Some(required) = params.get("required").and_then(|r| r.as_array()) {
        for req in required {
            if let Some(key) = req.as_str()
                && args.get(key).is_none() {
                    return Err(format!("Missing required argument: {key}"));
                }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcron_core::error::{FlowError, Result};

    struct LookupTool;

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "lookup".into(),
                description: "Find a customer by id".into(),
                parameters: json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
            }
        }

        async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            match params.get("id").and_then(Value::as_str) {
                Some("42") => Ok(ToolExecutionResult::query_success(json!({"name": "Ada"}), "")),
                Some("boom") => Err(FlowError::Tool("backend unreachable".into())),
                Some("panic") => panic!("lookup exploded"),
                _ => Ok(ToolExecutionResult::empty(Some("not found"))),
            }
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: "Echo arguments".into(),
                parameters: json!({}),
            }
        }

        async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
            Ok(ToolExecutionResult::operation_success(Value::Object(params.clone()), "ok"))
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(Arc::new(LookupTool));
        r.register(Arc::new(EchoTool));
        r
    }

    #[tokio::test]
    async fn test_missing_tool_is_failure_result() {
        let raw = registry().execute("nope", "{}").await;
        let result: ToolExecutionResult = serde_json::from_str(&raw).unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "tool not found: nope");
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_failure_result() {
        let result = registry().execute_result("lookup", "{not json").await;
        assert!(!result.success);
        assert!(result.message.contains("malformed arguments"));

        let result = registry().execute_result("echo", "[1, 2]").await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_blank_arguments_mean_empty_map() {
        let result = registry().execute_result("echo", "   ").await;
        assert!(result.success);
        assert_eq!(result.data, json!({}));
    }

    #[tokio::test]
    async fn test_required_argument_checked() {
        let result = registry().execute_result("lookup", "{}").await;
        assert!(!result.success);
        assert!(result.message.contains("Missing required argument: id"));
    }

    #[tokio::test]
    async fn test_tool_error_and_panic_become_failures() {
        let r = registry();
        let err = r.execute_result("lookup", r#"{"id":"boom"}"#).await;
        assert!(!err.success);
        assert!(err.message.contains("backend unreachable"));
        assert_eq!(err.metadata[EXCEPTION_FLAG], json!(true));

        let panicked = r.execute_result("lookup", r#"{"id":"panic"}"#).await;
        assert!(!panicked.success);
        assert!(panicked.message.contains("lookup exploded"));
    }

    #[tokio::test]
    async fn test_business_failure_is_not_flagged_as_exception() {
        let result = registry().execute_result("lookup", r#"{"id":"7"}"#).await;
        assert!(!result.success);
        assert_eq!(result.message, "not found");
        assert!(!result.metadata.contains_key(EXCEPTION_FLAG));
        assert!(result.metadata.contains_key("elapsed_ms"));
    }

    #[tokio::test]
    async fn test_success_roundtrips_through_string() {
        let raw = registry().execute("lookup", r#"{"id":"42"}"#).await;
        let result: ToolExecutionResult = serde_json::from_str(&raw).unwrap();
        assert!(result.success);
        assert_eq!(result.data["name"], "Ada");
    }

    #[test]
    fn test_introspection() {
        let r = registry();
        assert_eq!(r.names(), vec!["echo".to_string(), "lookup".to_string()]);
        assert!(r.has_tool("lookup"));
        assert_eq!(r.info("lookup").unwrap().description, "Find a customer by id");
        assert!(r.info("missing").is_none());
        assert_eq!(r.infos().len(), 2);
        assert!(ToolRegistry::with_defaults().has_tool("http_request"));
    }

    #[test]
    fn test_validate_args_missing() {
        let def = ToolDefinition {
            name: "test".into(),
            description: "test tool".into(),
            parameters: json!({
                "required": ["cmd"],
                "properties": { "cmd": { "type": "string" } }
            }),
        };
        assert!(validate_args(&def, &json!({})).is_err());
        assert!(validate_args(&def, &json!({"cmd": "ls"})).is_ok());
    }
}
