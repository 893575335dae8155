//! HTTP Request tool — call external APIs from a workflow step.

use async_trait::async_trait;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::Tool;
use flowcron_core::types::{OperationType, ToolDefinition, ToolExecutionResult};
use serde_json::{Map, Value, json};

const MAX_BODY_CHARS: usize = 8000;

pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("FlowCron/0.2")
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "http_request".into(),
            description: "Make an HTTP request. GET is a query; other methods are operations. Non-2xx answers fail the step.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "URL to request" },
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST", "PUT", "DELETE", "PATCH"],
                        "description": "HTTP method (default: GET)"
                    },
                    "headers": { "type": "object", "description": "Request headers" },
                    "body": { "description": "Request body; objects are sent as JSON" },
                    "timeout_secs": { "type": "integer", "description": "Timeout in seconds (default: 15)" }
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<ToolExecutionResult> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::Tool("Missing 'url'".into()))?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let timeout = params.get("timeout_secs").and_then(Value::as_u64).unwrap_or(15);
        let operation_type = if method == "GET" {
            OperationType::Query
        } else {
            OperationType::Operation
        };

        let lower_url = url.to_lowercase();
        if lower_url.contains("169.254.") || lower_url.contains("metadata.google") {
            return Ok(ToolExecutionResult::failure(
                operation_type,
                "Blocked: cannot access cloud metadata endpoints",
            ));
        }

        let mut request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            other => {
                return Ok(ToolExecutionResult::failure(
                    operation_type,
                    &format!("Unsupported method: {other}"),
                ));
            }
        };
        request = request.timeout(std::time::Duration::from_secs(timeout));

        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(val_str) = value.as_str()
                    && let Ok(name) = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    && let Ok(val) = reqwest::header::HeaderValue::from_str(val_str)
                {
                    request = request.header(name, val);
                }
            }
        }

        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(other) => request = request.json(other),
        }

        let response = request
            .send()
            .await
            .map_err(|e| FlowError::Http(format!("{method} {url} failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FlowError::Http(format!("Read body failed: {e}")))?;

        let body = serde_json::from_str::<Value>(&text).unwrap_or_else(|_| {
            if text.chars().count() > MAX_BODY_CHARS {
                let cut: String = text.chars().take(MAX_BODY_CHARS).collect();
                Value::String(format!("{cut}...[truncated, {} total bytes]", text.len()))
            } else {
                Value::String(text)
            }
        });

        if !status.is_success() {
            return Ok(ToolExecutionResult::failure(
                operation_type,
                &format!("HTTP {} from {method} {url}", status.as_u16()),
            )
            .with_metadata("status", json!(status.as_u16())));
        }

        let data = json!({ "status": status.as_u16(), "body": body });
        let message = format!("HTTP {} {method} {url}", status.as_u16());
        Ok(match operation_type {
            OperationType::Query => ToolExecutionResult::query_success(data, &message),
            _ => ToolExecutionResult::operation_success(data, &message),
        })
    }
}
