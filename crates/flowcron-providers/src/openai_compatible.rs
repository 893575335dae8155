//! Unified OpenAI-compatible client.
//!
//! One struct handles chat completions, SSE token streaming and embeddings
//! for every OpenAI-compatible backend. Backends differ only by endpoint
//! URL, auth style and API key.

use async_trait::async_trait;
use flowcron_core::config::ModelConfig;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{AiClient, TokenStream};
use flowcron_core::types::ChatRequest;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::provider_registry::{self, AuthStyle};

/// A client bound to one model on one OpenAI-compatible backend.
pub struct OpenAiCompatibleClient {
    /// Provider name (e.g. "openai", "deepseek").
    provider: String,
    /// Model identifier sent in every request.
    model: String,
    api_key: String,
    /// Base URL without trailing slash (e.g. "https://api.openai.com/v1").
    base_url: String,
    auth_style: AuthStyle,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    /// Build from a model entry.
    ///
    /// Resolution order:
    /// - API key: `api_key` > preset env vars > empty
    /// - Base URL: `endpoint` > preset env override > preset default
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let (base_url, env_key, auth_style) = match provider_registry::get_preset(&config.provider)
        {
            Some(preset) => (
                preset.resolved_base_url(),
                preset.env_api_key(),
                preset.auth_style,
            ),
            None if !config.endpoint.is_empty() => {
                (config.endpoint.clone(), String::new(), AuthStyle::Bearer)
            }
            None => {
                return Err(FlowError::Config(format!(
                    "model '{}': unknown provider '{}' and no endpoint",
                    config.name, config.provider
                )));
            }
        };

        let api_key = if config.api_key.is_empty() { env_key } else { config.api_key.clone() };
        let base_url = if config.endpoint.is_empty() { base_url } else { config.endpoint.clone() };
        let auth_style = if api_key.is_empty() && config.provider == "custom" {
            AuthStyle::None
        } else {
            auth_style
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| FlowError::Http(format!("client build failed: {e}")))?;

        Ok(Self {
            provider: config.provider.clone(),
            model: config.model.clone(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_style,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    /// Build for an arbitrary endpoint. An empty key disables auth.
    pub fn custom(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            provider: "custom".into(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_style: if api_key.is_empty() { AuthStyle::None } else { AuthStyle::Bearer },
            temperature: 0.7,
            max_tokens: 2048,
            client: reqwest::Client::new(),
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer if !self.api_key.is_empty() => {
                req.header("Authorization", format!("Bearer {}", self.api_key))
            }
            _ => req,
        }
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if request.return_json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    /// POST a JSON body and fail on non-2xx answers.
    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response> {
        if self.auth_style != AuthStyle::None && self.api_key.is_empty() {
            return Err(FlowError::ApiKeyMissing(self.provider.clone()));
        }

        let url = format!("{}{}", self.base_url, path);
        let req = self.apply_auth(self.client.post(&url).json(body));
        let resp = req.send().await.map_err(|e| {
            FlowError::Http(format!("{} connection failed ({}): {}", self.provider, url, e))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(FlowError::Provider(format!(
                "{} API error {}: {}",
                self.provider, status, text
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl AiClient for OpenAiCompatibleClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let resp = self.post("/chat/completions", &self.chat_body(request, false)).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Http(e.to_string()))?;

        let choice = json["choices"]
            .get(0)
            .ok_or_else(|| FlowError::Provider("No choices in response".into()))?;
        Ok(choice["message"]["content"].as_str().unwrap_or_default().to_string())
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<TokenStream> {
        let resp = self.post("/chat/completions", &self.chat_body(request, true)).await?;
        let provider = self.provider.clone();
        let mut bytes = resp.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            while !done {
                let Some(chunk) = bytes.next().await else { break };
                let chunk = chunk
                    .map_err(|e| FlowError::Http(format!("{provider} stream interrupted: {e}")))?;
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(&String::from_utf8_lossy(&line))? {
                        SseLine::Token(token) => yield token,
                        SseLine::Done => {
                            done = true;
                            break;
                        }
                        SseLine::Skip => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let resp = self.post("/embeddings", &body).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| FlowError::Http(e.to_string()))?;

        let data = json["data"]
            .as_array()
            .ok_or_else(|| FlowError::Provider("No data in embeddings response".into()))?;
        data.iter()
            .enumerate()
            .map(|(i, item)| {
                item["embedding"]
                    .as_array()
                    .and_then(|v| v.iter().map(|x| x.as_f64().map(|f| f as f32)).collect::<Option<Vec<_>>>())
                    .ok_or_else(|| FlowError::Provider(format!("Malformed embedding at index {i}")))
            })
            .collect()
    }
}

enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let json: Value = serde_json::from_str(data)?;
    if let Some(err) = json.get("error") {
        return Err(FlowError::Provider(format!("stream error: {err}")));
    }
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(token) if !token.is_empty() => Ok(SseLine::Token(token.to_string())),
        _ => Ok(SseLine::Skip),
    }
}
