//! # FlowCron Providers
//!
//! AI client strategies for workflow steps.
//!
//! Every OpenAI-compatible backend (OpenAI, DeepSeek, Groq, OpenRouter,
//! Ollama, Doubao, DashScope, custom endpoints) is served by a single
//! `OpenAiCompatibleClient`. `FailoverClient` chains clients, and
//! `ClientRegistry` maps the model names used by steps to clients.

pub mod failover;
pub mod openai_compatible;
pub mod provider_registry;
pub mod registry;

use std::sync::Arc;

use flowcron_core::config::ModelConfig;
use flowcron_core::error::Result;
use flowcron_core::traits::AiClient;

pub use failover::FailoverClient;
pub use openai_compatible::OpenAiCompatibleClient;
pub use registry::ClientRegistry;

/// Create a client for one configured model.
pub fn create_client(config: &ModelConfig) -> Result<Arc<dyn AiClient>> {
    let client = OpenAiCompatibleClient::from_config(config)?;
    tracing::debug!("🔌 Model '{}' → {} ({})", config.name, config.provider, config.model);
    Ok(Arc::new(client))
}

/// List all provider names accepted in config.
pub fn available_providers() -> Vec<&'static str> {
    let mut names = provider_registry::all_preset_names();
    names.push("custom");
    names
}
