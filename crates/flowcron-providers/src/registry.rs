//! Client registry — resolves a step's model reference to a client.

use std::collections::HashMap;
use std::sync::Arc;

use flowcron_core::config::LlmConfig;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::AiClient;

use crate::failover::FailoverClient;

#[derive(Default, Clone)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<dyn AiClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured model, wrapping those with fallbacks in a
    /// failover chain.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut base: HashMap<String, Arc<dyn AiClient>> = HashMap::new();
        for model in &config.models {
            if base.contains_key(&model.name) {
                return Err(FlowError::Config(format!("duplicate model name '{}'", model.name)));
            }
            base.insert(model.name.clone(), crate::create_client(model)?);
        }

        let mut registry = Self::new();
        for model in &config.models {
            let primary = base[&model.name].clone();
            if model.fallbacks.is_empty() {
                registry.register(&model.name, primary);
                continue;
            }
            let mut chain = vec![(model.name.clone(), primary)];
            for fallback in &model.fallbacks {
                let client = base.get(fallback).cloned().ok_or_else(|| {
                    FlowError::Config(format!(
                        "model '{}' falls back to unknown model '{fallback}'",
                        model.name
                    ))
                })?;
                chain.push((fallback.clone(), client));
            }
            registry.register(&model.name, Arc::new(FailoverClient::new(chain)?));
        }

        tracing::info!("🧠 {} model client(s) ready", registry.clients.len());
        Ok(registry)
    }

    pub fn register(&mut self, name: &str, client: Arc<dyn AiClient>) {
        self.clients.insert(name.to_string(), client);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AiClient>> {
        self.clients
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcron_core::config::ModelConfig;

    fn model(name: &str, fallbacks: &[&str]) -> ModelConfig {
        let mut m = ModelConfig::new(name, "ollama", "llama3");
        m.fallbacks = fallbacks.iter().map(|s| s.to_string()).collect();
        m
    }

    #[test]
    fn test_builds_named_clients() {
        let config = LlmConfig { models: vec![model("fast", &["slow"]), model("slow", &[])] };
        let registry = ClientRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["fast".to_string(), "slow".to_string()]);
        assert_eq!(registry.get("fast").unwrap().model_name(), "llama3");
        assert!(matches!(registry.get("nope"), Err(FlowError::ModelNotFound(_))));
    }

    #[test]
    fn test_unknown_fallback_is_config_error() {
        let config = LlmConfig { models: vec![model("fast", &["ghost"])] };
        assert!(matches!(ClientRegistry::from_config(&config), Err(FlowError::Config(_))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let config = LlmConfig { models: vec![model("a", &[]), model("a", &[])] };
        assert!(ClientRegistry::from_config(&config).is_err());
    }
}
