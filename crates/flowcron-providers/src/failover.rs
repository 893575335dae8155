//! Client failover — automatic fallback when the primary model fails.
//!
//! Lightweight chain: try primary → fallback₁ → fallback₂.
//! A client that keeps failing is skipped until its cool-down expires.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{AiClient, TokenStream};
use flowcron_core::types::ChatRequest;

const MAX_FAILURES: u32 = 3;
const COOLDOWN_SECS: u64 = 60;

/// Per-client health tracking.
struct ClientSlot {
    label: String,
    client: Arc<dyn AiClient>,
    /// Consecutive failure count.
    failures: AtomicU32,
    /// Unix seconds of the last failure, 0 = never failed.
    last_failure: AtomicU64,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ClientSlot {
    fn new(label: String, client: Arc<dyn AiClient>) -> Self {
        Self {
            label,
            client,
            failures: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
        }
    }

    /// Healthy while below the failure threshold or once the cool-down expired.
    fn is_healthy(&self) -> bool {
        if self.failures.load(Ordering::Relaxed) < MAX_FAILURES {
            return true;
        }
        let last = self.last_failure.load(Ordering::Relaxed);
        unix_now().saturating_sub(last) > COOLDOWN_SECS
    }

    fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self, error: &FlowError) {
        let fails = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_failure.store(unix_now(), Ordering::Relaxed);
        tracing::warn!("⚠️ Model {} failed (attempt {}): {}", self.label, fails, error);
    }
}

/// Tries clients in order, skipping unhealthy ones.
pub struct FailoverClient {
    slots: Vec<ClientSlot>,
}

impl FailoverClient {
    /// First client is primary, the rest are fallbacks.
    pub fn new(clients: Vec<(String, Arc<dyn AiClient>)>) -> Result<Self> {
        if clients.is_empty() {
            return Err(FlowError::Config("failover chain needs at least one client".into()));
        }
        Ok(Self {
            slots: clients
                .into_iter()
                .map(|(label, client)| ClientSlot::new(label, client))
                .collect(),
        })
    }

    pub fn chain_len(&self) -> usize {
        self.slots.len()
    }

    /// (label, healthy, consecutive failures) for each client.
    pub fn health_status(&self) -> Vec<(&str, bool, u32)> {
        self.slots
            .iter()
            .map(|s| (s.label.as_str(), s.is_healthy(), s.failures.load(Ordering::Relaxed)))
            .collect()
    }

    fn exhausted(last_error: Option<FlowError>) -> FlowError {
        last_error.unwrap_or_else(|| FlowError::Provider("All models unhealthy".into()))
    }
}

#[async_trait]
impl AiClient for FailoverClient {
    fn model_name(&self) -> &str {
        self.slots[0].client.model_name()
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let mut last_error = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.is_healthy() {
                tracing::debug!("⏭️ Skipping unhealthy model: {}", slot.label);
                continue;
            }
            match slot.client.complete(request).await {
                Ok(text) => {
                    if idx > 0 {
                        tracing::info!("🔄 Failover: {} → {}", self.slots[0].label, slot.label);
                    }
                    slot.record_success();
                    return Ok(text);
                }
                Err(e) => {
                    slot.record_failure(&e);
                    last_error = Some(e);
                }
            }
        }
        Err(Self::exhausted(last_error))
    }

    /// Fails over only while opening the stream; a stream that broke
    /// mid-way is not restarted elsewhere.
    async fn complete_stream(&self, request: &ChatRequest) -> Result<TokenStream> {
        let mut last_error = None;
        for slot in self.slots.iter().filter(|s| s.is_healthy()) {
            match slot.client.complete_stream(request).await {
                Ok(stream) => {
                    slot.record_success();
                    return Ok(stream);
                }
                Err(e @ FlowError::Unsupported(_)) => last_error = Some(e),
                Err(e) => {
                    slot.record_failure(&e);
                    last_error = Some(e);
                }
            }
        }
        Err(Self::exhausted(last_error))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;
        for slot in self.slots.iter().filter(|s| s.is_healthy()) {
            match slot.client.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => last_error = Some(e),
            }
        }
        Err(Self::exhausted(last_error))
    }
}
