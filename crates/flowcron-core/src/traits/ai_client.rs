//! AI client strategy — one contract over heterogeneous model backends.
//!
//! Implementors provide `complete` and, when the backend can stream,
//! `complete_stream`. Everything else is derived. Capabilities a backend
//! lacks answer `FlowError::Unsupported` instead of empty data.
//!
//! Implementors own their transport (HTTP client, sockets) and release it
//! when dropped.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::{FlowError, Result};
use crate::types::{ChatMessage, ChatRequest};

/// Incremental text fragments in arrival order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait AiClient: Send + Sync {
    /// Model identifier this client talks to.
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    async fn complete_stream(&self, _request: &ChatRequest) -> Result<TokenStream> {
        Err(FlowError::Unsupported(format!(
            "streaming chat is not available for {}",
            self.model_name()
        )))
    }

    async fn chat(&self, message: &str) -> Result<String> {
        self.complete(&ChatRequest::from_message(message)).await
    }

    async fn chat_with_system(
        &self,
        system_prompt: &str,
        message: &str,
        return_json: bool,
    ) -> Result<String> {
        self.complete(&ChatRequest::with_system(system_prompt, message, return_json))
            .await
    }

    async fn chat_with_history(&self, messages: &[ChatMessage]) -> Result<String> {
        self.complete(&ChatRequest::from_history(messages)).await
    }

    /// Drive a stream into callbacks. Exactly one terminal callback fires.
    async fn stream_request(&self, request: ChatRequest, mut callbacks: StreamCallbacks) {
        let mut stream = match self.complete_stream(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                callbacks.fail(e);
                return;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => callbacks.token(token),
                Err(e) => {
                    callbacks.fail(e);
                    return;
                }
            }
        }
        callbacks.complete();
    }

    async fn stream_chat(&self, message: &str, callbacks: StreamCallbacks) {
        self.stream_request(ChatRequest::from_message(message), callbacks)
            .await
    }

    async fn stream_chat_with_system(
        &self,
        system_prompt: &str,
        message: &str,
        callbacks: StreamCallbacks,
    ) {
        self.stream_request(ChatRequest::with_system(system_prompt, message, false), callbacks)
            .await
    }

    async fn stream_chat_with_history(&self, messages: &[ChatMessage], callbacks: StreamCallbacks) {
        self.stream_request(ChatRequest::from_history(messages), callbacks)
            .await
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(FlowError::Unsupported(format!(
            "embeddings are not available for {}",
            self.model_name()
        )))
    }

    async fn generate_image(&self, _prompt: &str) -> Result<String> {
        Err(FlowError::Unsupported(format!(
            "image generation is not available for {}",
            self.model_name()
        )))
    }
}

type TokenFn = Box<dyn FnMut(String) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(FlowError) + Send>;

/// Callbacks for one stream. The terminal methods consume `self`, so only
/// one of `complete` or `fail` can ever run.
pub struct StreamCallbacks {
    on_token: TokenFn,
    on_complete: CompleteFn,
    on_error: ErrorFn,
}

impl StreamCallbacks {
    pub fn new(
        on_token: impl FnMut(String) + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
        on_error: impl FnOnce(FlowError) + Send + 'static,
    ) -> Self {
        Self {
            on_token: Box::new(on_token),
            on_complete: Box::new(on_complete),
            on_error: Box::new(on_error),
        }
    }

    pub fn token(&mut self, token: String) {
        (self.on_token)(token)
    }

    pub fn complete(self) {
        (self.on_complete)()
    }

    pub fn fail(self, error: FlowError) {
        (self.on_error)(error)
    }
}

/// Run a streaming chat on its own task so the caller is never blocked.
///
/// Aborting the returned handle abandons the stream; neither terminal
/// callback fires in that case.
pub fn spawn_stream_chat(
    client: Arc<dyn AiClient>,
    request: ChatRequest,
    callbacks: StreamCallbacks,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { client.stream_request(request, callbacks).await })
}
