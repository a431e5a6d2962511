//! LLM provider abstraction
//!
//! The control plane only needs one thing from a model: given a message
//! history and a tool list, return text and/or tool calls. Everything
//! else (providers, gateways) hides behind [`LlmClient`].

mod anthropic;
mod registry;
mod types;

pub use anthropic::AnthropicClient;
pub use registry::{LlmConfig, ModelRegistry};
pub use types::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// LLM error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(LlmErrorKind::RateLimit, message);
        err.retry_after = retry_after;
        err
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::ServerError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::InvalidRequest, message)
    }
}

/// Error classification for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Network issues, timeouts - retryable
    Network,
    /// Rate limited (429) - retryable with backoff
    RateLimit,
    /// Server error (5xx) - retryable
    ServerError,
    /// Authentication failed (401, 403) - not retryable
    Auth,
    /// Bad request (400) - not retryable
    InvalidRequest,
}

/// Common interface for LLM providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Maps a model id to a client. The registry is the production
/// implementation; tests substitute scripted clients.
pub trait LlmResolver: Send + Sync {
    fn resolve(&self, model_id: &str) -> Option<std::sync::Arc<dyn LlmClient>>;
}

impl LlmResolver for ModelRegistry {
    fn resolve(&self, model_id: &str) -> Option<std::sync::Arc<dyn LlmClient>> {
        self.get(model_id)
    }
}
