//! LLM provider adapters.
//!
//! Two backends sit behind the gateway: a polling conversational bot
//! service for supervisory roles and an OpenAI-compatible chat-completions
//! service for execution roles. Both speak schemaless JSON at the wire;
//! only the fields we consume are modeled, everything else is ignored.

pub mod bot;
pub mod chat;

use std::fmt;

use async_trait::async_trait;

use crate::errors::{ProviderErrorClass, Result};

/// Which backend produced a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Bot,
    Chat,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bot => write!(f, "bot"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

/// Which chat endpoint actually served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Primary,
    Fallback,
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A fully composed request, ready for a provider.
///
/// Prompt composition (system preamble, plan prefixing) happens in the
/// gateway; providers transmit what they are given.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub session_id: String,
    /// Normalized role name, used by the bot provider's role prefix.
    pub role: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Model identifier; fixed for the bot provider.
    pub model: String,
}

/// A provider response.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub provider: ProviderKind,
    /// Set by the chat provider only.
    pub execution_provider: Option<ExecutionProvider>,
    pub latency_ms: u64,
    pub token_count: Option<u32>,
    /// Set by the bot provider only.
    pub activity_id: Option<String>,
    pub timestamp: String,
}

/// Per-token sink for streaming completions.
pub type TokenSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Common surface of both provider adapters.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Streaming variant. Providers without native streaming emulate it
    /// from the final response.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion>;
}

/// Map a reqwest failure onto the retryable error classes.
pub(crate) fn classify_reqwest(err: &reqwest::Error) -> ProviderErrorClass {
    if err.is_timeout() {
        ProviderErrorClass::TimedOut
    } else if err.is_connect() {
        // Connection-refused surfaces as a connect error; keep the finer
        // class when the message makes it unambiguous.
        if err.to_string().contains("refused") {
            ProviderErrorClass::ConnRefused
        } else {
            ProviderErrorClass::Connection
        }
    } else {
        ProviderErrorClass::FetchFailed
    }
}
