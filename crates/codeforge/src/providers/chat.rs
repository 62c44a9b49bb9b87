//! OpenAI-compatible chat-completions provider with primary/fallback
//! failover and SSE streaming.
//!
//! Two endpoints are tried in order: the bearer-authenticated primary
//! (GPU) and the unauthenticated fallback (CPU). A non-2xx status or a
//! transport error from the primary triggers the fallback; if both fail
//! the combined failure surfaces as `AllProvidersFailed`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::errors::{ForgeError, ProviderErrorClass, Result};
use crate::providers::{
    classify_reqwest, Completion, CompletionProvider, CompletionRequest, ExecutionProvider,
    ProviderKind, TokenSink,
};

/// Sampling temperature sent with every request.
const TEMPERATURE: f64 = 0.7;
/// Completion token budget sent with every request.
const MAX_TOKENS: u32 = 8192;
/// Streaming progress is logged at least this often.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a server-sent-event stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Token(String),
    Done,
    Ignore,
}

/// Parse a single SSE line into a token, the `[DONE]` sentinel, or noise.
///
/// Payloads that fail to parse, or parse without a delta, are ignored;
/// the stream routinely carries keep-alives and role-only chunks.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.trim_start().strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .and_then(|d| d.content.clone())
            .map(SseLine::Token)
            .unwrap_or(SseLine::Ignore),
        Err(_) => SseLine::Ignore,
    }
}

struct Endpoint<'a> {
    which: ExecutionProvider,
    url: &'a str,
    api_key: Option<&'a str>,
    timeout: Duration,
}

/// Adapter for the chat-completions service.
pub struct ChatProvider {
    http: reqwest::Client,
    config: ChatConfig,
}

impl ChatProvider {
    pub fn new(config: ChatConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn provider_err(class: ProviderErrorClass, message: impl Into<String>) -> ForgeError {
        ForgeError::Provider {
            provider: "chat",
            class,
            message: message.into(),
        }
    }

    fn endpoints(&self, streaming: bool) -> [Endpoint<'_>; 2] {
        [
            Endpoint {
                which: ExecutionProvider::Primary,
                url: &self.config.primary_url,
                api_key: self.config.primary_key.as_deref(),
                timeout: self.config.primary_timeout,
            },
            Endpoint {
                which: ExecutionProvider::Fallback,
                url: &self.config.fallback_url,
                api_key: None,
                timeout: if streaming {
                    self.config.stream_timeout
                } else {
                    self.config.fallback_timeout
                },
            },
        ]
    }

    fn body(request: &CompletionRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ],
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
            "stream": stream,
        })
    }

    async fn send(
        &self,
        endpoint: &Endpoint<'_>,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", endpoint.url);
        let mut req = self.http.post(&url).timeout(endpoint.timeout).json(body);
        if let Some(key) = endpoint.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| Self::provider_err(classify_reqwest(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::provider_err(
                ProviderErrorClass::Http(status.as_u16()),
                format!("{status}: {}", text.chars().take(300).collect::<String>()),
            ));
        }
        Ok(response)
    }

    async fn complete_on(
        &self,
        endpoint: &Endpoint<'_>,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        let started = Instant::now();
        let response = self.send(endpoint, &Self::body(request, false)).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Self::provider_err(ProviderErrorClass::BadPayload, e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .ok_or_else(|| {
                Self::provider_err(ProviderErrorClass::BadPayload, "response carried no content")
            })?;

        Ok(Completion {
            content,
            model: request.model.clone(),
            provider: ProviderKind::Chat,
            execution_provider: Some(endpoint.which),
            latency_ms: started.elapsed().as_millis() as u64,
            token_count: parsed.usage.and_then(|u| u.total_tokens),
            activity_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }

    async fn stream_on(
        &self,
        endpoint: &Endpoint<'_>,
        request: &CompletionRequest,
        on_token: &mut (dyn FnMut(&str) + Send),
    ) -> Result<Completion> {
        let started = Instant::now();
        let response = self.send(endpoint, &Self::body(request, true)).await?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content = String::new();
        let mut tokens_seen: u32 = 0;
        let mut last_progress = Instant::now();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Self::provider_err(classify_reqwest(&e), e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                match parse_sse_line(&line) {
                    SseLine::Token(token) => {
                        content.push_str(&token);
                        tokens_seen += 1;
                        on_token(&token);
                    }
                    SseLine::Done => break 'outer,
                    SseLine::Ignore => {}
                }
            }

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                info!(
                    endpoint = %endpoint.which,
                    chars = content.len(),
                    chunks = tokens_seen,
                    "chat stream in progress"
                );
                last_progress = Instant::now();
            }
        }

        debug!(
            endpoint = %endpoint.which,
            chars = content.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "chat stream complete"
        );

        Ok(Completion {
            content,
            model: request.model.clone(),
            provider: ProviderKind::Chat,
            execution_provider: Some(endpoint.which),
            latency_ms: started.elapsed().as_millis() as u64,
            token_count: Some(tokens_seen),
            activity_id: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl CompletionProvider for ChatProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Chat
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let [primary, fallback] = self.endpoints(false);

        let primary_err = match self.complete_on(&primary, request).await {
            Ok(completion) => return Ok(completion),
            Err(e) => {
                warn!(error = %e, "primary chat endpoint failed — trying fallback");
                e
            }
        };

        match self.complete_on(&fallback, request).await {
            Ok(completion) => Ok(completion),
            Err(fallback_err) => Err(ForgeError::AllProvidersFailed {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        let [primary, fallback] = self.endpoints(true);

        let mut emitted = false;
        let mut counting_sink = |token: &str| {
            emitted = true;
            on_token(token);
        };

        let primary_err = match self.stream_on(&primary, request, &mut counting_sink).await {
            Ok(completion) => return Ok(completion),
            Err(e) => e,
        };

        // Failing over after tokens reached the caller would duplicate
        // output; only retry on the fallback when nothing was emitted.
        if emitted {
            return Err(primary_err);
        }
        warn!(error = %primary_err, "primary chat stream failed before output — trying fallback");

        match self.stream_on(&fallback, request, on_token).await {
            Ok(completion) => Ok(completion),
            Err(fallback_err) => Err(ForgeError::AllProvidersFailed {
                primary: primary_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }
}
