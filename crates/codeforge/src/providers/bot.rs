//! Polling conversational bot provider.
//!
//! Stateful request/poll model: each session maps to a remote conversation
//! that is reused for up to 25 minutes. A message is posted as a user
//! activity, then the activities endpoint is polled with a watermark
//! cursor until the service replies or the poll window closes.
//!
//! The service does not stream; `complete_streaming` replays the final
//! response word-by-word.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BotConfig;
use crate::errors::{ForgeError, ProviderErrorClass, Result};
use crate::providers::{
    classify_reqwest, Completion, CompletionProvider, CompletionRequest, ProviderKind, TokenSink,
};

/// Constant user identity for activities we post.
const USER_ID: &str = "forge-orchestrator";
/// Delay between polls of the activities endpoint.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long to poll before giving up on a reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);
/// Conversations older than this are abandoned and recreated.
const CONVERSATION_TTL: Duration = Duration::from_secs(25 * 60);
/// Inter-word delay for the pseudo-streaming shim.
const WORD_DELAY: Duration = Duration::from_millis(15);

#[derive(Debug, Deserialize)]
struct ConversationCreated {
    #[serde(rename = "conversationId")]
    conversation_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    watermark: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Activity {
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub from: ActivityFrom,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ActivityFrom {
    #[serde(default)]
    pub id: Option<String>,
}

/// The last message activity not authored by us, if any.
pub(crate) fn pick_reply(activities: &[Activity]) -> Option<&Activity> {
    activities
        .iter()
        .rev()
        .find(|a| a.activity_type == "message" && a.from.id.as_deref() != Some(USER_ID))
}

struct CachedConversation {
    id: String,
    watermark: Option<String>,
    created_at: Instant,
}

/// Adapter for the polling bot service.
pub struct BotProvider {
    http: reqwest::Client,
    config: BotConfig,
    conversations: Mutex<HashMap<String, CachedConversation>>,
}

impl BotProvider {
    pub fn new(config: BotConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn provider_err(class: ProviderErrorClass, message: impl Into<String>) -> ForgeError {
        ForgeError::Provider {
            provider: "bot",
            class,
            message: message.into(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.secret {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }

    /// Reuse the session's conversation while it is fresh, else create one.
    async fn conversation_for(&self, session_id: &str) -> Result<(String, Option<String>)> {
        {
            let conversations = self.conversations.lock().unwrap();
            if let Some(cached) = conversations.get(session_id) {
                if cached.created_at.elapsed() < CONVERSATION_TTL {
                    return Ok((cached.id.clone(), cached.watermark.clone()));
                }
            }
        }

        let url = format!("{}/conversations", self.config.base_url);
        let response = self
            .auth(self.http.post(&url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::provider_err(classify_reqwest(&e), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::provider_err(
                ProviderErrorClass::Http(response.status().as_u16()),
                format!("conversation create returned {}", response.status()),
            ));
        }

        let created: ConversationCreated = response
            .json()
            .await
            .map_err(|e| Self::provider_err(ProviderErrorClass::BadPayload, e.to_string()))?;

        debug!(session = session_id, conversation = %created.conversation_id, "created bot conversation");

        let mut conversations = self.conversations.lock().unwrap();
        conversations.insert(
            session_id.to_string(),
            CachedConversation {
                id: created.conversation_id.clone(),
                watermark: None,
                created_at: Instant::now(),
            },
        );
        Ok((created.conversation_id, None))
    }

    fn store_watermark(&self, session_id: &str, watermark: Option<String>) {
        if let Some(cached) = self.conversations.lock().unwrap().get_mut(session_id) {
            cached.watermark = watermark;
        }
    }

    async fn post_activity(&self, conversation_id: &str, text: &str) -> Result<()> {
        let url = format!(
            "{}/conversations/{}/activities",
            self.config.base_url, conversation_id
        );
        let body = serde_json::json!({
            "type": "message",
            "from": { "id": USER_ID },
            "text": text,
        });
        let response = self
            .auth(self.http.post(&url))
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::provider_err(classify_reqwest(&e), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::provider_err(
                ProviderErrorClass::Http(response.status().as_u16()),
                format!("activity post returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn poll_activities(
        &self,
        conversation_id: &str,
        watermark: Option<&str>,
    ) -> Result<ActivitySet> {
        let mut url = format!(
            "{}/conversations/{}/activities",
            self.config.base_url, conversation_id
        );
        if let Some(w) = watermark {
            url.push_str(&format!("?watermark={w}"));
        }
        let response = self
            .auth(self.http.get(&url))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Self::provider_err(classify_reqwest(&e), e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::provider_err(
                ProviderErrorClass::Http(response.status().as_u16()),
                format!("activity poll returned {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Self::provider_err(ProviderErrorClass::BadPayload, e.to_string()))
    }
}

#[async_trait]
impl CompletionProvider for BotProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bot
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let started = std::time::Instant::now();
        let (conversation_id, mut watermark) = self.conversation_for(&request.session_id).await?;

        let text = format!(
            "[Agent Role: {}]\n\n{}",
            request.role.to_uppercase(),
            request.user_prompt
        );
        self.post_activity(&conversation_id, &text).await?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            let set = self
                .poll_activities(&conversation_id, watermark.as_deref())
                .await?;
            if set.watermark.is_some() {
                watermark = set.watermark.clone();
                self.store_watermark(&request.session_id, set.watermark.clone());
            }

            if let Some(reply) = pick_reply(&set.activities) {
                let content = reply.text.clone().unwrap_or_default();
                return Ok(Completion {
                    content,
                    model: self.config.model_id.clone(),
                    provider: ProviderKind::Bot,
                    execution_provider: None,
                    latency_ms: started.elapsed().as_millis() as u64,
                    token_count: None,
                    activity_id: reply.id.clone(),
                    timestamp: reply
                        .timestamp
                        .clone()
                        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                });
            }

            if Instant::now() >= deadline {
                warn!(
                    session = %request.session_id,
                    conversation = %conversation_id,
                    "bot reply window closed without a response"
                );
                return Err(Self::provider_err(
                    ProviderErrorClass::Timeout,
                    format!("no bot reply within {}s", REPLY_TIMEOUT.as_secs()),
                ));
            }
        }
    }

    /// The bot service has no streaming endpoint; replay the final
    /// response word-by-word so streaming callers see steady progress.
    async fn complete_streaming(
        &self,
        request: &CompletionRequest,
        on_token: TokenSink<'_>,
    ) -> Result<Completion> {
        let completion = self.complete(request).await?;
        for word in completion.content.split_whitespace() {
            on_token(word);
            on_token(" ");
            tokio::time::sleep(WORD_DELAY).await;
        }
        Ok(completion)
    }
}
