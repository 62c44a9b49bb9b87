//! Agent gateway: role-based provider routing, adaptive model selection,
//! bounded concurrency, and retry.
//!
//! The gateway is the single entry point for agent invocations. It
//! resolves the provider from the role, composes the final prompt
//! (system preamble plus optional approved-plan prefix), and for the chat
//! provider funnels the call through the bounded FIFO queue with
//! exponential-backoff retry on network failures.

pub mod routing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::{GatewayConfig, ModelCatalog};
use crate::errors::Result;
use crate::prompts;
use crate::providers::{Completion, CompletionProvider, CompletionRequest, ProviderKind};
use crate::queue::{BoundedQueue, QueueStats};
use crate::telemetry::ForgeCounters;
use routing::{detect_intent, provider_for_role, select_model, Complexity};

/// Retry delays applied to retryable chat failures, in order.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(6),
];

/// One agent invocation, as seen by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub session_id: String,
    pub role: String,
    pub prompt: String,
    pub complexity: Complexity,
    /// Plan promoted for this session, prefixed onto execution prompts.
    pub approved_plan: Option<String>,
}

/// Execution roles get the approved plan folded into the user prompt.
fn compose_user_prompt(role: &str, prompt: &str, plan: Option<&str>) -> String {
    let is_execution = matches!(
        role.to_ascii_lowercase().as_str(),
        "builder" | "coder" | "executor"
    );
    match (is_execution, plan) {
        (true, Some(plan)) => format!(
            "APPROVED PLAN:\n{plan}\n\nNow implement this plan fully. \
             Generate all files.\n\nOriginal request: {prompt}"
        ),
        _ => prompt.to_string(),
    }
}

/// Process-wide gateway service.
pub struct AgentGateway {
    bot: Arc<dyn CompletionProvider>,
    chat: Arc<dyn CompletionProvider>,
    models: ModelCatalog,
    chat_queue: BoundedQueue,
}

impl AgentGateway {
    pub fn new(
        bot: Arc<dyn CompletionProvider>,
        chat: Arc<dyn CompletionProvider>,
        models: ModelCatalog,
        config: GatewayConfig,
        counters: Arc<ForgeCounters>,
    ) -> Self {
        Self {
            bot,
            chat,
            models,
            chat_queue: BoundedQueue::new(
                "gateway",
                config.concurrency,
                config.queue_cap,
                config.wait_alert,
                Some(counters),
            ),
        }
    }

    /// Route and execute a single agent invocation.
    pub async fn invoke(&self, request: &GatewayRequest) -> Result<Completion> {
        let provider = provider_for_role(&request.role);
        let system_prompt = prompts::system_prompt_for(&request.role).to_string();
        let user_prompt = compose_user_prompt(
            &request.role,
            &request.prompt,
            request.approved_plan.as_deref(),
        );

        match provider {
            ProviderKind::Bot => {
                // Supervisory calls go straight through; the bot service
                // serializes conversations itself.
                let completion_request = CompletionRequest {
                    session_id: request.session_id.clone(),
                    role: request.role.clone(),
                    system_prompt,
                    user_prompt,
                    model: String::new(),
                };
                self.bot.complete(&completion_request).await
            }
            ProviderKind::Chat => {
                let intent = detect_intent(&request.prompt);
                let depth = self.chat_queue.depth();
                let choice =
                    select_model(&self.models, &request.role, request.complexity, intent, depth);
                info!(
                    session = %request.session_id,
                    role = %request.role,
                    intent = %intent,
                    queue_depth = depth,
                    model = %choice.model,
                    reason = %choice.reason,
                    "routed chat invocation"
                );

                let completion_request = CompletionRequest {
                    session_id: request.session_id.clone(),
                    role: request.role.clone(),
                    system_prompt,
                    user_prompt,
                    model: choice.model,
                };

                let permit = self.chat_queue.acquire().await?;
                debug!(
                    session = %request.session_id,
                    waited_ms = permit.waited.as_millis() as u64,
                    "chat slot acquired"
                );
                let result = self
                    .with_retry(&completion_request, &request.session_id)
                    .await;
                drop(permit);
                result
            }
        }
    }

    /// Streaming variant of [`invoke`](Self::invoke): same routing, same
    /// queue; tokens reach `on_token` as they arrive.
    ///
    /// Chat streams are not wrapped in backoff retry, since replaying a stream
    /// after tokens reached the caller would duplicate output. The chat
    /// provider still fails over to its fallback endpoint before the
    /// first token.
    pub async fn invoke_streaming(
        &self,
        request: &GatewayRequest,
        on_token: crate::providers::TokenSink<'_>,
    ) -> Result<Completion> {
        let provider = provider_for_role(&request.role);
        let system_prompt = prompts::system_prompt_for(&request.role).to_string();
        let user_prompt = compose_user_prompt(
            &request.role,
            &request.prompt,
            request.approved_plan.as_deref(),
        );

        match provider {
            ProviderKind::Bot => {
                let completion_request = CompletionRequest {
                    session_id: request.session_id.clone(),
                    role: request.role.clone(),
                    system_prompt,
                    user_prompt,
                    model: String::new(),
                };
                self.bot
                    .complete_streaming(&completion_request, on_token)
                    .await
            }
            ProviderKind::Chat => {
                let intent = detect_intent(&request.prompt);
                let depth = self.chat_queue.depth();
                let choice =
                    select_model(&self.models, &request.role, request.complexity, intent, depth);
                let completion_request = CompletionRequest {
                    session_id: request.session_id.clone(),
                    role: request.role.clone(),
                    system_prompt,
                    user_prompt,
                    model: choice.model,
                };
                let _permit = self.chat_queue.acquire().await?;
                self.chat
                    .complete_streaming(&completion_request, on_token)
                    .await
            }
        }
    }

    /// Retry retryable chat failures with backoff; everything else
    /// propagates on first occurrence.
    async fn with_retry(
        &self,
        request: &CompletionRequest,
        session_id: &str,
    ) -> Result<Completion> {
        let mut attempt = 0;
        loop {
            match self.chat.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_retryable() && attempt < RETRY_DELAYS.len() => {
                    let delay = RETRY_DELAYS[attempt];
                    attempt += 1;
                    warn!(
                        session = session_id,
                        attempt,
                        delay_s = delay.as_secs(),
                        error = %e,
                        "retryable chat failure — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current pending depth of the chat queue.
    pub fn queue_depth(&self) -> usize {
        self.chat_queue.depth()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.chat_queue.stats()
    }
}

/// A callable agent capability: prompt in, text artifact out.
///
/// The orchestrator holds a trio of these and never assumes streaming.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, prompt: &str, plan: Option<&str>) -> Result<AgentReply>;
}

/// The text artifact an agent returns.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub content: String,
    pub model: Option<String>,
    pub token_count: Option<u32>,
}

/// The planner/builder/fixer trio driving one execution.
#[derive(Clone)]
pub struct AgentSet {
    pub planner: Arc<dyn Agent>,
    pub builder: Arc<dyn Agent>,
    pub fixer: Arc<dyn Agent>,
}

/// Gateway-backed agent bound to a session and role.
pub struct GatewayAgent {
    gateway: Arc<AgentGateway>,
    session_id: String,
    role: &'static str,
    complexity: Complexity,
}

impl GatewayAgent {
    pub fn new(
        gateway: Arc<AgentGateway>,
        session_id: &str,
        role: &'static str,
        complexity: Complexity,
    ) -> Self {
        Self {
            gateway,
            session_id: session_id.to_string(),
            role,
            complexity,
        }
    }
}

#[async_trait]
impl Agent for GatewayAgent {
    async fn invoke(&self, prompt: &str, plan: Option<&str>) -> Result<AgentReply> {
        let request = GatewayRequest {
            session_id: self.session_id.clone(),
            role: self.role.to_string(),
            prompt: prompt.to_string(),
            complexity: self.complexity,
            approved_plan: plan.map(String::from),
        };
        let completion = self.gateway.invoke(&request).await?;
        Ok(AgentReply {
            content: completion.content,
            model: Some(completion.model),
            token_count: completion.token_count,
        })
    }
}

/// Build the standard planner/builder/fixer trio for a session.
pub fn standard_agents(
    gateway: &Arc<AgentGateway>,
    session_id: &str,
    complexity: Complexity,
) -> AgentSet {
    AgentSet {
        planner: Arc::new(GatewayAgent::new(
            gateway.clone(),
            session_id,
            "planner",
            complexity,
        )),
        builder: Arc::new(GatewayAgent::new(
            gateway.clone(),
            session_id,
            "builder",
            complexity,
        )),
        fixer: Arc::new(GatewayAgent::new(
            gateway.clone(),
            session_id,
            "fixer",
            complexity,
        )),
    }
}
