//! Environment-driven configuration for the orchestration core.
//!
//! Every knob has a default matching the deployed values; overrides come
//! from the environment. Durations configured in milliseconds carry the
//! `_MS`/`_TIME` suffix convention of the deployment.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{ForgeError, Result};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Sandbox transport and container policy.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Remote host running the container engine.
    pub vps_host: String,
    pub vps_user: String,
    /// Path to the SSH private key (prepared by the deployment).
    pub vps_ssh_key: PathBuf,
    /// Global cap on concurrently running containers.
    pub max_concurrent_containers: usize,
    /// FIFO creation queue bound; requests beyond this fail fast.
    pub creation_queue_cap: usize,
    pub container_cpu_limit: String,
    pub container_memory_limit: String,
    pub container_disk_limit: String,
    /// Hard per-container lifetime.
    pub max_execution_time: Duration,
    /// Reaper sweep interval.
    pub reap_interval: Duration,
    /// Grace added on top of `max_execution_time` before the reaper fires.
    pub reap_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vps_host: env_or("VPS_HOST", "localhost"),
            vps_user: env_or("VPS_USER", "root"),
            vps_ssh_key: PathBuf::from(env_or("VPS_SSH_KEY", "~/.ssh/id_rsa")),
            max_concurrent_containers: env_parse("MAX_CONCURRENT_CONTAINERS", 3),
            creation_queue_cap: env_parse("SANDBOX_QUEUE_CAP", 64),
            container_cpu_limit: env_or("CONTAINER_CPU_LIMIT", "1"),
            container_memory_limit: env_or("CONTAINER_MEMORY_LIMIT", "2g"),
            container_disk_limit: env_or("CONTAINER_DISK_LIMIT", "10g"),
            max_execution_time: Duration::from_millis(env_parse("MAX_EXECUTION_TIME", 900_000)),
            reap_interval: Duration::from_secs(300),
            reap_grace: Duration::from_secs(60),
        }
    }
}

/// Model identifiers used by adaptive routing on the chat provider.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub large: String,
    pub mid: String,
    pub small: String,
    /// Small model pinned for the fixer role.
    pub fixer: String,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            large: env_or("LARGE_MODEL", "qwen2.5-coder-32b-instruct"),
            mid: env_or("MID_MODEL", "qwen2.5-coder-14b-instruct"),
            small: env_or("SMALL_MODEL", "qwen2.5-coder-7b-instruct"),
            fixer: env_or("FIXER_MODEL", "qwen2.5-coder-7b-instruct"),
        }
    }
}

/// Chat-completions provider endpoints.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Primary endpoint (GPU), bearer-authenticated.
    pub primary_url: String,
    pub primary_key: Option<String>,
    /// Fallback endpoint (CPU), no auth.
    pub fallback_url: String,
    /// Primary request timeout.
    pub primary_timeout: Duration,
    /// Fallback non-streaming timeout.
    pub fallback_timeout: Duration,
    /// Streaming timeout (applies to the fallback stream path).
    pub stream_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            primary_url: env_or("CHAT_PRIMARY_URL", "http://localhost:8000"),
            primary_key: std::env::var("CHAT_PRIMARY_KEY").ok(),
            fallback_url: env_or("CHAT_FALLBACK_URL", "http://localhost:8001"),
            primary_timeout: Duration::from_millis(env_parse("CHAT_TIMEOUT", 120_000)),
            fallback_timeout: Duration::from_secs(600),
            stream_timeout: Duration::from_secs(900),
        }
    }
}

/// Polling bot provider endpoint.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub base_url: String,
    pub secret: Option<String>,
    /// Fixed model identifier reported in bot results.
    pub model_id: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: env_or("BOT_API_URL", "http://localhost:3978/directline"),
            secret: std::env::var("BOT_API_SECRET").ok(),
            model_id: env_or("BOT_MODEL_ID", "supervisor-bot"),
        }
    }
}

/// Gateway concurrency policy.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Concurrency cap on in-flight chat-provider invocations.
    pub concurrency: usize,
    /// Bound on the pending queue; requests beyond this fail fast.
    pub queue_cap: usize,
    /// Queue waits above this threshold raise an alert.
    pub wait_alert: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: env_parse("GATEWAY_CONCURRENCY", 2),
            queue_cap: env_parse("GATEWAY_QUEUE_CAP", 64),
            wait_alert: Duration::from_secs(120),
        }
    }
}

/// Orchestrator loop policy.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum Build→Test attempts per execution.
    pub max_iterations: u32,
    /// Wall-clock budget for a whole execution.
    pub max_orchestration_time: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: env_parse("MAX_ITERATIONS", 5),
            max_orchestration_time: Duration::from_millis(env_parse(
                "MAX_ORCHESTRATION_TIME",
                900_000,
            )),
        }
    }
}

/// Session store policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted.
    pub ttl: Duration,
    /// Sweep interval for the eviction task.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Top-level configuration, assembled from the environment.
#[derive(Debug, Clone, Default)]
pub struct ForgeConfig {
    pub sandbox: SandboxConfig,
    pub chat: ChatConfig,
    pub bot: BotConfig,
    pub models: ModelCatalog,
    pub gateway: GatewayConfig,
    pub orchestrator: OrchestratorConfig,
    pub session: SessionConfig,
}

impl ForgeConfig {
    /// Validate fields that have no sane default.
    ///
    /// The sandbox host must be set for any run that touches containers;
    /// provider URLs default to localhost and are allowed through.
    pub fn validate(&self) -> Result<()> {
        if self.sandbox.vps_host.is_empty() {
            return Err(ForgeError::Configuration("VPS_HOST is empty".into()));
        }
        if self.sandbox.max_concurrent_containers == 0 {
            return Err(ForgeError::Configuration(
                "MAX_CONCURRENT_CONTAINERS must be at least 1".into(),
            ));
        }
        if self.gateway.concurrency == 0 {
            return Err(ForgeError::Configuration(
                "GATEWAY_CONCURRENCY must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
