//! CLI entry point: run one orchestrated build, probe sandbox health, or
//! dump pool status.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use codeforge::config::ForgeConfig;
use codeforge::events::EventCallback;
use codeforge::gateway::routing::Complexity;
use codeforge::gateway::{standard_agents, AgentGateway};
use codeforge::orchestrator::{ExecutionOptions, Orchestrator};
use codeforge::providers::{bot::BotProvider, chat::ChatProvider};
use codeforge::sandbox::{SandboxManager, SshShell};
use codeforge::session::{MessageRole, SessionStore};
use codeforge::telemetry::ForgeCounters;

#[derive(Parser)]
#[command(name = "codeforge", about = "Autonomous multi-agent code-generation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one build request end-to-end, printing events as they arrive.
    Run {
        /// Session identifier (container names and workspaces derive from it).
        #[arg(long)]
        session: String,
        /// The natural-language build request.
        #[arg(long)]
        prompt: String,
        /// Declared complexity: simple | medium | complex.
        #[arg(long, default_value = "medium")]
        complexity: String,
    },
    /// Probe the remote container engine.
    Health,
    /// Show sandbox pool status.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ForgeConfig::default();
    config.validate().context("invalid configuration")?;

    let counters = Arc::new(ForgeCounters::default());
    let shell = Arc::new(SshShell::new(&config.sandbox));
    let sandbox = Arc::new(SandboxManager::new(
        shell,
        config.sandbox.clone(),
        counters.clone(),
    ));

    match cli.command {
        Command::Health => {
            let health = sandbox.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            return Ok(());
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&sandbox.status())?);
            return Ok(());
        }
        Command::Run {
            session,
            prompt,
            complexity,
        } => {
            info!(
                host = %config.sandbox.vps_host,
                max_containers = config.sandbox.max_concurrent_containers,
                "orchestrator starting"
            );
            let _reaper = sandbox.spawn_reaper();

            let sessions = Arc::new(SessionStore::new(config.session.clone()));
            let _sweeper = sessions.spawn_sweeper();
            sessions.append(&session, MessageRole::User, prompt.clone());

            let bot = Arc::new(BotProvider::new(config.bot.clone()));
            let chat = Arc::new(ChatProvider::new(config.chat.clone()));
            let gateway = Arc::new(AgentGateway::new(
                bot,
                chat,
                config.models.clone(),
                config.gateway.clone(),
                counters.clone(),
            ));

            let orchestrator = Arc::new(Orchestrator::new(
                sandbox.clone(),
                config.orchestrator.clone(),
            ));

            let agents = standard_agents(&gateway, &session, Complexity::parse(&complexity));
            let on_event: EventCallback = Arc::new(|event| {
                println!(
                    "{}",
                    serde_json::to_string(event).unwrap_or_else(|_| event.event_type.to_string())
                );
            });

            orchestrator.start(
                &session,
                &prompt,
                agents,
                ExecutionOptions {
                    on_event: Some(on_event),
                },
            )?;

            // Wait for the terminal state, honoring ctrl-c with a clean stop.
            let state = tokio::select! {
                state = orchestrator.wait(&session) => state?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupt received — stopping execution");
                    let _ = orchestrator.stop(&session, "operator interrupt").await;
                    orchestrator.shutdown().await;
                    orchestrator.wait(&session).await?
                }
            };

            let details = orchestrator.details(&session)?;
            if let Some(plan) = &details.plan {
                sessions.set_approved_plan(&session, plan.clone());
            }
            if let Some(code) = &details.code {
                sessions.append(&session, MessageRole::Assistant, code.clone());
            }
            println!("{}", serde_json::to_string_pretty(&details)?);

            info!(state = %state, "run complete");
            orchestrator.cleanup(&session).await?;
        }
    }

    Ok(())
}
