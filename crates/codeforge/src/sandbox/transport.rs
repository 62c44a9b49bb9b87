//! Secure-shell transport to the remote container engine.
//!
//! Every engine operation is a single command issued over SSH. The
//! transport knows nothing about containers; it runs a command with a
//! timeout and reports output. Failure categorization lives here so the
//! manager can surface `permission_denied | timeout | ssh_failed |
//! engine_failed` uniformly.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::errors::{ForgeError, Result, TransportErrorKind};

/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Container creation is slower (image pull on first use).
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
/// Snapshot commits copy the container filesystem.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(120);
/// Long install-style commands get this leash when passed explicitly.
pub const LONG_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Raw result of one remote command.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined output, the way callers report it.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// True when stderr carries nothing but warning lines; engines routinely
/// warn on stderr while succeeding, and that noise must not fail the call.
pub fn stderr_is_warnings_only(stderr: &str) -> bool {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .all(|line| line.to_ascii_lowercase().starts_with("warning"))
}

/// Categorize a failed invocation.
pub fn categorize_failure(stderr: &str, exit_code: i32) -> TransportErrorKind {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("permission denied") {
        TransportErrorKind::PermissionDenied
    } else if exit_code == 255 {
        // ssh reserves 255 for its own failures.
        TransportErrorKind::SshFailed
    } else {
        TransportErrorKind::EngineFailed
    }
}

/// The command surface the sandbox manager needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run one remote command. Returns the raw output for any exit code;
    /// errors are reserved for channel failures and timeouts.
    async fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutput>;
}

/// SSH-backed transport to `VPS_USER@VPS_HOST`.
pub struct SshShell {
    host: String,
    user: String,
    key_path: PathBuf,
}

impl SshShell {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            host: config.vps_host.clone(),
            user: config.vps_user.clone(),
            key_path: config.vps_ssh_key.clone(),
        }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ShellOutput> {
        debug!(command, timeout_s = timeout.as_secs(), "ssh invocation");

        let mut child = tokio::process::Command::new("ssh")
            .arg("-i")
            .arg(&self.key_path)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg(format!("{}@{}", self.user, self.host))
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                ForgeError::transport(
                    TransportErrorKind::SshFailed,
                    format!("failed to spawn ssh: {e}"),
                )
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ForgeError::transport(
                    TransportErrorKind::SshFailed,
                    format!("ssh wait failed: {e}"),
                ))
            }
            Err(_) => {
                warn!(command, timeout_s = timeout.as_secs(), "ssh invocation timed out");
                return Err(ForgeError::transport(
                    TransportErrorKind::Timeout,
                    format!("remote command exceeded {}s", timeout.as_secs()),
                ));
            }
        };

        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
