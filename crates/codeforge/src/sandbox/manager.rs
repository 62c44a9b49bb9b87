//! Remote container pool: creation, exec, file I/O, snapshots, lifetimes,
//! and reaping.
//!
//! Containers are hardened at creation (read-only rootfs, dropped
//! capabilities, no network, tmpfs workspaces) and strictly bounded:
//! a global concurrency cap with a FIFO creation queue, a hard per-container
//! lifetime timer, and a background reaper that force-destroys anything
//! that outlives the lifetime plus grace.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::errors::{ForgeError, Result, TransportErrorKind};
use crate::queue::{BoundedQueue, QueuePermit};
use crate::sandbox::transport::{
    categorize_failure, stderr_is_warnings_only, RemoteShell, CREATE_TIMEOUT, DEFAULT_TIMEOUT,
    SNAPSHOT_TIMEOUT,
};
use crate::telemetry::ForgeCounters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Destroyed,
}

/// Per-container operation counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerCounters {
    pub commands_executed: u64,
    pub files_created: u64,
    pub files_read: u64,
    pub errors: u64,
}

struct ContainerRecord {
    engine_id: String,
    session_id: String,
    name: String,
    status: ContainerStatus,
    created_at: Instant,
    created_epoch_ms: i64,
    workdir: String,
    counters: ContainerCounters,
    /// Pool slot; dropping it admits the next queued creation.
    permit: Option<QueuePermit>,
    /// Cancels the armed lifetime timer on destroy.
    lifetime_guard: CancellationToken,
}

/// Read-only projection of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub engine_id: String,
    pub session_id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub created_epoch_ms: i64,
    pub workdir: String,
    pub uptime_secs: u64,
    pub counters: ContainerCounters,
}

impl ContainerRecord {
    fn info(&self) -> ContainerInfo {
        ContainerInfo {
            engine_id: self.engine_id.clone(),
            session_id: self.session_id.clone(),
            name: self.name.clone(),
            status: self.status,
            created_epoch_ms: self.created_epoch_ms,
            workdir: self.workdir.clone(),
            uptime_secs: self.created_at.elapsed().as_secs(),
            counters: self.counters,
        }
    }
}

/// Result of a command run inside a container. Non-zero exit is a result,
/// not an error; errors are reserved for the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
}

/// A committed image of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub image_id: String,
    pub timestamp: String,
}

/// Point-in-time resource readings, parsed best-effort from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: String,
    pub memory: String,
    pub network: String,
    pub disk: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyReport {
    pub destroyed: bool,
    pub lifetime_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStatus {
    pub active: usize,
    pub queued: usize,
    pub max: usize,
    pub containers: Vec<ContainerInfo>,
}

/// Session ids become container names, paths, and labels; keep them to a
/// shell-inert alphabet.
fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty()
        || !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ForgeError::Configuration(format!(
            "invalid session id: {session_id:?}"
        )));
    }
    Ok(())
}

/// Reject absolute paths outside the workspace and any `..` component.
fn validate_workspace_path(path: &str, workdir: &str) -> Result<()> {
    if path.is_empty() {
        return Err(ForgeError::PathTraversal(path.to_string()));
    }
    if path.starts_with('/') && !path.starts_with(workdir) {
        return Err(ForgeError::PathTraversal(path.to_string()));
    }
    if path.split('/').any(|component| component == "..") {
        return Err(ForgeError::PathTraversal(path.to_string()));
    }
    Ok(())
}

/// Process-wide sandbox service.
pub struct SandboxManager {
    shell: Arc<dyn RemoteShell>,
    config: SandboxConfig,
    containers: Mutex<HashMap<String, ContainerRecord>>,
    creation_queue: BoundedQueue,
    counters: Arc<ForgeCounters>,
}

impl SandboxManager {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        config: SandboxConfig,
        counters: Arc<ForgeCounters>,
    ) -> Self {
        let creation_queue = BoundedQueue::new(
            "sandbox",
            config.max_concurrent_containers,
            config.creation_queue_cap,
            // Creation waits are expected under load; alert only on
            // pathological stalls.
            Duration::from_secs(3600),
            None,
        );
        Self {
            shell,
            config,
            containers: Mutex::new(HashMap::new()),
            creation_queue,
            counters,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn quote(value: &str) -> String {
        shlex::try_quote(value)
            .map(|q| q.into_owned())
            .unwrap_or_else(|_| format!("'{value}'"))
    }

    fn container_name(session_id: &str) -> String {
        format!("forge-{session_id}")
    }

    fn workdir(session_id: &str) -> String {
        format!("/workspace/{session_id}")
    }

    /// Create the hardened container for a session, queueing for a pool
    /// slot at the concurrency cap.
    pub async fn create_container(self: &Arc<Self>, session_id: &str) -> Result<ContainerInfo> {
        validate_session_id(session_id)?;

        if self.containers.lock().unwrap().contains_key(session_id) {
            return Err(ForgeError::transport(
                TransportErrorKind::EngineFailed,
                format!("container already exists for session {session_id}"),
            ));
        }

        let permit = self.creation_queue.acquire().await?;
        if permit.waited > Duration::from_millis(50) {
            info!(
                session = session_id,
                waited_ms = permit.waited.as_millis() as u64,
                "container creation dequeued"
            );
        }

        let name = Self::container_name(session_id);
        let workdir = Self::workdir(session_id);
        let created_epoch_ms = chrono::Utc::now().timestamp_millis();

        let command = format!(
            "docker run -d --name {name} \
             --cpus {cpus} --memory {memory} --storage-opt size={disk} \
             --read-only \
             --tmpfs /tmp:rw,noexec,nosuid,size=1g \
             --tmpfs {workdir}:rw,exec,nosuid,size=5g \
             --workdir {workdir} \
             --cap-drop ALL --security-opt no-new-privileges \
             --network none \
             --label session={session_id} --label created={created_epoch_ms} \
             node:20-alpine sleep infinity",
            cpus = self.config.container_cpu_limit,
            memory = self.config.container_memory_limit,
            disk = self.config.container_disk_limit,
        );

        let output = match self.shell.run(&command, CREATE_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                // Creation failure must not consume a pool slot.
                drop(permit);
                self.counters.containers_failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if !output.success() && !stderr_is_warnings_only(&output.stderr) {
            drop(permit);
            self.counters.containers_failed.fetch_add(1, Ordering::Relaxed);
            let kind = categorize_failure(&output.stderr, output.exit_code);
            return Err(ForgeError::transport(
                kind,
                format!("container creation failed: {}", output.stderr.trim()),
            ));
        }

        let engine_id = output.stdout.trim().to_string();
        let lifetime_guard = CancellationToken::new();
        let record = ContainerRecord {
            engine_id,
            session_id: session_id.to_string(),
            name: name.clone(),
            status: ContainerStatus::Running,
            created_at: Instant::now(),
            created_epoch_ms,
            workdir,
            counters: ContainerCounters::default(),
            permit: Some(permit),
            lifetime_guard: lifetime_guard.clone(),
        };
        let projection = record.info();
        self.containers
            .lock()
            .unwrap()
            .insert(session_id.to_string(), record);
        self.counters.containers_created.fetch_add(1, Ordering::Relaxed);
        info!(session = session_id, container = %name, "sandbox container created");

        // Hard lifetime: the container self-destructs at the execution cap
        // unless the guard is cancelled by an earlier destroy.
        let manager = Arc::clone(self);
        let session = session_id.to_string();
        let lifetime = self.config.max_execution_time;
        tokio::spawn(async move {
            tokio::select! {
                _ = lifetime_guard.cancelled() => {}
                _ = tokio::time::sleep(lifetime) => {
                    warn!(session = %session, "container lifetime reached — destroying");
                    let _ = manager.destroy_container(&session, "expired").await;
                }
            }
        });

        Ok(projection)
    }

    /// Look up the running container for a session.
    fn running(&self, session_id: &str) -> Result<(String, String)> {
        let containers = self.containers.lock().unwrap();
        containers
            .get(session_id)
            .filter(|c| c.status == ContainerStatus::Running)
            .map(|c| (c.name.clone(), c.workdir.clone()))
            .ok_or_else(|| ForgeError::NotFound(session_id.to_string()))
    }

    fn bump<F: FnOnce(&mut ContainerCounters)>(&self, session_id: &str, f: F) {
        if let Some(record) = self.containers.lock().unwrap().get_mut(session_id) {
            f(&mut record.counters);
        }
    }

    /// Run a command inside the container's workdir.
    ///
    /// Never raises for non-zero exit; only transport failures are errors.
    pub async fn exec_in_container(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecResult> {
        let (name, _workdir) = self.running(session_id)?;
        let remote = format!("docker exec {name} sh -c {}", Self::quote(command));

        let output = match self
            .shell
            .run(&remote, timeout.unwrap_or(DEFAULT_TIMEOUT))
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.bump(session_id, |c| c.errors += 1);
                return Err(e);
            }
        };

        self.bump(session_id, |c| c.commands_executed += 1);
        Ok(ExecResult {
            success: output.success(),
            output: output.combined(),
            exit_code: output.exit_code,
        })
    }

    /// Write a file into the workspace.
    ///
    /// Content is base64-encoded host-side and decoded in-container, so
    /// arbitrary bytes survive the shell unharmed.
    pub async fn write_file(&self, session_id: &str, path: &str, content: &str) -> Result<()> {
        let (name, workdir) = self.running(session_id)?;
        validate_workspace_path(path, &workdir)?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(content.as_bytes());
        let quoted_path = Self::quote(path);
        let parent = std::path::Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let script = format!(
            "mkdir -p {parent} && printf %s {encoded} | base64 -d > {quoted_path}",
            parent = Self::quote(&parent),
        );
        let remote = format!("docker exec {name} sh -c {}", Self::quote(&script));

        let output = match self.shell.run(&remote, DEFAULT_TIMEOUT).await {
            Ok(output) => output,
            Err(e) => {
                self.bump(session_id, |c| c.errors += 1);
                return Err(e);
            }
        };

        if !output.success() && !stderr_is_warnings_only(&output.stderr) {
            self.bump(session_id, |c| c.errors += 1);
            return Err(ForgeError::transport(
                TransportErrorKind::EngineFailed,
                format!("write {path} failed: {}", output.combined().trim()),
            ));
        }

        self.bump(session_id, |c| c.files_created += 1);
        debug!(session = session_id, path, bytes = content.len(), "wrote file");
        Ok(())
    }

    /// Read a workspace file's content.
    pub async fn read_file(&self, session_id: &str, path: &str) -> Result<String> {
        let (name, workdir) = self.running(session_id)?;
        validate_workspace_path(path, &workdir)?;

        let remote = format!(
            "docker exec {name} sh -c {}",
            Self::quote(&format!("cat {}", Self::quote(path)))
        );
        let output = self.shell.run(&remote, DEFAULT_TIMEOUT).await?;
        if !output.success() {
            self.bump(session_id, |c| c.errors += 1);
            return Err(ForgeError::transport(
                TransportErrorKind::EngineFailed,
                format!("read {path} failed: {}", output.stderr.trim()),
            ));
        }

        self.bump(session_id, |c| c.files_read += 1);
        Ok(output.stdout)
    }

    /// List directory entries under the workspace.
    pub async fn list_files(&self, session_id: &str, dir: &str) -> Result<Vec<String>> {
        let (name, workdir) = self.running(session_id)?;
        validate_workspace_path(dir, &workdir)?;

        let remote = format!(
            "docker exec {name} sh -c {}",
            Self::quote(&format!("ls -1 {}", Self::quote(dir)))
        );
        let output = self.shell.run(&remote, DEFAULT_TIMEOUT).await?;
        if !output.success() {
            return Err(ForgeError::transport(
                TransportErrorKind::EngineFailed,
                format!("list {dir} failed: {}", output.stderr.trim()),
            ));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Commit the container to an image, unique per timestamp.
    pub async fn create_snapshot(&self, session_id: &str) -> Result<Snapshot> {
        let (name, _) = self.running(session_id)?;
        let stamp = chrono::Utc::now();
        let snapshot_name = format!("forge-snapshot-{session_id}-{}", stamp.timestamp_millis());

        let remote = format!("docker commit {name} {snapshot_name}");
        let output = self.shell.run(&remote, SNAPSHOT_TIMEOUT).await?;
        if !output.success() && !stderr_is_warnings_only(&output.stderr) {
            self.bump(session_id, |c| c.errors += 1);
            return Err(ForgeError::transport(
                categorize_failure(&output.stderr, output.exit_code),
                format!("snapshot failed: {}", output.stderr.trim()),
            ));
        }

        info!(session = session_id, snapshot = %snapshot_name, "snapshot committed");
        Ok(Snapshot {
            name: snapshot_name,
            image_id: output.stdout.trim().to_string(),
            timestamp: stamp.to_rfc3339(),
        })
    }

    /// Best-effort resource readings from the engine.
    pub async fn get_resource_usage(&self, session_id: &str) -> Result<ResourceUsage> {
        let (name, _) = self.running(session_id)?;
        let uptime_secs = self
            .containers
            .lock()
            .unwrap()
            .get(session_id)
            .map(|c| c.created_at.elapsed().as_secs())
            .unwrap_or(0);

        let remote = format!("docker stats --no-stream --format '{{{{json .}}}}' {name}");
        let output = self.shell.run(&remote, DEFAULT_TIMEOUT).await?;

        let mut usage = ResourceUsage {
            uptime_secs,
            ..Default::default()
        };
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(output.stdout.trim()) {
            usage.cpu = value["CPUPerc"].as_str().unwrap_or_default().to_string();
            usage.memory = value["MemUsage"].as_str().unwrap_or_default().to_string();
            usage.network = value["NetIO"].as_str().unwrap_or_default().to_string();
            usage.disk = value["BlockIO"].as_str().unwrap_or_default().to_string();
        }
        Ok(usage)
    }

    /// Destroy the container for a session. Idempotent: destroying an
    /// unknown or already-destroyed container is a quiet no-op.
    ///
    /// Releasing the pool slot admits the next queued creation.
    pub async fn destroy_container(&self, session_id: &str, reason: &str) -> Result<DestroyReport> {
        let record = self.containers.lock().unwrap().remove(session_id);
        let Some(mut record) = record else {
            debug!(session = session_id, reason, "destroy: no container — no-op");
            return Ok(DestroyReport {
                destroyed: false,
                lifetime_ms: 0,
            });
        };

        record.lifetime_guard.cancel();
        let lifetime_ms = record.created_at.elapsed().as_millis() as u64;

        let remote = format!("docker rm -f {}", record.name);
        match self.shell.run(&remote, DEFAULT_TIMEOUT).await {
            Ok(output) if output.success() || stderr_is_warnings_only(&output.stderr) => {}
            Ok(output) => {
                warn!(
                    session = session_id,
                    stderr = %output.stderr.trim(),
                    "engine rm reported an error — slot released anyway"
                );
            }
            Err(e) => {
                warn!(session = session_id, error = %e, "engine rm failed — slot released anyway");
            }
        }

        // Slot handover: the next queued creation proceeds as this drops.
        drop(record.permit.take());

        info!(
            session = session_id,
            reason,
            lifetime_ms,
            "sandbox container destroyed"
        );
        Ok(DestroyReport {
            destroyed: true,
            lifetime_ms,
        })
    }

    /// Destroy every running container.
    pub async fn cleanup_all(&self) -> Result<CleanupReport> {
        let sessions: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        let total = sessions.len();
        let mut ok = 0;
        let mut failed = 0;
        for session in sessions {
            match self.destroy_container(&session, "cleanup").await {
                Ok(_) => ok += 1,
                Err(_) => failed += 1,
            }
        }
        info!(total, ok, failed, "sandbox cleanup complete");
        Ok(CleanupReport { total, ok, failed })
    }

    /// Probe the engine over the transport.
    pub async fn health_check(&self) -> HealthReport {
        let remote = "docker version --format '{{.Server.Version}}'";
        match self.shell.run(remote, Duration::from_secs(10)).await {
            Ok(output) if output.success() => HealthReport {
                healthy: true,
                engine_version: Some(output.stdout.trim().to_string()),
                error: None,
            },
            Ok(output) => HealthReport {
                healthy: false,
                engine_version: None,
                error: Some(output.stderr.trim().to_string()),
            },
            Err(e) => HealthReport {
                healthy: false,
                engine_version: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn status(&self) -> ManagerStatus {
        let containers = self.containers.lock().unwrap();
        ManagerStatus {
            active: containers.len(),
            queued: self.creation_queue.depth(),
            max: self.config.max_concurrent_containers,
            containers: containers.values().map(ContainerRecord::info).collect(),
        }
    }

    /// Sessions whose containers have outlived the lifetime plus grace.
    fn stale_sessions(&self) -> Vec<String> {
        let deadline = self.config.max_execution_time + self.config.reap_grace;
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.created_at.elapsed() > deadline)
            .map(|c| c.session_id.clone())
            .collect()
    }

    /// Spawn the background reaper. Runs until the process exits.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for session in manager.stale_sessions() {
                    warn!(session = %session, "reaping stale container");
                    if manager.destroy_container(&session, "stale").await.is_ok() {
                        manager
                            .counters
                            .containers_reaped
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::transport::{MockRemoteShell, ShellOutput};

    fn ok_output(stdout: &str) -> ShellOutput {
        ShellOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn manager_with(shell: MockRemoteShell) -> Arc<SandboxManager> {
        let config = SandboxConfig {
            vps_host: "test-host".into(),
            vps_user: "test".into(),
            vps_ssh_key: "/tmp/key".into(),
            max_concurrent_containers: 2,
            creation_queue_cap: 4,
            container_cpu_limit: "1".into(),
            container_memory_limit: "2g".into(),
            container_disk_limit: "10g".into(),
            max_execution_time: Duration::from_secs(900),
            reap_interval: Duration::from_secs(300),
            reap_grace: Duration::from_secs(60),
        };
        Arc::new(SandboxManager::new(
            Arc::new(shell),
            config,
            Arc::new(ForgeCounters::default()),
        ))
    }

    #[test]
    fn test_validate_workspace_path() {
        let workdir = "/workspace/s1";
        assert!(validate_workspace_path("index.js", workdir).is_ok());
        assert!(validate_workspace_path("src/app.js", workdir).is_ok());
        assert!(validate_workspace_path("/workspace/s1/index.js", workdir).is_ok());
        assert!(validate_workspace_path("../escape.js", workdir).is_err());
        assert!(validate_workspace_path("src/../../etc/passwd", workdir).is_err());
        assert!(validate_workspace_path("/etc/passwd", workdir).is_err());
        assert!(validate_workspace_path("", workdir).is_err());
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("user-42_a.b").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("s1; rm -rf /").is_err());
        assert!(validate_session_id("a b").is_err());
    }

    #[tokio::test]
    async fn test_create_container_composes_hardened_command() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, timeout: &Duration| {
                cmd.starts_with("docker run -d --name forge-s1")
                    && cmd.contains("--cpus 1")
                    && cmd.contains("--memory 2g")
                    && cmd.contains("--storage-opt size=10g")
                    && cmd.contains("--read-only")
                    && cmd.contains("--tmpfs /tmp:rw,noexec,nosuid,size=1g")
                    && cmd.contains("--tmpfs /workspace/s1:rw,exec,nosuid,size=5g")
                    && cmd.contains("--workdir /workspace/s1")
                    && cmd.contains("--cap-drop ALL")
                    && cmd.contains("--security-opt no-new-privileges")
                    && cmd.contains("--network none")
                    && cmd.contains("--label session=s1")
                    && cmd.contains("node:20-alpine sleep infinity")
                    && *timeout == CREATE_TIMEOUT
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("abc123\n")));

        let manager = manager_with(shell);
        let info = manager.create_container("s1").await.unwrap();
        assert_eq!(info.engine_id, "abc123");
        assert_eq!(info.name, "forge-s1");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(manager.status().active, 1);
        assert_eq!(manager.counters.snapshot().containers_created, 1);
    }

    #[tokio::test]
    async fn test_create_failure_releases_slot_and_counts() {
        let mut shell = MockRemoteShell::new();
        shell.expect_run().times(1).returning(|_, _| {
            Ok(ShellOutput {
                stdout: String::new(),
                stderr: "docker: permission denied while trying to connect".into(),
                exit_code: 126,
            })
        });

        let manager = manager_with(shell);
        let err = manager.create_container("s1").await.unwrap_err();
        assert!(matches!(
            err,
            ForgeError::Transport {
                kind: TransportErrorKind::PermissionDenied,
                ..
            }
        ));
        assert_eq!(manager.status().active, 0);
        assert_eq!(manager.status().queued, 0);
        assert_eq!(manager.counters.snapshot().containers_failed, 1);
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_is_a_result_not_an_error() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker exec forge-s1 sh -c"))
            .times(1)
            .returning(|_, _| {
                Ok(ShellOutput {
                    stdout: String::new(),
                    stderr: "SyntaxError: Unexpected token".into(),
                    exit_code: 1,
                })
            });

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        let result = manager
            .exec_in_container("s1", "node --check index.js", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_write_file_encodes_base64_and_counts() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| {
                // The payload must be base64, not raw content.
                cmd.contains("base64 -d") && !cmd.contains("const x") && cmd.contains("mkdir -p")
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        manager
            .write_file("s1", "src/index.js", "const x = 1;\n")
            .await
            .unwrap();

        let status = manager.status();
        assert_eq!(status.containers[0].counters.files_created, 1);
    }

    #[tokio::test]
    async fn test_write_file_rejects_traversal_without_touching_transport() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        let err = manager
            .write_file("s1", "../../etc/cron.d/evil", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PathTraversal(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker rm -f forge-s1"))
            .times(1)
            .returning(|_, _| Ok(ok_output("forge-s1\n")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();

        let first = manager.destroy_container("s1", "completed").await.unwrap();
        assert!(first.destroyed);
        let second = manager.destroy_container("s1", "completed").await.unwrap();
        assert!(!second.destroyed);
        assert_eq!(manager.status().active, 0);
    }

    #[tokio::test]
    async fn test_exec_on_unknown_session_is_not_found() {
        let manager = manager_with(MockRemoteShell::new());
        let err = manager
            .exec_in_container("ghost", "ls", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrency_cap_queues_third_creation() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker rm"))
            .returning(|_, _| Ok(ok_output("")));

        let manager = manager_with(shell);
        manager.create_container("a").await.unwrap();
        manager.create_container("b").await.unwrap();

        // Third creation must block until a slot frees.
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_container("c").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(manager.status().queued, 1);

        manager.destroy_container("a", "completed").await.unwrap();
        let created = waiter.await.unwrap().unwrap();
        assert_eq!(created.session_id, "c");
        assert_eq!(manager.status().active, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_timer_destroys_container() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker rm"))
            .times(1)
            .returning(|_, _| Ok(ok_output("")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        assert_eq!(manager.status().active, 1);

        // Let the spawned lifetime task register its sleep against the
        // current clock before we advance past it.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(901)).await;
        // Let the lifetime task run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(manager.status().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_destroys_overdue_containers() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker rm"))
            .returning(|_, _| Ok(ok_output("")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();

        // Disarm the per-container timer so the reaper does the work.
        manager
            .containers
            .lock()
            .unwrap()
            .get("s1")
            .unwrap()
            .lifetime_guard
            .cancel();

        let _reaper = manager.spawn_reaper();
        tokio::time::advance(Duration::from_secs(961)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(300)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(manager.status().active, 0);
        assert_eq!(manager.counters.snapshot().containers_reaped, 1);
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker rm"))
            .returning(|_, _| Ok(ok_output("")));

        let manager = manager_with(shell);
        manager.create_container("a").await.unwrap();
        manager.create_container("b").await.unwrap();

        let report = manager.cleanup_all().await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.ok, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(manager.status().active, 0);
    }

    #[tokio::test]
    async fn test_read_and_list_round_trip_counters() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.contains("cat"))
            .times(1)
            .returning(|_, _| Ok(ok_output("const x = 1;\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.contains("ls -1"))
            .times(1)
            .returning(|_, _| Ok(ok_output("index.js\npackage.json\n")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();

        let content = manager.read_file("s1", "index.js").await.unwrap();
        assert_eq!(content, "const x = 1;\n");

        let listing = manager.list_files("s1", ".").await.unwrap();
        assert_eq!(listing, vec!["index.js", "package.json"]);

        let counters = manager.status().containers[0].counters;
        assert_eq!(counters.files_read, 1);
    }

    #[tokio::test]
    async fn test_resource_usage_parses_engine_stats() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker stats"))
            .times(1)
            .returning(|_, _| {
                Ok(ok_output(
                    r#"{"CPUPerc":"0.42%","MemUsage":"24MiB / 2GiB","NetIO":"0B / 0B","BlockIO":"12kB / 0B"}"#,
                ))
            });

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        let usage = manager.get_resource_usage("s1").await.unwrap();
        assert_eq!(usage.cpu, "0.42%");
        assert_eq!(usage.memory, "24MiB / 2GiB");
        assert_eq!(usage.disk, "12kB / 0B");
    }

    #[tokio::test]
    async fn test_snapshot_name_carries_session_and_timestamp() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker run"))
            .times(1)
            .returning(|_, _| Ok(ok_output("id\n")));
        shell
            .expect_run()
            .withf(|cmd: &str, timeout: &Duration| {
                cmd.starts_with("docker commit forge-s1 forge-snapshot-s1-")
                    && *timeout == SNAPSHOT_TIMEOUT
            })
            .times(1)
            .returning(|_, _| Ok(ok_output("sha256:abc123\n")));

        let manager = manager_with(shell);
        manager.create_container("s1").await.unwrap();
        let snapshot = manager.create_snapshot("s1").await.unwrap();
        assert!(snapshot.name.starts_with("forge-snapshot-s1-"));
        assert_eq!(snapshot.image_id, "sha256:abc123");
        assert!(!snapshot.timestamp.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_reports_engine_version() {
        let mut shell = MockRemoteShell::new();
        shell
            .expect_run()
            .withf(|cmd: &str, _| cmd.starts_with("docker version"))
            .times(1)
            .returning(|_, _| Ok(ok_output("24.0.7\n")));

        let manager = manager_with(shell);
        let health = manager.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.engine_version.as_deref(), Some("24.0.7"));
    }
}
