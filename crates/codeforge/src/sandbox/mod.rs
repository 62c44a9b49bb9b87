//! Sandbox subsystem: remote container pool over a secure-shell transport.

pub mod manager;
pub mod testing;
pub mod transport;

pub use manager::{
    CleanupReport, ContainerCounters, ContainerInfo, ContainerStatus, DestroyReport, ExecResult,
    HealthReport, ManagerStatus, ResourceUsage, SandboxManager, Snapshot,
};
pub use testing::ValidationReport;
pub use transport::{RemoteShell, ShellOutput, SshShell};
