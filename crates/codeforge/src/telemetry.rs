//! Structured telemetry for orchestrator runs.
//!
//! `MetricsCollector` accumulates per-iteration metrics inside a single
//! execution; `ForgeCounters` holds process-wide counters shared by the
//! sandbox manager and gateway. Neither is an exposition format; they
//! feed `details` projections and the terminal event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metrics for a single Build→Test iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub iteration: u32,
    pub builder_model: String,
    pub builder_ms: u64,
    pub test_ms: u64,
    pub files_written: usize,
    pub error_count: usize,
    pub snapshot_created: bool,
    pub fixer_invoked: bool,
}

/// Metrics for a complete execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub session_id: String,
    pub success: bool,
    pub final_state: String,
    pub total_iterations: u32,
    pub elapsed_ms: u64,
    pub iterations: Vec<IterationMetrics>,
    pub timestamp: String,
}

/// In-flight state for the current iteration.
struct IterationBuilder {
    iteration: u32,
    builder_model: String,
    builder_ms: u64,
    test_ms: u64,
    files_written: usize,
    error_count: usize,
    snapshot_created: bool,
    fixer_invoked: bool,
}

/// Accumulates metrics during the orchestration loop.
///
/// Call `start_iteration()` / `finish_iteration()` around each loop body,
/// then `finalize()` at the end to produce the complete `ExecutionMetrics`.
pub struct MetricsCollector {
    session_id: String,
    started: Instant,
    current: Option<IterationBuilder>,
    iterations: Vec<IterationMetrics>,
}

impl MetricsCollector {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            started: Instant::now(),
            current: None,
            iterations: Vec::new(),
        }
    }

    pub fn start_iteration(&mut self, iteration: u32) {
        self.current = Some(IterationBuilder {
            iteration,
            builder_model: String::new(),
            builder_ms: 0,
            test_ms: 0,
            files_written: 0,
            error_count: 0,
            snapshot_created: false,
            fixer_invoked: false,
        });
    }

    pub fn record_builder(&mut self, model: &str, duration: Duration) {
        if let Some(ref mut iter) = self.current {
            iter.builder_model = model.to_string();
            iter.builder_ms = duration.as_millis() as u64;
        }
    }

    pub fn record_test(&mut self, duration: Duration, error_count: usize) {
        if let Some(ref mut iter) = self.current {
            iter.test_ms = duration.as_millis() as u64;
            iter.error_count = error_count;
        }
    }

    pub fn record_files_written(&mut self, count: usize) {
        if let Some(ref mut iter) = self.current {
            iter.files_written = count;
        }
    }

    pub fn record_snapshot(&mut self) {
        if let Some(ref mut iter) = self.current {
            iter.snapshot_created = true;
        }
    }

    pub fn record_fixer(&mut self) {
        if let Some(ref mut iter) = self.current {
            iter.fixer_invoked = true;
        }
    }

    /// Finish the current iteration and store its metrics.
    pub fn finish_iteration(&mut self) {
        if let Some(iter) = self.current.take() {
            self.iterations.push(IterationMetrics {
                iteration: iter.iteration,
                builder_model: iter.builder_model,
                builder_ms: iter.builder_ms,
                test_ms: iter.test_ms,
                files_written: iter.files_written,
                error_count: iter.error_count,
                snapshot_created: iter.snapshot_created,
                fixer_invoked: iter.fixer_invoked,
            });
        }
    }

    /// Finalize and produce the complete execution metrics.
    pub fn finalize(mut self, success: bool, final_state: &str) -> ExecutionMetrics {
        self.finish_iteration();
        ExecutionMetrics {
            session_id: self.session_id,
            success,
            final_state: final_state.to_string(),
            total_iterations: self.iterations.len() as u32,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            iterations: self.iterations,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn iterations(&self) -> &[IterationMetrics] {
        &self.iterations
    }
}

/// Process-wide counters, shared by capability.
#[derive(Debug, Default)]
pub struct ForgeCounters {
    pub containers_created: AtomicU64,
    pub containers_failed: AtomicU64,
    pub containers_reaped: AtomicU64,
    pub gateway_wait_alerts: AtomicU64,
}

impl ForgeCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_failed: self.containers_failed.load(Ordering::Relaxed),
            containers_reaped: self.containers_reaped.load(Ordering::Relaxed),
            gateway_wait_alerts: self.gateway_wait_alerts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the process counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub containers_created: u64,
    pub containers_failed: u64,
    pub containers_reaped: u64,
    pub gateway_wait_alerts: u64,
}
