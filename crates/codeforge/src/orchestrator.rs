//! Orchestration loop: drive a session through sandbox acquisition,
//! planning, and the bounded Build→Test→Fix cycle.
//!
//! One execution per session, one linear task per execution. The loop
//! owns its iteration list, plan, code, and event log exclusively; the
//! sandbox manager owns the container. Cancellation arrives through a
//! token (explicit stop) or the orchestration timer, and both paths end
//! with the sandbox destroyed and a terminal state published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::errors::{ForgeError, Result};
use crate::events::{Event, EventCallback, EventLog, EventType};
use crate::extract::extract_file_blocks;
use crate::gateway::AgentSet;
use crate::sandbox::{SandboxManager, Snapshot};
use crate::state_machine::{ExecutionState, StateMachine, TransitionRecord};
use crate::telemetry::{ExecutionMetrics, MetricsCollector};

/// Builder prompt for iterations after the first.
fn error_augmented_prompt(errors: &[String], original: &str) -> String {
    format!(
        "Previous attempt had errors. Fix them and try again.\n\n\
         Errors:\n{}\n\nOriginal request: {original}",
        errors.join("\n")
    )
}

/// Prompt handed to the fixer between failed iterations.
fn fixer_prompt(errors: &[String], code: &str) -> String {
    format!(
        "The code has errors. Analyze and fix them.\n\n\
         Errors:\n{}\n\nOriginal code:\n{code}",
        errors.join("\n")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationState {
    Pending,
    Success,
    Error,
}

/// One Build→Test attempt. Append-only within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub number: u32,
    pub started_ms: i64,
    pub state: IterationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub builder_model: Option<String>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

/// Options accepted by `start`.
#[derive(Default)]
pub struct ExecutionOptions {
    /// Delivered every event, in generation order, exactly once.
    ///
    /// Runs on the orchestrator task while the execution's state is
    /// locked; it must not call back into the execution's accessors.
    pub on_event: Option<EventCallback>,
}

/// Small read-only status projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub session_id: String,
    pub state: ExecutionState,
    pub current_iteration: u32,
    pub iterations: usize,
    pub error_count: usize,
    pub snapshot_count: usize,
    pub event_count: usize,
    pub duration_ms: u64,
}

/// Full read-only details projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionDetails {
    pub session_id: String,
    pub state: ExecutionState,
    pub prompt: String,
    pub plan: Option<String>,
    pub code: Option<String>,
    pub iterations: Vec<IterationRecord>,
    pub snapshots: Vec<Snapshot>,
    pub errors: Vec<String>,
    pub events: Vec<Event>,
    pub transitions: Vec<TransitionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReport {
    pub ok: bool,
    pub duration_ms: u64,
}

struct ExecutionInner {
    prompt: String,
    machine: StateMachine,
    iterations: Vec<IterationRecord>,
    current_iteration: u32,
    plan: Option<String>,
    code: Option<String>,
    errors: Vec<String>,
    snapshots: Vec<Snapshot>,
    events: EventLog,
    metrics: MetricsCollector,
    final_metrics: Option<ExecutionMetrics>,
}

/// Handle to one in-flight (or finished) execution.
pub struct ExecutionHandle {
    session_id: String,
    inner: Mutex<ExecutionInner>,
    cancel: CancellationToken,
    started: Instant,
    state_tx: watch::Sender<ExecutionState>,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl ExecutionHandle {
    fn new(session_id: &str, prompt: &str, on_event: Option<EventCallback>) -> Self {
        let (state_tx, _) = watch::channel(ExecutionState::Idle);
        Self {
            session_id: session_id.to_string(),
            inner: Mutex::new(ExecutionInner {
                prompt: prompt.to_string(),
                machine: StateMachine::new(),
                iterations: Vec::new(),
                current_iteration: 0,
                plan: None,
                code: None,
                errors: Vec::new(),
                snapshots: Vec::new(),
                events: EventLog::new(on_event),
                metrics: MetricsCollector::new(session_id),
                final_metrics: None,
            }),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            state_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ExecutionState {
        self.inner.lock().unwrap().machine.current()
    }

    /// Subscribe to state changes; used by `Orchestrator::wait`.
    pub fn watch_state(&self) -> watch::Receiver<ExecutionState> {
        self.state_tx.subscribe()
    }

    fn emit(&self, event_type: EventType, data: serde_json::Value) {
        self.inner.lock().unwrap().events.emit(event_type, data);
    }

    /// Advance the state machine and emit the matching `state_change`.
    fn transition(&self, to: ExecutionState, reason: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        let from = inner.machine.current();
        match inner.machine.advance(to, reason) {
            Ok(()) => {
                inner.events.emit(
                    EventType::StateChange,
                    json!({
                        "from": from,
                        "to": to,
                        "reason": reason,
                    }),
                );
                drop(inner);
                self.state_tx.send_replace(to);
            }
            Err(e) => {
                // Guarded transitions make this unreachable from the loop;
                // log instead of panicking if a future edit breaks that.
                error!(session = %self.session_id, error = %e, "illegal transition ignored");
            }
        }
    }

    /// Transition to FAILED, record the error, and emit the terminal event.
    fn fail(&self, message: &str, reason: &str) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.errors.push(message.to_string());
        }
        self.transition(ExecutionState::Failed, Some(reason));
        self.emit(
            EventType::ExecutionFailed,
            json!({ "reason": reason, "error": message }),
        );
    }

    fn begin_iteration(&self, number: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.current_iteration = number;
        inner.machine.set_iteration(number);
        inner.metrics.start_iteration(number);
        inner.iterations.push(IterationRecord {
            number,
            started_ms: chrono::Utc::now().timestamp_millis(),
            state: IterationState::Pending,
            builder_model: None,
            errors: Vec::new(),
            snapshot: None,
        });
    }

    fn last_iteration_errors(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .iterations
            .last()
            .map(|i| i.errors.clone())
            .unwrap_or_default()
    }

    fn finish_iteration(&self, state: IterationState, errors: Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.errors.extend(errors.iter().cloned());
        if let Some(iteration) = inner.iterations.last_mut() {
            iteration.state = state;
            iteration.errors = errors;
        }
        inner.metrics.finish_iteration();
    }

    pub fn status(&self) -> ExecutionStatus {
        let inner = self.inner.lock().unwrap();
        ExecutionStatus {
            session_id: self.session_id.clone(),
            state: inner.machine.current(),
            current_iteration: inner.current_iteration,
            iterations: inner.iterations.len(),
            error_count: inner.errors.len(),
            snapshot_count: inner.snapshots.len(),
            event_count: inner.events.len(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn details(&self) -> ExecutionDetails {
        let inner = self.inner.lock().unwrap();
        ExecutionDetails {
            session_id: self.session_id.clone(),
            state: inner.machine.current(),
            prompt: inner.prompt.clone(),
            plan: inner.plan.clone(),
            code: inner.code.clone(),
            iterations: inner.iterations.clone(),
            snapshots: inner.snapshots.clone(),
            errors: inner.errors.clone(),
            events: inner.events.events().to_vec(),
            transitions: inner.machine.transitions().to_vec(),
            metrics: inner.final_metrics.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Finalize telemetry once, at the terminal state.
    fn seal_metrics(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.final_metrics.is_some() {
            return;
        }
        let state = inner.machine.current();
        let collector = std::mem::replace(&mut inner.metrics, MetricsCollector::new(&self.session_id));
        inner.final_metrics = Some(collector.finalize(
            state == ExecutionState::Success,
            &state.to_string(),
        ));
    }

    fn clear_callback(&self) {
        self.inner.lock().unwrap().events.clear_callback();
    }
}

enum DriveOutcome {
    Finished,
    TimedOut,
    Stopped,
}

/// Process-wide orchestrator service.
pub struct Orchestrator {
    sandbox: Arc<SandboxManager>,
    config: OrchestratorConfig,
    executions: Mutex<HashMap<String, Arc<ExecutionHandle>>>,
    accepting: AtomicBool,
}

impl Orchestrator {
    pub fn new(sandbox: Arc<SandboxManager>, config: OrchestratorConfig) -> Self {
        Self {
            sandbox,
            config,
            executions: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Start the workflow for a session.
    ///
    /// Fails with `AlreadyRunning` while a non-terminal execution exists
    /// for the session; a finished execution is replaced.
    pub fn start(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        agents: AgentSet,
        options: ExecutionOptions,
    ) -> Result<Arc<ExecutionHandle>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ForgeError::Cancelled("orchestrator is shutting down".into()));
        }

        let handle = {
            let mut executions = self.executions.lock().unwrap();
            if let Some(existing) = executions.get(session_id) {
                if !existing.state().is_terminal() {
                    return Err(ForgeError::AlreadyRunning(session_id.to_string()));
                }
            }
            let handle = Arc::new(ExecutionHandle::new(session_id, prompt, options.on_event));
            executions.insert(session_id.to_string(), handle.clone());
            handle
        };

        info!(session = session_id, "execution starting");
        let orchestrator = Arc::clone(self);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            orchestrator.drive(task_handle, agents).await;
        });
        Ok(handle)
    }

    /// Run the workflow under the orchestration timer and the stop token.
    async fn drive(&self, handle: Arc<ExecutionHandle>, agents: AgentSet) {
        let budget = self.config.max_orchestration_time;
        let outcome = tokio::select! {
            _ = handle.cancel.cancelled() => DriveOutcome::Stopped,
            timed = tokio::time::timeout(budget, self.run_workflow(&handle, &agents)) => {
                match timed {
                    Ok(()) => DriveOutcome::Finished,
                    Err(_) => DriveOutcome::TimedOut,
                }
            }
        };

        match outcome {
            DriveOutcome::Finished => {
                let reason = if handle.state() == ExecutionState::Success {
                    "completed"
                } else {
                    "failed"
                };
                let _ = self
                    .sandbox
                    .destroy_container(&handle.session_id, reason)
                    .await;
            }
            DriveOutcome::TimedOut => {
                warn!(session = %handle.session_id, "orchestration timer fired");
                handle.transition(ExecutionState::Timeout, Some("orchestration timeout"));
                handle.emit(
                    EventType::ExecutionTimeout,
                    json!({ "budget_ms": budget.as_millis() as u64 }),
                );
                let _ = self
                    .sandbox
                    .destroy_container(&handle.session_id, "timeout")
                    .await;
            }
            DriveOutcome::Stopped => {
                // `stop` transitioned the state and destroyed the sandbox;
                // nothing left but to fall through to sealing.
            }
        }

        handle.seal_metrics();
        info!(
            session = %handle.session_id,
            state = %handle.state(),
            duration_ms = handle.started.elapsed().as_millis() as u64,
            "execution finished"
        );
    }

    async fn run_workflow(&self, handle: &Arc<ExecutionHandle>, agents: &AgentSet) {
        let session_id = handle.session_id.clone();
        let prompt = handle.inner.lock().unwrap().prompt.clone();

        // Phase 0: sandbox.
        handle.emit(EventType::SandboxCreating, json!({ "session": session_id }));
        let container = match self.sandbox.create_container(&session_id).await {
            Ok(container) => container,
            Err(e) => {
                handle.emit(EventType::SandboxFailed, json!({ "error": e.to_string() }));
                handle.fail(&format!("sandbox creation failed: {e}"), "sandbox_failed");
                return;
            }
        };
        handle.emit(
            EventType::SandboxCreated,
            json!({ "container_id": container.engine_id, "name": container.name }),
        );

        // Phase 1: planning.
        handle.transition(ExecutionState::Planning, Some("start"));
        handle.emit(EventType::PlanningStart, json!({}));
        let plan = match agents.planner.invoke(&prompt, None).await {
            Ok(reply) => reply.content,
            Err(e) => {
                handle.emit(EventType::PlanningFailed, json!({ "error": e.to_string() }));
                handle.fail(&format!("planner failed: {e}"), "planning_failed");
                return;
            }
        };
        {
            let mut inner = handle.inner.lock().unwrap();
            inner.plan = Some(plan.clone());
        }
        handle.emit(EventType::PlanningComplete, json!({ "plan_chars": plan.len() }));

        // Phase 2: the bounded build loop.
        for iteration in 1..=self.config.max_iterations {
            // Errors from the previous attempt drive this one's prompt.
            let previous_errors = handle.last_iteration_errors();
            handle.begin_iteration(iteration);
            let reason = if iteration == 1 {
                "plan produced".to_string()
            } else {
                format!("iteration {iteration}")
            };
            handle.transition(ExecutionState::Building, Some(&reason));
            handle.emit(EventType::BuildingStart, json!({ "iteration": iteration }));

            let builder_prompt = if iteration == 1 {
                prompt.clone()
            } else {
                error_augmented_prompt(&previous_errors, &prompt)
            };

            let build_started = Instant::now();
            let reply = match agents.builder.invoke(&builder_prompt, Some(&plan)).await {
                Ok(reply) => reply,
                Err(e) => {
                    handle.emit(
                        EventType::BuildingFailed,
                        json!({ "iteration": iteration, "error": e.to_string() }),
                    );
                    handle.fail(&format!("builder failed: {e}"), "builder_error");
                    return;
                }
            };
            {
                let mut inner = handle.inner.lock().unwrap();
                inner.code = Some(reply.content.clone());
                let model = reply.model.clone().unwrap_or_default();
                inner.metrics.record_builder(&model, build_started.elapsed());
                if let Some(iter) = inner.iterations.last_mut() {
                    iter.builder_model = reply.model.clone();
                }
            }
            handle.emit(
                EventType::BuildingComplete,
                json!({
                    "iteration": iteration,
                    "chars": reply.content.len(),
                    "model": reply.model,
                }),
            );

            // Materialize extracted files; writes are best-effort.
            let files = extract_file_blocks(&reply.content);
            let mut written = 0;
            for file in &files {
                match self
                    .sandbox
                    .write_file(&session_id, &file.path, &file.content)
                    .await
                {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!(
                            session = %session_id,
                            path = %file.path,
                            error = %e,
                            "file write failed — continuing"
                        );
                    }
                }
            }
            handle
                .inner
                .lock()
                .unwrap()
                .metrics
                .record_files_written(written);

            // Snapshot the workspace after the build.
            match self.sandbox.create_snapshot(&session_id).await {
                Ok(snapshot) => {
                    {
                        let mut inner = handle.inner.lock().unwrap();
                        inner.snapshots.push(snapshot.clone());
                        inner.metrics.record_snapshot();
                        if let Some(iter) = inner.iterations.last_mut() {
                            iter.snapshot = Some(snapshot.clone());
                        }
                    }
                    handle.emit(
                        EventType::SnapshotCreated,
                        json!({ "iteration": iteration, "name": snapshot.name, "image_id": snapshot.image_id }),
                    );
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, "snapshot failed — continuing");
                }
            }

            // Phase 3: validation.
            handle.transition(ExecutionState::Testing, None);
            let install = self
                .sandbox
                .has_package_manifest(&session_id)
                .await
                .unwrap_or(false);
            if install {
                handle.emit(EventType::InstallingDependencies, json!({ "iteration": iteration }));
            }
            let test_started = Instant::now();
            let report = match self.sandbox.run_validation(&session_id, install).await {
                Ok(report) => report,
                Err(e) => {
                    handle.fail(&format!("validation transport failed: {e}"), "transport_error");
                    return;
                }
            };
            handle
                .inner
                .lock()
                .unwrap()
                .metrics
                .record_test(test_started.elapsed(), report.errors.len());

            if report.success {
                handle.finish_iteration(IterationState::Success, Vec::new());
                handle.transition(ExecutionState::Success, Some("validation passed"));
                handle.emit(
                    EventType::ExecutionComplete,
                    json!({
                        "iterations": iteration,
                        "duration_ms": handle.started.elapsed().as_millis() as u64,
                    }),
                );
                return;
            }

            handle.finish_iteration(IterationState::Error, report.errors.clone());
            handle.emit(
                EventType::BuildErrors,
                json!({ "iteration": iteration, "errors": report.errors }),
            );

            if iteration < self.config.max_iterations {
                handle.transition(
                    ExecutionState::Fixing,
                    Some(&format!("{} errors", report.errors.len())),
                );
                handle.emit(EventType::FixingStart, json!({ "iteration": iteration }));

                let code = handle.inner.lock().unwrap().code.clone().unwrap_or_default();
                // The fixer's output primes nothing directly: the next
                // builder prompt carries the test errors, not this text.
                // Invoking it is the observable contract.
                match agents.fixer.invoke(&fixer_prompt(&report.errors, &code), None).await {
                    Ok(_) => {
                        handle.inner.lock().unwrap().metrics.record_fixer();
                        handle.emit(EventType::FixingComplete, json!({ "iteration": iteration }));
                    }
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "fixer failed — continuing loop");
                        handle.emit(
                            EventType::FixingFailed,
                            json!({ "iteration": iteration, "error": e.to_string() }),
                        );
                    }
                }
            } else {
                handle.fail(
                    &format!(
                        "no passing build after {} iterations",
                        self.config.max_iterations
                    ),
                    "max_iterations",
                );
                return;
            }
        }
    }

    fn handle_for(&self, session_id: &str) -> Result<Arc<ExecutionHandle>> {
        self.executions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ForgeError::NotFound(session_id.to_string()))
    }

    /// Read-only status snapshot.
    pub fn status(&self, session_id: &str) -> Result<ExecutionStatus> {
        Ok(self.handle_for(session_id)?.status())
    }

    /// Read-only full projection.
    pub fn details(&self, session_id: &str) -> Result<ExecutionDetails> {
        Ok(self.handle_for(session_id)?.details())
    }

    /// Clean cancellation: cancel the timer and the workflow, destroy the
    /// sandbox, and transition to FAILED.
    pub async fn stop(&self, session_id: &str, reason: &str) -> Result<StopReport> {
        let handle = self.handle_for(session_id)?;
        handle.cancel.cancel();
        if !handle.state().is_terminal() {
            handle.fail(reason, "stopped");
        }
        let _ = self.sandbox.destroy_container(session_id, "stopped").await;
        Ok(StopReport {
            ok: true,
            duration_ms: handle.started.elapsed().as_millis() as u64,
        })
    }

    /// Release every resource tied to a session. Idempotent.
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        let handle = self.executions.lock().unwrap().remove(session_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            handle.clear_callback();
        }
        let _ = self.sandbox.destroy_container(session_id, "cleanup").await;
        Ok(())
    }

    /// Block until the session's execution reaches a terminal state.
    pub async fn wait(&self, session_id: &str) -> Result<ExecutionState> {
        let handle = self.handle_for(session_id)?;
        let mut rx = handle.watch_state();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                return Ok(handle.state());
            }
        }
    }

    /// Stop accepting new executions and tear down all sandboxes.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let sessions: Vec<String> = self.executions.lock().unwrap().keys().cloned().collect();
        for session in &sessions {
            let _ = self.stop(session, "shutdown").await;
        }
        let _ = self.sandbox.cleanup_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_augmented_prompt_shape() {
        let errors = vec![
            "Syntax error in ./index.js: unexpected token".to_string(),
            "npm install failed: E404".to_string(),
        ];
        let prompt = error_augmented_prompt(&errors, "build a todo app");
        assert!(prompt.starts_with("Previous attempt had errors. Fix them and try again."));
        assert!(prompt.contains("Syntax error in ./index.js: unexpected token\nnpm install failed: E404"));
        assert!(prompt.ends_with("Original request: build a todo app"));
    }

    #[test]
    fn test_fixer_prompt_shape() {
        let errors = vec!["Syntax error in ./a.js: x".to_string()];
        let prompt = fixer_prompt(&errors, "const x = ;");
        assert!(prompt.starts_with("The code has errors. Analyze and fix them."));
        assert!(prompt.contains("Errors:\nSyntax error in ./a.js: x"));
        assert!(prompt.ends_with("Original code:\nconst x = ;"));
    }

    #[test]
    fn test_iteration_record_serializes_lowercase_state() {
        let record = IterationRecord {
            number: 1,
            started_ms: 0,
            state: IterationState::Error,
            builder_model: None,
            errors: vec!["e".into()],
            snapshot: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "error");
        assert!(json.get("builder_model").is_none());
    }
}
