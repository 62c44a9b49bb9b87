//! Execution state machine: explicit states and legal transition guards.
//!
//! The orchestrator loop calls `advance()` to move between states. Each call
//! validates that the transition is legal and records it in the transition
//! log, so a completed execution's exact path is auditable from `details`.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of execution states.
///
/// Every execution starts at `Idle` and terminates at `Success`, `Failed`,
/// or `Timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created but not yet planning.
    Idle,
    /// Invoking the planner agent.
    Planning,
    /// Invoking the builder agent and materializing its output.
    Building,
    /// Running static validation inside the sandbox.
    Testing,
    /// Invoking the fixer agent between failed iterations.
    Fixing,
    /// Validation passed; terminal.
    Success,
    /// Planner error, max iterations, or manual stop; terminal.
    Failed,
    /// Orchestration timer fired; terminal.
    Timeout,
}

impl ExecutionState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Planning => write!(f, "PLANNING"),
            Self::Building => write!(f, "BUILDING"),
            Self::Testing => write!(f, "TESTING"),
            Self::Fixing => write!(f, "FIXING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Legal transitions between execution states.
///
/// ```text
/// Idle     → Planning
/// Planning → Building | Failed
/// Building → Testing | Success | Fixing | Failed
/// Testing  → Success | Fixing | Failed
/// Fixing   → Building
/// any non-terminal → Failed | Timeout
/// ```
fn is_legal_transition(from: ExecutionState, to: ExecutionState) -> bool {
    use ExecutionState::*;

    // Any non-terminal state can fail or time out.
    if (to == Failed || to == Timeout) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Idle, Planning)
            | (Planning, Building)
            // Builder output goes straight to validation; Success/Fixing are
            // reachable directly when validation is folded into the phase.
            | (Building, Testing)
            | (Building, Success)
            | (Building, Fixing)
            | (Testing, Success)
            | (Testing, Fixing)
            | (Fixing, Building)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ExecutionState,
    pub to: ExecutionState,
    /// Iteration number at transition time (0 before the build loop).
    pub iteration: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current state, enforces legal transitions, and keeps the
/// complete transition log.
#[derive(Debug)]
pub struct StateMachine {
    current: ExecutionState,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: ExecutionState::Idle,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> ExecutionState {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Set the iteration counter (called by the orchestrator loop).
    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Attempt to advance to the next state.
    pub fn advance(
        &mut self,
        to: ExecutionState,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        let record = TransitionRecord {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        };

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            "state transition"
        );

        self.transitions.push(record);
        self.current = to;
        Ok(())
    }

    /// Transition to `Failed`; always legal from non-terminal states.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(ExecutionState::Failed, Some(reason))
    }

    /// Transition to `Timeout`; always legal from non-terminal states.
    pub fn time_out(&mut self) -> Result<(), IllegalTransition> {
        self.advance(ExecutionState::Timeout, Some("orchestration timer fired"))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), ExecutionState::Idle);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Planning, None).unwrap();
        sm.advance(ExecutionState::Building, Some("plan produced"))
            .unwrap();
        sm.set_iteration(1);
        sm.advance(ExecutionState::Testing, None).unwrap();
        sm.advance(ExecutionState::Success, Some("validation passed"))
            .unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.current(), ExecutionState::Success);
        assert_eq!(sm.transitions().len(), 4);
    }

    #[test]
    fn test_fix_loop() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Planning, None).unwrap();
        sm.advance(ExecutionState::Building, None).unwrap();
        sm.set_iteration(1);
        sm.advance(ExecutionState::Testing, None).unwrap();
        sm.advance(ExecutionState::Fixing, Some("2 errors")).unwrap();
        sm.advance(ExecutionState::Building, None).unwrap();
        sm.set_iteration(2);
        sm.advance(ExecutionState::Testing, None).unwrap();
        sm.advance(ExecutionState::Success, None).unwrap();

        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 7);
    }

    #[test]
    fn test_planner_failure() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Planning, None).unwrap();
        sm.fail("planner error").unwrap();
        assert_eq!(sm.current(), ExecutionState::Failed);
    }

    #[test]
    fn test_timeout_from_any_nonterminal() {
        for state in [
            ExecutionState::Idle,
            ExecutionState::Planning,
            ExecutionState::Building,
            ExecutionState::Testing,
            ExecutionState::Fixing,
        ] {
            let mut sm = StateMachine {
                current: state,
                iteration: 0,
                created_at: Instant::now(),
                transitions: Vec::new(),
            };
            assert!(sm.time_out().is_ok(), "timeout from {state} should be legal");
            assert_eq!(sm.current(), ExecutionState::Timeout);
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        for state in [
            ExecutionState::Success,
            ExecutionState::Failed,
            ExecutionState::Timeout,
        ] {
            let mut sm = StateMachine {
                current: state,
                iteration: 0,
                created_at: Instant::now(),
                transitions: Vec::new(),
            };
            assert!(sm.advance(ExecutionState::Building, None).is_err());
            assert!(sm.fail("nope").is_err());
            assert!(sm.time_out().is_err());
        }
    }

    #[test]
    fn test_illegal_skip() {
        let mut sm = StateMachine::new();
        let err = sm.advance(ExecutionState::Building, None).unwrap_err();
        assert_eq!(err.from, ExecutionState::Idle);
        assert_eq!(err.to, ExecutionState::Building);
    }

    #[test]
    fn test_fixing_only_returns_to_building() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Planning, None).unwrap();
        sm.advance(ExecutionState::Building, None).unwrap();
        sm.advance(ExecutionState::Fixing, None).unwrap();
        assert!(sm.advance(ExecutionState::Testing, None).is_err());
        sm.advance(ExecutionState::Building, None).unwrap();
        assert_eq!(sm.current(), ExecutionState::Building);
    }

    #[test]
    fn test_transition_record_fields() {
        let mut sm = StateMachine::new();
        sm.set_iteration(3);
        sm.advance(ExecutionState::Planning, Some("start")).unwrap();
        let record = &sm.transitions()[0];
        assert_eq!(record.from, ExecutionState::Idle);
        assert_eq!(record.to, ExecutionState::Planning);
        assert_eq!(record.iteration, 3);
        assert_eq!(record.reason.as_deref(), Some("start"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let record = TransitionRecord {
            from: ExecutionState::Testing,
            to: ExecutionState::Fixing,
            iteration: 2,
            elapsed_ms: 1234,
            reason: Some("syntax error in index.js".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"testing\""));
        assert!(json.contains("\"fixing\""));
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.from, ExecutionState::Testing);
        assert_eq!(restored.iteration, 2);
    }

    #[test]
    fn test_display_uppercase() {
        assert_eq!(ExecutionState::Planning.to_string(), "PLANNING");
        assert_eq!(ExecutionState::Timeout.to_string(), "TIMEOUT");
    }
}
