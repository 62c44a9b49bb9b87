//! Execution events: an ordered, append-only log with caller fan-out.
//!
//! Every event is appended to the owning execution's log and, when a
//! callback is registered, delivered to it exactly once in generation
//! order. The callback is a borrowed capability for the execution's
//! lifetime; `clear_callback` severs the reference cycle back to the
//! caller on cleanup.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event types emitted during an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SandboxCreating,
    SandboxCreated,
    SandboxFailed,
    PlanningStart,
    PlanningComplete,
    PlanningFailed,
    BuildingStart,
    BuildingComplete,
    BuildingFailed,
    SnapshotCreated,
    InstallingDependencies,
    BuildErrors,
    FixingStart,
    FixingComplete,
    FixingFailed,
    StateChange,
    ExecutionComplete,
    ExecutionFailed,
    ExecutionTimeout,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // serde's snake_case rename is the canonical wire name.
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        write!(f, "{name}")
    }
}

/// Immutable event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp_ms: i64,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

/// Caller-supplied event sink, invoked in generation order.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Ordered, append-only event log owned by a single execution.
pub struct EventLog {
    events: Vec<Event>,
    callback: Option<EventCallback>,
}

impl EventLog {
    pub fn new(callback: Option<EventCallback>) -> Self {
        Self {
            events: Vec::new(),
            callback,
        }
    }

    /// Append an event and deliver it to the registered callback.
    pub fn emit(&mut self, event_type: EventType, data: Value) {
        let event = Event::new(event_type, data);
        tracing::debug!(event = %event.event_type, "execution event");
        if let Some(cb) = &self.callback {
            cb(&event);
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop the caller callback; the log itself is retained.
    pub fn clear_callback(&mut self) {
        self.callback = None;
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("events", &self.events.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
