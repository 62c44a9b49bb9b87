//! In-memory session store with bounded history and TTL eviction.
//!
//! Sessions are shared between the HTTP surface (external) and the core;
//! the orchestrator only reads them. The map is guarded by a coarse mutex;
//! critical sections are short and never held across an await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::SessionConfig;

/// History is capped at this many turns...
const MAX_HISTORY: usize = 20;
/// ...and trimmed down to the most recent this many when exceeded.
const TRIM_TO: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub content: String,
}

/// A client-identified conversational context.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub history: Vec<ChatTurn>,
    /// Plan promoted by the caller to drive builder invocations.
    pub approved_plan: Option<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    fn new(id: &str) -> Self {
        let now = Instant::now();
        Self {
            id: id.to_string(),
            history: Vec::new(),
            approved_plan: None,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Process-wide session store.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Append a turn, creating the session if needed.
    ///
    /// Enforces the history bound: when the length would exceed
    /// `MAX_HISTORY`, only the most recent `TRIM_TO` turns are retained.
    pub fn append(&self, session_id: &str, role: MessageRole, content: impl Into<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.history.push(ChatTurn {
            role,
            content: content.into(),
        });
        if session.history.len() > MAX_HISTORY {
            let excess = session.history.len() - TRIM_TO;
            session.history.drain(..excess);
            debug!(session = session_id, "trimmed history to most recent {TRIM_TO}");
        }
        session.last_activity = Instant::now();
    }

    /// Promote a plan for the session's subsequent builder invocations.
    pub fn set_approved_plan(&self, session_id: &str, plan: impl Into<String>) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.approved_plan = Some(plan.into());
        session.last_activity = Instant::now();
    }

    pub fn approved_plan(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|s| s.approved_plan.clone())
    }

    /// Snapshot of a session, if present.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Refresh the activity timestamp without mutating history.
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Evict sessions idle longer than the TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let ttl = self.config.ttl;
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_activity.elapsed() <= ttl);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, "evicted idle sessions");
        }
        evicted
    }

    /// Spawn the background eviction task. Runs until the process exits.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = store.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately; skip it so the first sweep
            // happens one interval after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.sweep();
            }
        })
    }
}
