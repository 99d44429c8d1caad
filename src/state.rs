//! Session records, their lifecycle states, and the shared registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Permit;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::events::{EventSink, ServerEvent};
use crate::sandbox::ProcessHandle;

/// Opaque session identifier, one per client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What a session does once its program has compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Compile,
    Debug,
    LeakCheck,
    SyscallTrace,
}

impl Mode {
    /// State entered when the run process starts.
    pub fn active_state(self) -> SessionState {
        match self {
            Mode::Compile | Mode::LeakCheck => SessionState::Running,
            Mode::Debug => SessionState::Debugging,
            Mode::SyscallTrace => SessionState::Tracing,
        }
    }

    /// Whether a post-exit report follows the `exit` event.
    pub fn has_report(self) -> bool {
        matches!(self, Mode::LeakCheck | Mode::SyscallTrace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Compiling,
    CompileError,
    Running,
    Debugging,
    Tracing,
    Exited,
    CleanedUp,
}

impl SessionState {
    /// A run process is attached and accepting input.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::Debugging | SessionState::Tracing
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::CleanedUp
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (CleanedUp, _) => false,
            (_, CleanedUp) => true,
            (Idle, Compiling) => true,
            (Compiling, CompileError | Running | Debugging | Tracing) => true,
            (Running | Debugging | Tracing, Exited) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Compiling => "compiling",
            SessionState::CompileError => "compile-error",
            SessionState::Running => "running",
            SessionState::Debugging => "debugging",
            SessionState::Tracing => "tracing",
            SessionState::Exited => "exited",
            SessionState::CleanedUp => "cleaned-up",
        };
        f.write_str(name)
    }
}

/// Everything owned by one session run.
#[derive(Debug)]
pub struct SessionRecord {
    pub id: SessionId,
    pub mode: Mode,
    state: SessionState,
    pub process: Option<ProcessHandle>,
    pub scratch_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    events: EventSink,
}

impl SessionRecord {
    pub fn new(id: SessionId, mode: Mode, events: EventSink) -> Self {
        Self {
            id,
            mode,
            state: SessionState::Idle,
            process: None,
            scratch_dir: None,
            created_at: Utc::now(),
            events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Illegal moves are logged and refused.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(session = %self.id, from = %self.state, to = %next, "Refusing state transition");
            return false;
        }
        debug!(session = %self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
        true
    }

    /// Queue an event without waiting, unless the session has been cleaned up.
    /// A full queue drops the event.
    pub fn emit(&self, event: ServerEvent) {
        if self.state.is_terminal() {
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(session = %self.id, ?event, "Event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => debug!(session = %self.id, "Event receiver gone"),
        }
    }

    /// Send through a slot reserved before the record was locked.
    /// Returns `false` once the session has been cleaned up.
    pub fn deliver(&self, permit: Permit<'_, ServerEvent>, event: ServerEvent) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        permit.send(event);
        true
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            mode: self.mode,
            state: self.state,
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
            created_at: self.created_at,
            age_secs: (Utc::now() - self.created_at).num_seconds().max(0) as u64,
        }
    }
}

/// Snapshot of a record for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub mode: Mode,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
}

pub type SharedRecord = Arc<Mutex<SessionRecord>>;

/// Thread-safe map from session id to its record.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, SharedRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for `id`.
    pub async fn put(&self, id: SessionId, record: SharedRecord) {
        self.sessions.write().await.insert(id, record);
    }

    /// Insert only when no record exists for `id`. Returns `false` if occupied.
    pub async fn insert_if_vacant(&self, id: SessionId, record: SharedRecord) -> bool {
        match self.sessions.write().await.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    pub async fn get(&self, id: &SessionId) -> Option<SharedRecord> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &SessionId) -> Option<SharedRecord> {
        self.sessions.write().await.remove(id)
    }

    /// Remove `id` only if it still maps to `record`.
    pub async fn remove_if_same(&self, id: &SessionId, record: &SharedRecord) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(current) if Arc::ptr_eq(current, record) => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn all(&self) -> Vec<(SessionId, SharedRecord)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
