//! Idempotent session teardown.
//!
//! Each step runs regardless of how the previous one went: kill the process
//! group, remove the scratch directory (falling back to `rm -rf`), then evict
//! the record from the registry.

use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::events::ServerEvent;
use crate::sandbox::ProcessHandle;
use crate::state::{SessionId, SessionRegistry, SessionState, SharedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do.
    Skipped,
    Done,
    /// Primary removal failed and the fallback succeeded.
    Fallback,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    /// The session was already cleaned up, or never existed.
    pub noop: bool,
    pub terminate: StepOutcome,
    pub remove_dir: StepOutcome,
    pub evicted: bool,
}

impl CleanupReport {
    fn noop(evicted: bool) -> Self {
        Self {
            noop: true,
            terminate: StepOutcome::Skipped,
            remove_dir: StepOutcome::Skipped,
            evicted,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reaper {
    registry: SessionRegistry,
    kill_grace: Duration,
    fallback_timeout: Duration,
}

impl Reaper {
    pub fn new(registry: SessionRegistry, kill_grace: Duration, fallback_timeout: Duration) -> Self {
        Self {
            registry,
            kill_grace,
            fallback_timeout,
        }
    }

    pub async fn cleanup(&self, id: &SessionId) -> CleanupReport {
        match self.registry.get(id).await {
            Some(record) => self.cleanup_record(id, &record).await,
            None => {
                debug!(session_id = %id, "Cleanup requested for unknown session");
                CleanupReport::noop(false)
            }
        }
    }

    /// Tear down `record`, holding its lock so no lifecycle step interleaves.
    pub async fn cleanup_record(&self, id: &SessionId, record: &SharedRecord) -> CleanupReport {
        let mut guard = record.lock().await;
        if guard.state().is_terminal() {
            drop(guard);
            let evicted = self.registry.remove_if_same(id, record).await;
            return CleanupReport::noop(evicted);
        }

        let terminate = match guard.process.take() {
            Some(handle) => terminate_process(id, &handle, self.kill_grace).await,
            None => StepOutcome::Skipped,
        };

        let remove_dir = match guard.scratch_dir.take() {
            Some(dir) => remove_scratch(&dir, self.fallback_timeout).await,
            None => StepOutcome::Skipped,
        };

        let from = guard.state();
        guard.transition(SessionState::CleanedUp);
        drop(guard);

        let evicted = self.registry.remove_if_same(id, record).await;
        info!(
            session_id = %id,
            %from,
            ?terminate,
            ?remove_dir,
            evicted,
            "Session cleaned up"
        );
        CleanupReport {
            noop: false,
            terminate,
            remove_dir,
            evicted,
        }
    }

    /// Reap sessions older than `max_age`, notifying each client first.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let now = chrono::Utc::now();
        let mut reaped = 0;
        for (id, record) in self.registry.all().await {
            {
                let guard = record.lock().await;
                if guard.state().is_terminal() || now - guard.created_at <= max_age {
                    continue;
                }
                warn!(session_id = %id, state = %guard.state(), "Session exceeded its lifetime");
                guard.emit(ServerEvent::error("session timed out"));
            }
            self.cleanup_record(&id, &record).await;
            reaped += 1;
        }
        reaped
    }

    /// Clean up every registered session.
    pub async fn reap_all(&self) -> usize {
        let sessions = self.registry.all().await;
        let count = sessions.len();
        for (id, record) in sessions {
            self.cleanup_record(&id, &record).await;
        }
        count
    }
}

async fn terminate_process(id: &SessionId, handle: &ProcessHandle, grace: Duration) -> StepOutcome {
    if !handle.is_alive() {
        return StepOutcome::Skipped;
    }
    if let Err(e) = handle.terminate() {
        warn!(session_id = %id, pid = ?handle.pid(), error = %e, "Failed to signal process");
        return StepOutcome::Failed;
    }
    match handle.wait_for_exit(grace).await {
        Some(exit) => {
            debug!(session_id = %id, pid = ?handle.pid(), exit_code = exit.code, "Process terminated");
            StepOutcome::Done
        }
        None => {
            warn!(session_id = %id, pid = ?handle.pid(), "Process still alive after SIGKILL");
            StepOutcome::Failed
        }
    }
}

/// Remove a scratch directory, falling back to `rm -rf` when that fails.
pub async fn remove_scratch(dir: &Path, fallback_timeout: Duration) -> StepOutcome {
    let err = match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => return StepOutcome::Done,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return StepOutcome::Done,
        Err(e) => e,
    };
    warn!(path = %dir.display(), error = %err, "Scratch removal failed, trying rm -rf");

    let status = tokio::time::timeout(
        fallback_timeout,
        Command::new("rm")
            .arg("-rf")
            .arg("--")
            .arg(dir)
            .kill_on_drop(true)
            .status(),
    )
    .await;
    match status {
        Ok(Ok(status)) if status.success() && !dir.exists() => StepOutcome::Fallback,
        Ok(Ok(status)) => {
            warn!(path = %dir.display(), %status, "Fallback removal failed");
            StepOutcome::Failed
        }
        Ok(Err(e)) => {
            warn!(path = %dir.display(), error = %e, "Could not run rm");
            StepOutcome::Failed
        }
        Err(_) => {
            warn!(path = %dir.display(), "Fallback removal timed out");
            StepOutcome::Failed
        }
    }
}
