//! Session lifecycle controller.
//!
//! A start request validates the source, reserves the session id in the
//! registry and hands the rest of the run to a driver task:
//!
//! ```text
//! idle -> compiling -> running | debugging | tracing -> exited -> cleaned-up
//!              \-> compile-error -> cleaned-up
//! ```
//!
//! Every lifecycle step takes the record's lock, so a concurrent cleanup
//! either runs before the step (which then sees `cleaned-up` and stops) or
//! after it. The driver waits for room in the client's event queue before it
//! takes the lock, never while holding it.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, SessionError};
use crate::events::{ClientEvent, EventSink, ServerEvent, StartRequest, Utf8Decoder};
use crate::reaper::{CleanupReport, Reaper};
use crate::report;
use crate::sandbox::{self, ExitInfo, ProcessFactory, TermSize};
use crate::state::{Mode, SessionId, SessionRecord, SessionRegistry, SessionState, SharedRecord};
use crate::toolchain::BuildPlan;
use crate::validator;

/// Compiler output kept for a `compile-error` event.
const MAX_DIAGNOSTIC: usize = 64 * 1024;

#[derive(Debug)]
pub enum StartOutcome {
    /// The driver task owning the run.
    Started(JoinHandle<()>),
    /// Refused before anything was allocated; the client got an `error` event.
    Rejected(String),
    /// A run is already in progress for this id.
    Busy,
}

#[derive(Clone)]
pub struct SessionController {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    factory: Arc<dyn ProcessFactory>,
    reaper: Reaper,
}

impl SessionController {
    pub fn new(config: ServerConfig, factory: Arc<dyn ProcessFactory>) -> Self {
        let registry = SessionRegistry::new();
        let reaper = Reaper::new(registry.clone(), config.kill_grace, config.fallback_timeout);
        Self {
            config: Arc::new(config),
            registry,
            factory,
            reaper,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Route one client event for session `id`.
    pub async fn handle(&self, id: &SessionId, event: ClientEvent, events: &EventSink) {
        match event {
            ClientEvent::StartCompile(request) => {
                self.start(id, Mode::Compile, request, events).await;
            }
            ClientEvent::StartDebug(request) => {
                self.start(id, Mode::Debug, request, events).await;
            }
            ClientEvent::StartLeakCheck(request) => {
                self.start(id, Mode::LeakCheck, request, events).await;
            }
            ClientEvent::StartSyscallTrace(request) => {
                self.start(id, Mode::SyscallTrace, request, events).await;
            }
            ClientEvent::Input { data } => self.input(id, data.as_bytes()).await,
            ClientEvent::Resize { cols, rows } => self.resize(id, TermSize { cols, rows }).await,
            ClientEvent::DebugCommand { text } => self.debug_command(id, &text).await,
            ClientEvent::Cleanup => {
                self.cleanup(id).await;
            }
        }
    }

    pub async fn start(
        &self,
        id: &SessionId,
        mode: Mode,
        request: StartRequest,
        events: &EventSink,
    ) -> StartOutcome {
        if let Err(rejection) = validator::validate(&request.code, &self.config.validation) {
            info!(session_id = %id, ?mode, %rejection, "Rejected submission");
            let message = rejection.to_string();
            notify(events, ServerEvent::error(message.clone()));
            return StartOutcome::Rejected(message);
        }

        let plan = match BuildPlan::new(
            mode,
            &request.language,
            &request.compiler,
            request.optimization_level.as_deref(),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                info!(session_id = %id, ?mode, error = %e, "Rejected toolchain selection");
                let message = e.to_string();
                notify(events, ServerEvent::error(message.clone()));
                return StartOutcome::Rejected(message);
            }
        };

        let record = Arc::new(Mutex::new(SessionRecord::new(
            id.clone(),
            mode,
            events.clone(),
        )));
        if !self.registry.insert_if_vacant(id.clone(), record.clone()).await {
            warn!(session_id = %id, ?mode, "Ignoring start request for an active session");
            return StartOutcome::Busy;
        }

        let size = TermSize {
            cols: request.cols.unwrap_or(self.config.default_size.cols),
            rows: request.rows.unwrap_or(self.config.default_size.rows),
        };
        info!(session_id = %id, ?mode, language = %plan.language, "Session started");
        let driver = tokio::spawn(self.clone().drive(
            record,
            events.clone(),
            plan,
            request.code,
            size,
        ));
        StartOutcome::Started(driver)
    }

    /// Write client bytes to the PTY of an active run.
    pub async fn input(&self, id: &SessionId, data: &[u8]) {
        let Some(record) = self.registry.get(id).await else {
            debug!(session_id = %id, "Input for unknown session");
            return;
        };
        let guard = record.lock().await;
        match (&guard.process, guard.state().is_active()) {
            (Some(process), true) => {
                if let Err(e) = process.write(data) {
                    warn!(session_id = %id, error = %e, "Failed to forward input");
                }
            }
            _ => debug!(session_id = %id, state = %guard.state(), "Input ignored"),
        }
    }

    /// Resize the PTY. A no-op outside the active states.
    pub async fn resize(&self, id: &SessionId, size: TermSize) {
        let Some(record) = self.registry.get(id).await else {
            return;
        };
        let guard = record.lock().await;
        if !guard.state().is_active() {
            debug!(session_id = %id, state = %guard.state(), "Resize ignored");
            return;
        }
        if let Some(process) = &guard.process {
            if let Err(e) = process.resize(size) {
                warn!(session_id = %id, error = %e, "Failed to resize pty");
            }
        }
    }

    /// Send one command line to the debugger.
    pub async fn debug_command(&self, id: &SessionId, text: &str) {
        let Some(record) = self.registry.get(id).await else {
            return;
        };
        let guard = record.lock().await;
        if guard.mode != Mode::Debug || guard.state() != SessionState::Debugging {
            debug!(session_id = %id, mode = ?guard.mode, "Debug command ignored");
            return;
        }
        if let Some(process) = &guard.process {
            let line = format!("{}\n", text.trim_end_matches(|c| c == '\r' || c == '\n'));
            if let Err(e) = process.write(line.as_bytes()) {
                warn!(session_id = %id, error = %e, "Failed to forward debug command");
            }
        }
    }

    pub async fn cleanup(&self, id: &SessionId) -> CleanupReport {
        self.reaper.cleanup(id).await
    }

    /// Clean up every session, for server shutdown.
    pub async fn shutdown_all(&self) -> usize {
        self.reaper.reap_all().await
    }

    async fn drive(
        self,
        record: SharedRecord,
        events: EventSink,
        plan: BuildPlan,
        code: String,
        size: TermSize,
    ) {
        let id = record.lock().await.id.clone();
        if let Err(e) = self.run_pipeline(&record, &events, &plan, &code, size).await {
            error!(session_id = %id, mode = ?plan.mode, error = %e, "Session failed");
            forward(&record, &events, ServerEvent::error(e.to_string())).await;
        }
        self.reaper.cleanup_record(&id, &record).await;
    }

    async fn run_pipeline(
        &self,
        record: &SharedRecord,
        events: &EventSink,
        plan: &BuildPlan,
        code: &str,
        size: TermSize,
    ) -> Result<()> {
        let mode = plan.mode;
        let drain = self.config.output_drain;

        let Ok(permit) = events.reserve().await else {
            return Ok(());
        };
        let (scratch, mut output, exit) = {
            let mut guard = record.lock().await;
            if guard.state() != SessionState::Idle {
                return Ok(());
            }
            let scratch = sandbox::create_scratch_dir(&self.config.scratch_root, guard.id.as_str())
                .map_err(SessionError::Workspace)?;
            guard.scratch_dir = Some(scratch.clone());
            sandbox::write_file_in_scratch(&scratch, plan.language.source_file(), code.as_bytes())
                .map_err(SessionError::Workspace)?;

            guard.transition(SessionState::Compiling);
            guard.deliver(permit, ServerEvent::Compiling);

            let command = plan.compile_command(
                &self.config.toolchain,
                &scratch,
                self.config.build_limits.clone(),
            );
            let spawned = self.factory.spawn(&command, size, &scratch)?;
            let exit = spawned.handle.exit_watch();
            guard.process = Some(spawned.handle);
            (scratch, spawned.output, exit)
        };

        let mut diagnostic = Vec::new();
        let build = stream_until_exit(&mut output, exit, drain, |chunk| {
            let room = MAX_DIAGNOSTIC.saturating_sub(diagnostic.len());
            diagnostic.extend_from_slice(&chunk[..chunk.len().min(room)]);
            std::future::ready(true)
        })
        .await;

        let Ok(permit) = events.reserve().await else {
            return Ok(());
        };
        let (mut output, exit) = {
            let mut guard = record.lock().await;
            if guard.state().is_terminal() {
                return Ok(());
            }
            guard.process = None;
            let code = build.map_or(1, |exit| exit.code);
            if code != 0 {
                let text = String::from_utf8_lossy(&diagnostic).trim().to_string();
                let diagnostic = if text.is_empty() {
                    format!("compilation failed with exit code {code}")
                } else {
                    text
                };
                info!(session_id = %guard.id, exit_code = code, "Compilation failed");
                guard.transition(SessionState::CompileError);
                guard.deliver(permit, ServerEvent::CompileError { diagnostic });
                return Ok(());
            }

            let limits = match mode {
                Mode::Compile => self.config.run_limits.clone(),
                _ => self.config.instrumented_limits.clone(),
            };
            let command = plan.run_command(&self.config.toolchain, &scratch, limits);
            let spawned = self.factory.spawn(&command, size, &scratch)?;
            let exit = spawned.handle.exit_watch();
            guard.process = Some(spawned.handle);
            guard.transition(mode.active_state());
            guard.deliver(permit, ServerEvent::started(mode));
            (spawned.output, exit)
        };

        let mut decoder = Utf8Decoder::default();
        let run = stream_until_exit(&mut output, exit, drain, |chunk| {
            let text = decoder.decode(&chunk);
            let record = record.clone();
            let events = events.clone();
            async move {
                if text.is_empty() {
                    return !record.lock().await.state().is_terminal();
                }
                forward(&record, &events, ServerEvent::pty_text(mode, text)).await
            }
        })
        .await;
        let Some(exit) = run else {
            return Ok(());
        };

        let rest = decoder.finish();
        if !rest.is_empty() && !forward(record, events, ServerEvent::pty_text(mode, rest)).await {
            return Ok(());
        }

        let Ok(permit) = events.reserve().await else {
            return Ok(());
        };
        {
            let mut guard = record.lock().await;
            if guard.state().is_terminal() {
                return Ok(());
            }
            info!(session_id = %guard.id, ?mode, exit_code = exit.code, "Program exited");
            guard.transition(SessionState::Exited);
            guard.deliver(
                permit,
                ServerEvent::Exit {
                    exit_code: exit.code,
                    is_report_pending: mode.has_report(),
                },
            );
        }

        if let Some(event) = self.build_report(plan, &scratch).await {
            forward(record, events, event).await;
        }
        Ok(())
    }

    async fn build_report(&self, plan: &BuildPlan, scratch: &Path) -> Option<ServerEvent> {
        let log = plan.report_log(scratch)?;
        let text = report::generate(plan.mode, &log).await?;
        ServerEvent::report(plan.mode, text)
    }
}

/// Wait for room in the client's queue, then send `event` unless the session
/// has been cleaned up meanwhile. `false` when nothing was sent.
async fn forward(record: &SharedRecord, events: &EventSink, event: ServerEvent) -> bool {
    let Ok(permit) = events.reserve().await else {
        return false;
    };
    record.lock().await.deliver(permit, event)
}

/// Queue an event for the connection that is calling us. Never waits, since
/// that connection is also the one draining the queue.
fn notify(events: &EventSink, event: ServerEvent) {
    if let Err(e) = events.try_send(event) {
        warn!(error = %e, "Could not queue event for client");
    }
}

/// Feed PTY output to `on_chunk` until the process has exited and the PTY
/// has drained, or `on_chunk` returns `false`.
///
/// Output still arriving `drain` after the exit is dropped, so a background
/// child holding the PTY open cannot stall the session.
async fn stream_until_exit<F, Fut>(
    output: &mut mpsc::Receiver<Vec<u8>>,
    mut exit: watch::Receiver<Option<ExitInfo>>,
    drain: Duration,
    mut on_chunk: F,
) -> Option<ExitInfo>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut exited = *exit.borrow();
    let mut open = true;
    let deadline = tokio::time::sleep(drain);
    tokio::pin!(deadline);

    while open || exited.is_none() {
        tokio::select! {
            chunk = output.recv(), if open => match chunk {
                Some(chunk) => {
                    if !on_chunk(chunk).await {
                        return None;
                    }
                }
                None => open = false,
            },
            status = wait_exit(&mut exit), if exited.is_none() => {
                exited = Some(status);
                deadline.as_mut().reset(Instant::now() + drain);
            }
            () = &mut deadline, if exited.is_some() && open => break,
        }
    }
    exited
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => (*status).unwrap_or(ExitInfo { code: 1 }),
        Err(_) => ExitInfo { code: 1 },
    }
}
