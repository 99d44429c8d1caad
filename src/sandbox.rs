//! Resource-bounded PTY processes and per-session scratch directories.

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, ExitStatus, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::{CStr, OsString};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

const SHELL: &str = "/bin/sh";
const READ_CHUNK: usize = 4096;
/// Chunks buffered between the PTY reader thread and the session.
/// A full queue blocks the reader, which in turn blocks the program's writes.
pub const PTY_OUTPUT_CAPACITY: usize = 256;

/// OS ceilings applied by the wrapper shell before it runs the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Address-space ceiling in bytes. `None` leaves it at the server's own limit.
    pub virtual_memory: Option<u64>,
    pub resident_memory: u64,
    pub cpu_seconds: u64,
    pub stack: u64,
    pub open_files: u64,
    /// Processes the session's user may own, counted across the whole user.
    pub processes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            virtual_memory: Some(512 * 1024 * 1024),
            resident_memory: 256 * 1024 * 1024,
            cpu_seconds: 10,
            stack: 8 * 1024 * 1024,
            open_files: 64,
            processes: 256,
        }
    }
}

impl ResourceLimits {
    /// `ulimit` chain applying these limits, clamped to the current hard limits.
    pub fn shell_prelude(&self) -> String {
        let mut steps = vec!["ulimit -c 0".to_string()];
        steps.push(format!(
            "ulimit -t {}",
            clamp_to_hard(Resource::RLIMIT_CPU, self.cpu_seconds).max(1)
        ));
        if let Some(bytes) = self.virtual_memory {
            steps.push(format!(
                "ulimit -v {}",
                clamp_to_hard(Resource::RLIMIT_AS, bytes) / 1024
            ));
        }
        steps.push(format!(
            "ulimit -m {}",
            clamp_to_hard(Resource::RLIMIT_RSS, self.resident_memory) / 1024
        ));
        steps.push(format!(
            "ulimit -s {}",
            clamp_to_hard(Resource::RLIMIT_STACK, self.stack) / 1024
        ));
        steps.push(format!(
            "ulimit -n {}",
            clamp_to_hard(Resource::RLIMIT_NOFILE, self.open_files)
        ));
        // dash and busybox spell the process limit -p; bash spells it -u and
        // rejects -p as the read-only pipe size.
        let processes = clamp_to_hard(Resource::RLIMIT_NPROC, self.processes).max(1);
        steps.push(format!(
            "{{ ulimit -p {processes} 2>/dev/null || ulimit -u {processes}; }}"
        ));
        steps.join(" && ")
    }
}

fn clamp_to_hard(resource: Resource, requested: u64) -> u64 {
    match getrlimit(resource) {
        Ok((_, hard)) if hard != libc::RLIM_INFINITY => requested.min(hard as u64),
        Ok(_) => requested,
        Err(e) => {
            warn!(?resource, error = %e, "getrlimit failed, using requested limit");
            requested
        }
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A program to run inside the sandbox wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub limits: ResourceLimits,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, limits: ResourceLimits) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            limits,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full argv handed to the PTY: the wrapper shell, its script, then the target.
    ///
    /// The shell stays resident so a target killed by signal N exits with
    /// status 128+N.
    pub fn wrapped_argv(&self) -> Vec<String> {
        let script = format!("{} && \"$@\"; exit $?", self.limits.shell_prelude());
        let mut argv = vec![
            SHELL.to_string(),
            "-c".to_string(),
            script,
            "sandbox".to_string(),
            self.program.clone(),
        ];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// How a sandboxed process ended, in the client-facing code convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: i32,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Signal number when the code encodes a signal death.
    pub fn signal(&self) -> Option<i32> {
        (self.code > 128).then(|| self.code - 128)
    }
}

impl From<&ExitStatus> for ExitInfo {
    fn from(status: &ExitStatus) -> Self {
        Self {
            code: exit_code(status),
        }
    }
}

/// 0 success, 1..=128 program error, >128 killed by signal `code - 128`.
pub fn exit_code(status: &ExitStatus) -> i32 {
    match status.signal() {
        Some(description) => match signal_number(description) {
            Some(signal) => 128 + signal,
            None => status.exit_code() as i32,
        },
        None => status.exit_code() as i32,
    }
}

fn signal_number(description: &str) -> Option<i32> {
    if let Some(number) = description.strip_prefix("Signal ") {
        return number.trim().parse().ok();
    }
    (1..=64).find(|&signal| {
        // strsignal returns a pointer into static storage or null.
        let name = unsafe { libc::strsignal(signal) };
        !name.is_null() && unsafe { CStr::from_ptr(name) }.to_string_lossy() == description
    })
}

/// Creates PTY-attached processes. A seam so callers can observe or replace spawning.
pub trait ProcessFactory: Send + Sync {
    fn spawn(
        &self,
        command: &CommandSpec,
        size: TermSize,
        working_dir: &Path,
    ) -> Result<SpawnedProcess>;
}

/// A freshly spawned process and its output stream.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    /// PTY output in the order it was produced. Closes at EOF.
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// Ownership of a live child and its PTY master.
pub struct ProcessHandle {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    input: std_mpsc::Sender<Vec<u8>>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit.clone()
    }

    /// Queue bytes for the PTY master. Ordering across calls is preserved.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.input
            .send(data.to_vec())
            .map_err(|_| SessionError::Pty("pty input closed".to_string()))
    }

    pub fn resize(&self, size: TermSize) -> Result<()> {
        lock_or_recover(&self.master)
            .resize(size.into())
            .map_err(|e| SessionError::Pty(e.to_string()))
    }

    /// SIGKILL the whole process group led by the wrapper shell.
    pub fn terminate(&self) -> Result<()> {
        let Some(pid) = self.pid else {
            return Err(SessionError::Pty("process has no pid".to_string()));
        };
        let pid = Pid::from_raw(pid as i32);
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => {
                warn!(%pid, error = %e, "killpg failed, signalling leader only");
                match nix::sys::signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => Ok(()),
                    Err(e) => Err(SessionError::Pty(format!("kill {pid}: {e}"))),
                }
            }
        }
    }

    /// Wait until the child has been reaped, up to `timeout`.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        let waited = tokio::time::timeout(timeout, exit.wait_for(|status| status.is_some())).await;
        match waited {
            Ok(Ok(status)) => *status,
            _ => self.exit_info(),
        }
    }
}

/// Spawns `/bin/sh` wrappers on freshly allocated pseudo-terminals.
#[derive(Debug, Clone)]
pub struct PtyProcessFactory {
    env: HashMap<String, String>,
}

impl Default for PtyProcessFactory {
    fn default() -> Self {
        let mut env = HashMap::new();
        env.insert(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin".to_string(),
        );
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        Self { env }
    }
}

impl PtyProcessFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessFactory for PtyProcessFactory {
    fn spawn(
        &self,
        command: &CommandSpec,
        size: TermSize,
        working_dir: &Path,
    ) -> Result<SpawnedProcess> {
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| SessionError::Pty(format!("openpty: {e}")))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Pty(format!("clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Pty(format!("take writer: {e}")))?;

        let argv = command.wrapped_argv();
        let mut cmd = CommandBuilder::from_argv(argv.iter().map(OsString::from).collect());
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("HOME", working_dir);
        cmd.cwd(working_dir);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(e.to_string()))?;
        // The parent must not hold the slave, or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        info!(?pid, program = %command.program, cwd = ?working_dir, "Spawned sandboxed process");

        let (output_tx, output_rx) = mpsc::channel(PTY_OUTPUT_CAPACITY);
        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let threads = spawn_thread("pty-read", move || pump_output(reader, output_tx))
            .and_then(|_| spawn_thread("pty-write", move || pump_input(writer, input_rx)));
        if let Err(e) = threads {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::Spawn(format!("io thread: {e}")));
        }

        // The waiter owns the child; everything else observes the exit watch.
        let waiter = spawn_thread("pty-wait", move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo::from(&status),
                Err(e) => {
                    warn!(?pid, error = %e, "wait on sandboxed process failed");
                    ExitInfo { code: 1 }
                }
            };
            debug!(?pid, code = info.code, "Sandboxed process reaped");
            let _ = exit_tx.send(Some(info));
        });
        if let Err(e) = waiter {
            if let Some(pid) = pid {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            return Err(SessionError::Spawn(format!("wait thread: {e}")));
        }

        Ok(SpawnedProcess {
            handle: ProcessHandle {
                pid,
                master: Mutex::new(pair.master),
                input: input_tx,
                exit: exit_rx,
            },
            output: output_rx,
        })
    }
}

fn spawn_thread<F>(name: &str, f: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // Runs on a plain thread, never inside the runtime.
                if output.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone.
            Err(_) => break,
        }
    }
}

fn pump_input(mut writer: Box<dyn Write + Send>, input: std_mpsc::Receiver<Vec<u8>>) {
    for chunk in input {
        if let Err(e) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
            debug!(error = %e, "pty write failed, dropping further input");
            break;
        }
    }
}

fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!("recovering from poisoned mutex");
        poisoned.into_inner()
    })
}

/// Create a uniquely named scratch directory for one session run.
pub fn create_scratch_dir(root: &Path, session_id: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let dir = root.join(format!("sandbox-{}-{}", session_id, &suffix[..8]));
    fs::create_dir(&dir)?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

/// Write a file directly into a scratch directory.
pub fn write_file_in_scratch(dir: &Path, name: &str, content: &[u8]) -> io::Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, content)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    Ok(path)
}
