#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sandbox_session::events::{event_channel, EventSink, EventStream, ServerEvent, StartRequest};
use sandbox_session::sandbox::{
    CommandSpec, ProcessFactory, PtyProcessFactory, SpawnedProcess, TermSize,
};
use sandbox_session::toolchain::ToolchainConfig;
use sandbox_session::{ServerConfig, SessionController, SessionError};
use tempfile::TempDir;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Stands in for gcc: "compiles" a source by turning it into a shell script.
/// Sources containing `SYNTAX ERROR` fail with a diagnostic; sources
/// containing `SLOW COMPILE` take half a minute.
const FAKE_COMPILER: &str = r#"#!/bin/sh
out=""
src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2; continue ;;
    *.c|*.cpp) src="$1" ;;
  esac
  shift
done
if grep -q "SLOW COMPILE" "$src"; then
  sleep 30
fi
if grep -q "SYNTAX ERROR" "$src"; then
  echo "$src:1:14: error: expected ';' before '}' token" >&2
  exit 1
fi
{ echo '#!/bin/sh'; cat "$src"; } > "$out"
chmod +x "$out"
"#;

const FAKE_GDB: &str = r#"#!/bin/sh
echo "Reading symbols from $2..."
while read -r cmd; do
  echo "(gdb) $cmd"
  if [ "$cmd" = "quit" ]; then
    exit 0
  fi
done
"#;

const FAKE_VALGRIND: &str = r#"#!/bin/sh
log=""
for arg in "$@"; do
  case "$arg" in
    --log-file=*) log="${arg#--log-file=}" ;;
  esac
  last="$arg"
done
"$last"
code=$?
cat > "$log" <<EOF
==77== Invalid write of size 4
==77== HEAP SUMMARY:
==77==     in use at exit: 40 bytes in 1 blocks
==77==   total heap usage: 1 allocs, 0 frees, 40 bytes allocated
==77== LEAK SUMMARY:
==77==    definitely lost: 40 bytes in 1 blocks
==77==    indirectly lost: 0 bytes in 0 blocks
==77==      possibly lost: 0 bytes in 0 blocks
==77==    still reachable: 0 bytes in 0 blocks
==77== ERROR SUMMARY: 2 errors from 2 contexts (suppressed: 0 from 0)
EOF
exit $code
"#;

const FAKE_STRACE: &str = r#"#!/bin/sh
# invoked as: -f -qq -o <log> <binary>
log="$4"
"$5"
code=$?
{
  echo "100 execve(\"$5\", [\"$5\"], 0x0 /* 3 vars */) = 0"
  echo "100 write(1, \"a\", 1) = 1"
  echo "100 write(1, \"b\", 1) = 1"
  echo "100 close(9) = -1 EBADF (Bad file descriptor)"
  echo "100 +++ exited with $code +++"
} > "$log"
exit $code
"#;

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fake_toolchain(dir: &Path) -> ToolchainConfig {
    let compiler = write_script(dir, "cc", FAKE_COMPILER);
    ToolchainConfig {
        gcc: compiler.clone(),
        gxx: compiler.clone(),
        clang: compiler.clone(),
        clangxx: compiler,
        gdb: write_script(dir, "gdb", FAKE_GDB),
        valgrind: write_script(dir, "valgrind", FAKE_VALGRIND),
        strace: write_script(dir, "strace", FAKE_STRACE),
    }
}

/// Counts spawns and delegates to the real PTY factory, or fails every
/// spawn when built with `failing`.
#[derive(Default)]
pub struct SpyFactory {
    inner: PtyProcessFactory,
    spawns: AtomicUsize,
    fail: bool,
}

impl SpyFactory {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl ProcessFactory for SpyFactory {
    fn spawn(
        &self,
        command: &CommandSpec,
        size: TermSize,
        working_dir: &Path,
    ) -> sandbox_session::Result<SpawnedProcess> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SessionError::Spawn("no pty available".to_string()));
        }
        self.inner.spawn(command, size, working_dir)
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub spy: Arc<SpyFactory>,
    pub root: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_toolchain(None)
    }

    /// `Some(tools)` overrides the fake toolchain.
    pub fn with_toolchain(tools: Option<ToolchainConfig>) -> Self {
        Self::build(tools, SpyFactory::default())
    }

    /// Every spawn fails.
    pub fn failing() -> Self {
        Self::build(None, SpyFactory::failing())
    }

    fn build(tools: Option<ToolchainConfig>, factory: SpyFactory) -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        let scratch = root.path().join("scratch");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&scratch).unwrap();

        let config = ServerConfig {
            scratch_root: scratch,
            toolchain: tools.unwrap_or_else(|| fake_toolchain(&bin)),
            kill_grace: Duration::from_secs(2),
            output_drain: Duration::from_millis(200),
            ..ServerConfig::default()
        };
        let spy = Arc::new(factory);
        let controller = SessionController::new(config, spy.clone());
        Self {
            controller,
            spy,
            root,
        }
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.root.path().join("scratch")
    }

    pub fn scratch_entries(&self) -> usize {
        fs::read_dir(self.scratch_root()).unwrap().count()
    }
}

pub fn request(code: &str) -> StartRequest {
    StartRequest {
        code: code.to_string(),
        language: "c".to_string(),
        compiler: "gcc".to_string(),
        optimization_level: None,
        cols: None,
        rows: None,
    }
}

pub fn event_queue() -> (EventSink, EventStream) {
    event_channel(256)
}

pub async fn recv(rx: &mut EventStream) -> ServerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Receive events up to and including the first one matching `done`.
pub async fn collect_until<F>(
    rx: &mut EventStream,
    done: F,
) -> Vec<ServerEvent>
where
    F: Fn(&ServerEvent) -> bool,
{
    let mut events = Vec::new();
    loop {
        let event = recv(rx).await;
        let finished = done(&event);
        events.push(event);
        if finished {
            return events;
        }
    }
}

/// Concatenated PTY text from `output` and `debug-response` events.
pub fn pty_text(events: &[ServerEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::Output { data } | ServerEvent::DebugResponse { data } => {
                Some(data.as_str())
            }
            _ => None,
        })
        .collect()
}

pub fn is_exit(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Exit { .. })
}
