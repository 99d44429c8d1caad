//! Server configuration and the `serve` command-line arguments.

use clap::Args;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::{ResourceLimits, TermSize};
use crate::toolchain::ToolchainConfig;
use crate::validator::ValidationLimits;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Parent of every per-session scratch directory.
    pub scratch_root: PathBuf,
    pub templates_dir: PathBuf,
    pub validation: ValidationLimits,
    /// Limits for the compiler.
    pub build_limits: ResourceLimits,
    /// Limits for a plainly executed program.
    pub run_limits: ResourceLimits,
    /// Limits for programs running under gdb, valgrind or strace.
    pub instrumented_limits: ResourceLimits,
    pub toolchain: ToolchainConfig,
    pub default_size: TermSize,
    pub max_session_age: Duration,
    pub sweep_interval: Duration,
    pub kill_grace: Duration,
    pub fallback_timeout: Duration,
    /// How long to keep reading PTY output after the process has exited.
    pub output_drain: Duration,
    pub max_connections: usize,
    /// Events buffered per connection before the session waits for the client.
    pub event_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            scratch_root: std::env::temp_dir(),
            templates_dir: PathBuf::from("templates"),
            validation: ValidationLimits::default(),
            build_limits: ResourceLimits {
                virtual_memory: Some(2048 * MIB),
                resident_memory: 1024 * MIB,
                cpu_seconds: 30,
                stack: 8 * MIB,
                open_files: 256,
                processes: 512,
            },
            run_limits: ResourceLimits::default(),
            instrumented_limits: ResourceLimits {
                virtual_memory: None,
                resident_memory: 512 * MIB,
                cpu_seconds: 30,
                stack: 8 * MIB,
                open_files: 256,
                processes: 512,
            },
            toolchain: ToolchainConfig::default(),
            default_size: TermSize::default(),
            max_session_age: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            fallback_timeout: Duration::from_secs(10),
            output_drain: Duration::from_millis(200),
            max_connections: 64,
            event_queue: 256,
        }
    }
}

/// Flags accepted by `serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "SANDBOX_PORT", default_value = "8080")]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "SANDBOX_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Directory for per-session scratch directories (defaults to the system temp dir)
    #[arg(long, env = "SANDBOX_SCRATCH_ROOT")]
    pub scratch_root: Option<PathBuf>,

    /// Directory holding starter programs as <language>/<name>.<ext>
    #[arg(long, env = "SANDBOX_TEMPLATES_DIR", default_value = "templates")]
    pub templates_dir: PathBuf,

    /// Sessions older than this are reaped
    #[arg(long, default_value = "600")]
    pub max_session_secs: u64,

    /// CPU time limit for user programs, in seconds
    #[arg(long, default_value = "10")]
    pub cpu_secs: u64,

    /// Address-space limit for plainly executed programs, in MiB
    #[arg(long, default_value = "512")]
    pub memory_mb: u64,

    /// Stack limit, in MiB
    #[arg(long, default_value = "8")]
    pub stack_mb: u64,

    /// Maximum number of open files for user programs
    #[arg(long, default_value = "64")]
    pub nofile: u64,

    /// Maximum number of processes for user programs
    #[arg(long, default_value = "256")]
    pub nproc: u64,

    /// Events queued per connection before output is throttled
    #[arg(long, default_value = "256")]
    pub event_queue: usize,

    /// Maximum concurrent WebSocket connections
    #[arg(long, default_value = "64")]
    pub max_connections: usize,

    #[arg(long, env = "SANDBOX_GCC")]
    pub gcc: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_GXX")]
    pub gxx: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_CLANG")]
    pub clang: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_CLANGXX")]
    pub clangxx: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_GDB")]
    pub gdb: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_VALGRIND")]
    pub valgrind: Option<PathBuf>,
    #[arg(long, env = "SANDBOX_STRACE")]
    pub strace: Option<PathBuf>,
}

impl ServeArgs {
    pub fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            bind: SocketAddr::new(self.bind, self.port),
            templates_dir: self.templates_dir,
            max_session_age: Duration::from_secs(self.max_session_secs),
            max_connections: self.max_connections.max(1),
            event_queue: self.event_queue.max(1),
            ..ServerConfig::default()
        };
        if let Some(root) = self.scratch_root {
            config.scratch_root = root;
        }

        let memory = self.memory_mb * MIB;
        config.run_limits = ResourceLimits {
            virtual_memory: Some(memory),
            resident_memory: memory,
            cpu_seconds: self.cpu_secs,
            stack: self.stack_mb * MIB,
            open_files: self.nofile,
            processes: self.nproc,
        };
        let instrumented = &mut config.instrumented_limits;
        instrumented.cpu_seconds = instrumented.cpu_seconds.max(self.cpu_secs);
        instrumented.stack = self.stack_mb * MIB;
        instrumented.processes = instrumented.processes.max(self.nproc);

        let tools = &mut config.toolchain;
        for (slot, value) in [
            (&mut tools.gcc, self.gcc),
            (&mut tools.gxx, self.gxx),
            (&mut tools.clang, self.clang),
            (&mut tools.clangxx, self.clangxx),
            (&mut tools.gdb, self.gdb),
            (&mut tools.valgrind, self.valgrind),
            (&mut tools.strace, self.strace),
        ] {
            if let Some(path) = value {
                *slot = path;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.default_size, TermSize { cols: 80, rows: 24 });
        assert_eq!(config.max_session_age, Duration::from_secs(600));
        assert_eq!(config.validation.max_chars, 50_000);
        assert!(config.instrumented_limits.virtual_memory.is_none());
        assert_eq!(config.run_limits.processes, 256);
        assert_eq!(config.event_queue, 256);
    }

    #[test]
    fn test_args_into_config() {
        let cli = Cli::parse_from([
            "test",
            "--port",
            "9000",
            "--bind",
            "127.0.0.1",
            "--cpu-secs",
            "5",
            "--memory-mb",
            "128",
            "--nproc",
            "32",
            "--gcc",
            "/opt/gcc/bin/gcc",
        ]);
        let config = cli.serve.into_config();
        assert_eq!(config.bind, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.run_limits.cpu_seconds, 5);
        assert_eq!(config.run_limits.virtual_memory, Some(128 * MIB));
        assert_eq!(config.run_limits.processes, 32);
        assert_eq!(config.instrumented_limits.processes, 512);
        assert_eq!(config.toolchain.gcc, PathBuf::from("/opt/gcc/bin/gcc"));
        assert_eq!(config.toolchain.gxx, PathBuf::from("g++"));
    }
}
