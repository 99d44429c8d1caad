//! Sandboxed compile, run, debug, leak-check and syscall-trace sessions.
//!
//! Untrusted C/C++ source is screened by [`validator`], built and executed
//! under OS resource limits on a pseudo-terminal by [`sandbox`], driven through
//! its lifecycle by [`session`], and torn down exactly once by [`reaper`].
//! [`http_server`] exposes sessions over a WebSocket.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod config;
pub mod error;
pub mod events;
pub mod http_server;
pub mod reaper;
pub mod report;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod templates;
pub mod toolchain;
pub mod validator;

pub use config::ServerConfig;
pub use error::{Result, SessionError};
pub use session::{SessionController, StartOutcome};
