//! Error types for session handling.

use thiserror::Error;

use crate::validator::Rejection;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Validation(#[from] Rejection),

    #[error("unsupported toolchain: {0}")]
    Toolchain(String),

    #[error("workspace error: {0}")]
    Workspace(std::io::Error),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("pty error: {0}")]
    Pty(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
