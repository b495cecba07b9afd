//! Error types for divvy.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for divvy.
#[derive(Error, Debug)]
pub enum DivvyError {
    #[error("invalid worker count {0}: at least one worker is required")]
    WorkerCount(usize),

    #[error("task file {path}: {message}")]
    TaskFile { path: PathBuf, message: String },

    #[error("cannot bind rendezvous socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("work item of {size} bytes exceeds the {limit}-byte frame limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("command `{command}` exited with {status}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// Result type alias for divvy operations.
pub type Result<T> = std::result::Result<T, DivvyError>;
