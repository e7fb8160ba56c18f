//! Crate-wide error type.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the controller pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed configuration, rule or property input.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The HymoFS kernel channel is not present.
    #[error("HymoFS kernel channel not available")]
    KernelUnavailable,

    /// The kernel speaks a different protocol revision.
    #[error("HymoFS protocol mismatch: {0}")]
    KernelVersionMismatch(String),

    /// A mount operation failed for a specific target.
    #[error("mount failed for {}: {source}", target.display())]
    Mount {
        target: PathBuf,
        source: std::io::Error,
    },

    /// The planner could not produce a usable plan.
    #[error("plan error: {0}")]
    Plan(String),
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Error::Io(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
