//! Child process plumbing: spawning, exit classification and program
//! lookup.

pub mod exit;
pub mod program;
pub mod spawner;

use thiserror::Error;

pub use exit::{ExitKind, ExitStatus, classify_exit_status, signal_name};
pub use program::{WindowManagerInfo, available_window_managers, find_program};
pub use spawner::{SpawnedProcess, run_to_completion, spawn};

/// Errors raised while creating or waiting on a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be created.
    #[error("failed to spawn '{program}': {reason}")]
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// OS-level reason.
        reason: String,
    },

    /// Waiting on the process failed.
    #[error("failed to wait on '{program}': {reason}")]
    WaitFailed {
        /// Program being waited on.
        program: String,
        /// OS-level reason.
        reason: String,
    },

    /// The process did not finish in time and was killed.
    #[error("'{program}' did not finish within {timeout:?}")]
    TimedOut {
        /// Program that timed out.
        program: String,
        /// The bound that was exceeded.
        timeout: std::time::Duration,
    },
}
