//! Session-level errors.

use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::sequencer::SessionPhase;

/// Errors that end the session abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// No window manager could be started.
    #[error("no window manager available: {reason}")]
    WindowManagerUnavailable {
        /// Why the window manager could not be started.
        reason: String,
    },

    /// The session is shutting down or has ended.
    #[error("session is not running")]
    NotRunning,

    /// A phase transition would move the session backwards.
    #[error("invalid phase transition from {from} to {to}")]
    PhaseRegression {
        /// Current phase.
        from: SessionPhase,
        /// Requested phase.
        to: SessionPhase,
    },
}
