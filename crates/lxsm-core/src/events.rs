//! Session event bus.
//!
//! A one-to-many, fire-and-forget broadcast of session events. Any number
//! of observers (a panel, a logger, a test harness) subscribe
//! independently; the supervisor never waits for acknowledgment and a
//! bus without subscribers silently drops events.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::sequencer::SessionPhase;

const EVENT_BUS_CAPACITY: usize = 256;

/// An event published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A module started (`running == true`) or stopped.
    ModuleStateChanged {
        /// Module name.
        name: String,
        /// Whether the module is now running.
        running: bool,
    },
    /// The session entered a new phase.
    PhaseChanged(SessionPhase),
    /// The active theme changed or was re-validated.
    ThemeChanged {
        /// Theme name.
        name: String,
        /// Theme directory.
        path: PathBuf,
    },
    /// Something the user should see.
    Alert(UserAlert),
}

/// User-visible errors and warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAlert {
    /// The window manager could not be started; the session cannot run.
    WindowManagerFailed {
        /// Window manager command.
        command: String,
        /// Why it failed.
        reason: String,
    },
    /// A module crashed too often and will not be restarted.
    CrashFlood {
        /// Module name.
        name: String,
        /// Human-readable module name.
        label: String,
        /// Crashes counted in the flood-control window.
        crashes: usize,
    },
    /// A readiness check cannot run; modules waiting on it may never start.
    ReadinessCheckFailed {
        /// Check command.
        command: String,
        /// Why it cannot run.
        reason: String,
    },
    /// The active theme disappeared and the default theme took over.
    ThemeFallback {
        /// The theme that vanished.
        from: String,
        /// The theme now active.
        to: String,
    },
}

impl UserAlert {
    /// Whether the alert describes a fatal condition.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::WindowManagerFailed { .. })
    }

    /// One-line summary.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        match self {
            Self::WindowManagerFailed { .. } => "Window manager failed to start",
            Self::CrashFlood { .. } => "Module keeps crashing",
            Self::ReadinessCheckFailed { .. } => "Readiness check failed",
            Self::ThemeFallback { .. } => "Theme not found",
        }
    }
}

impl fmt::Display for UserAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WindowManagerFailed { command, reason } => write!(
                f,
                "The window manager '{command}' could not be started: {reason}. The session cannot continue."
            ),
            Self::CrashFlood { label, crashes, .. } => write!(
                f,
                "'{label}' crashed {crashes} times in a short period and will not be restarted."
            ),
            Self::ReadinessCheckFailed { command, reason } => write!(
                f,
                "The readiness check '{command}' cannot run: {reason}. Modules waiting for it may not start."
            ),
            Self::ThemeFallback { from, to } => write!(
                f,
                "The theme '{from}' is no longer available; switched to '{to}'."
            ),
        }
    }
}

/// Broadcast sender shared by every component that publishes events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Never blocks and never fails.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::PhaseChanged(SessionPhase::Running));
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(SessionEvent::ModuleStateChanged {
            name: "panel".to_string(),
            running: true,
        });

        for rx in [&mut first, &mut second] {
            assert_eq!(
                rx.recv().await.unwrap(),
                SessionEvent::ModuleStateChanged {
                    name: "panel".to_string(),
                    running: true,
                }
            );
        }
    }

    #[test]
    fn test_alert_text() {
        let alert = UserAlert::CrashFlood {
            name: "panel".to_string(),
            label: "Panel".to_string(),
            crashes: 3,
        };
        assert!(!alert.is_error());
        assert!(alert.to_string().contains("'Panel' crashed 3 times"));

        let fatal = UserAlert::WindowManagerFailed {
            command: "openbox".to_string(),
            reason: "not found".to_string(),
        };
        assert!(fatal.is_error());
        assert_eq!(fatal.summary(), "Window manager failed to start");

        let check = UserAlert::ReadinessCheckFailed {
            command: "xprop".to_string(),
            reason: "not found".to_string(),
        };
        assert!(!check.is_error());
        assert!(check.to_string().contains("'xprop' cannot run"));
    }
}
