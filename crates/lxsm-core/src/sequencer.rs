//! Startup sequencer.
//!
//! Owns the session phase and starts modules in phase order: the window
//! manager first, then every autostart module that does not need a tray,
//! then the tray-dependent ones once a tray is available. Waiting itself is
//! done by the session control loop; the sequencer only decides what comes
//! next.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::descriptor::ModuleDescriptor;
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, UserAlert};
use crate::registry::ModuleRegistry;

/// Session phase. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPhase {
    /// Nothing has happened yet.
    Init,
    /// The configuration migration helper runs.
    ConfUpdate,
    /// The window manager is being started.
    StartingWM,
    /// The window manager manages the display.
    WMReady,
    /// Autostart modules that need no tray are being started.
    StartingAutostart,
    /// Waiting for a system tray.
    WaitingTray,
    /// A tray is available; tray-dependent modules are being started.
    TrayReady,
    /// Steady state.
    Running,
    /// Every module is being terminated.
    LoggingOut,
    /// Every module is gone.
    Terminated,
}

impl SessionPhase {
    /// Whether the session is shutting down.
    #[must_use]
    pub fn is_ending(self) -> bool {
        self >= Self::LoggingOut
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::ConfUpdate => "conf-update",
            Self::StartingWM => "starting-wm",
            Self::WMReady => "wm-ready",
            Self::StartingAutostart => "starting-autostart",
            Self::WaitingTray => "waiting-tray",
            Self::TrayReady => "tray-ready",
            Self::Running => "running",
            Self::LoggingOut => "logging-out",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// What the sequencer needs before it can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Wait for the window manager to claim the display.
    AwaitWindowManager,
    /// Wait for a system tray.
    AwaitTray,
    /// Startup is complete.
    Done,
}

/// Drives the session through its startup phases.
#[derive(Debug)]
pub struct StartupSequencer {
    phase: SessionPhase,
    events: EventBus,
    tray_dependent: Vec<Arc<ModuleDescriptor>>,
}

impl StartupSequencer {
    /// Creates a sequencer in [`SessionPhase::Init`].
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            phase: SessionPhase::Init,
            events,
            tray_dependent: Vec::new(),
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Moves to `next`. Re-entering the current phase is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PhaseRegression` if `next` precedes the
    /// current phase.
    pub fn advance(&mut self, next: SessionPhase) -> Result<(), SessionError> {
        if next < self.phase {
            return Err(SessionError::PhaseRegression {
                from: self.phase,
                to: next,
            });
        }
        if next == self.phase {
            return Ok(());
        }
        info!(from = %self.phase, to = %next, "session phase changed");
        self.phase = next;
        self.events.emit(SessionEvent::PhaseChanged(next));
        Ok(())
    }

    /// Starts the window manager.
    ///
    /// # Errors
    ///
    /// A spawn failure is fatal: it is raised as a user alert and returned
    /// as `SessionError::WindowManagerUnavailable`.
    pub fn start_window_manager(
        &mut self,
        registry: &mut ModuleRegistry,
        window_manager: Arc<ModuleDescriptor>,
    ) -> Result<NextStep, SessionError> {
        self.advance(SessionPhase::StartingWM)?;
        let command = window_manager.program.clone();
        match registry.start(window_manager) {
            Ok(pid) => {
                info!(window_manager = %command, pid, "window manager started");
                Ok(NextStep::AwaitWindowManager)
            },
            Err(e) => {
                error!(window_manager = %command, "failed to start window manager: {e}");
                self.events.emit(SessionEvent::Alert(UserAlert::WindowManagerFailed {
                    command,
                    reason: e.to_string(),
                }));
                Err(SessionError::WindowManagerUnavailable {
                    reason: e.to_string(),
                })
            },
        }
    }

    /// Called once the window manager is ready (or its wait timed out).
    /// Starts every autostart module that needs no tray, in order, and
    /// holds back the rest.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PhaseRegression` if the session already moved
    /// past startup.
    pub fn start_autostart(
        &mut self,
        registry: &mut ModuleRegistry,
        autostart: Vec<Arc<ModuleDescriptor>>,
    ) -> Result<NextStep, SessionError> {
        self.advance(SessionPhase::WMReady)?;
        self.advance(SessionPhase::StartingAutostart)?;

        let (tray_dependent, immediate): (Vec<_>, Vec<_>) =
            autostart.into_iter().partition(|d| d.requires_tray);
        start_each(registry, immediate);

        if tray_dependent.is_empty() {
            self.advance(SessionPhase::Running)?;
            return Ok(NextStep::Done);
        }

        info!(
            pending = tray_dependent.len(),
            "waiting for a system tray before starting the remaining modules"
        );
        self.tray_dependent = tray_dependent;
        self.advance(SessionPhase::WaitingTray)?;
        Ok(NextStep::AwaitTray)
    }

    /// Called once a tray is available. Starts the tray-dependent modules
    /// and settles into [`SessionPhase::Running`].
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PhaseRegression` if the session already moved
    /// past startup.
    pub fn start_tray_dependent(
        &mut self,
        registry: &mut ModuleRegistry,
    ) -> Result<NextStep, SessionError> {
        self.advance(SessionPhase::TrayReady)?;
        start_each(registry, std::mem::take(&mut self.tray_dependent));
        self.advance(SessionPhase::Running)?;
        Ok(NextStep::Done)
    }
}

fn start_each(registry: &mut ModuleRegistry, descriptors: Vec<Arc<ModuleDescriptor>>) {
    for descriptor in descriptors {
        let name = descriptor.name.clone();
        if let Err(e) = registry.start(descriptor) {
            warn!(module = %name, "failed to start autostart module: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentBuilder;

    fn setup() -> (StartupSequencer, ModuleRegistry, EventBus) {
        let events = EventBus::new();
        let (registry, _exit_rx) =
            ModuleRegistry::new(EnvironmentBuilder::from_process().build(), events.clone());
        (StartupSequencer::new(events.clone()), registry, events)
    }

    fn module(name: &str, requires_tray: bool) -> Arc<ModuleDescriptor> {
        Arc::new(ModuleDescriptor::new(name, "sleep", ["30"]).requiring_tray(requires_tray))
    }

    #[test]
    fn test_phase_order() {
        assert!(SessionPhase::Init < SessionPhase::ConfUpdate);
        assert!(SessionPhase::WaitingTray < SessionPhase::TrayReady);
        assert!(SessionPhase::Running < SessionPhase::LoggingOut);
        assert!(SessionPhase::LoggingOut.is_ending());
        assert!(!SessionPhase::Running.is_ending());
    }

    #[test]
    fn test_advance_rejects_regression() {
        let (mut sequencer, _registry, _) = setup();
        sequencer.advance(SessionPhase::Running).unwrap();

        let err = sequencer.advance(SessionPhase::StartingWM).unwrap_err();
        assert!(matches!(
            err,
            SessionError::PhaseRegression {
                from: SessionPhase::Running,
                to: SessionPhase::StartingWM,
            }
        ));
        assert_eq!(sequencer.phase(), SessionPhase::Running);
    }

    #[tokio::test]
    async fn test_advance_emits_phase_changes_once() {
        let (mut sequencer, _registry, events) = setup();
        let mut rx = events.subscribe();

        sequencer.advance(SessionPhase::ConfUpdate).unwrap();
        sequencer.advance(SessionPhase::ConfUpdate).unwrap();
        sequencer.advance(SessionPhase::StartingWM).unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::PhaseChanged(SessionPhase::ConfUpdate)
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::PhaseChanged(SessionPhase::StartingWM)
        );
    }

    #[tokio::test]
    async fn test_window_manager_spawn_failure_is_fatal() {
        let (mut sequencer, mut registry, events) = setup();
        let mut rx = events.subscribe();
        let wm = Arc::new(ModuleDescriptor::window_manager("/nonexistent/lxsm-wm").unwrap());

        let err = sequencer
            .start_window_manager(&mut registry, wm)
            .unwrap_err();
        assert!(matches!(err, SessionError::WindowManagerUnavailable { .. }));

        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::PhaseChanged(SessionPhase::StartingWM)
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SessionEvent::Alert(UserAlert::WindowManagerFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_autostart_without_tray_modules_skips_wait() {
        let (mut sequencer, mut registry, _) = setup();

        let next = sequencer
            .start_autostart(&mut registry, vec![module("panel", false)])
            .unwrap();

        assert_eq!(next, NextStep::Done);
        assert_eq!(sequencer.phase(), SessionPhase::Running);
        assert!(registry.contains("panel"));
        registry.kill_all();
    }

    #[tokio::test]
    async fn test_tray_modules_are_held_back() {
        let (mut sequencer, mut registry, _) = setup();

        let next = sequencer
            .start_autostart(
                &mut registry,
                vec![module("panel", false), module("tray-app", true)],
            )
            .unwrap();
        assert_eq!(next, NextStep::AwaitTray);
        assert_eq!(sequencer.phase(), SessionPhase::WaitingTray);
        assert!(registry.contains("panel"));
        assert!(!registry.contains("tray-app"));

        let next = sequencer.start_tray_dependent(&mut registry).unwrap();
        assert_eq!(next, NextStep::Done);
        assert_eq!(sequencer.phase(), SessionPhase::Running);
        assert!(registry.contains("tray-app"));
        registry.kill_all();
    }

    #[tokio::test]
    async fn test_autostart_spawn_failure_does_not_abort() {
        let (mut sequencer, mut registry, _) = setup();
        let broken = Arc::new(ModuleDescriptor::new(
            "broken",
            "/nonexistent/lxsm-module",
            Vec::<String>::new(),
        ));

        sequencer
            .start_autostart(&mut registry, vec![broken, module("panel", false)])
            .unwrap();

        assert!(!registry.contains("broken"));
        assert!(registry.contains("panel"));
        registry.kill_all();
    }
}
