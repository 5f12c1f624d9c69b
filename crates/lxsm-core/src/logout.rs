//! Logout controller.
//!
//! Teardown is deadline-driven: every module gets SIGTERM, modules still
//! alive after the grace period get SIGKILL, and once the kill timeout has
//! also passed the controller gives up waiting. The control loop calls
//! [`LogoutController::on_deadline`] whenever [`LogoutController::deadline`]
//! elapses.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SessionError;
use crate::registry::ModuleRegistry;
use crate::sequencer::{SessionPhase, StartupSequencer};

/// `[logout]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutConfig {
    /// Time modules get to exit after SIGTERM.
    #[serde(default = "default_grace_period")]
    #[serde(with = "crate::config::humantime_serde")]
    pub grace_period: Duration,

    /// Time to wait for killed modules to be reaped.
    #[serde(default = "default_kill_timeout")]
    #[serde(with = "crate::config::humantime_serde")]
    pub kill_timeout: Duration,
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

const fn default_kill_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for LogoutConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            kill_timeout: default_kill_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    Terminating { kill_at: Instant },
    Killing { give_up_at: Instant },
    Finished,
}

/// Drives session teardown.
#[derive(Debug)]
pub struct LogoutController {
    config: LogoutConfig,
    stage: Stage,
}

impl LogoutController {
    /// Creates an idle controller.
    #[must_use]
    pub const fn new(config: LogoutConfig) -> Self {
        Self {
            config,
            stage: Stage::Idle,
        }
    }

    /// Starts the teardown: enters [`SessionPhase::LoggingOut`] and sends
    /// SIGTERM to every module. Returns `false` if a logout is already in
    /// progress or finished.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::PhaseRegression` if the session already
    /// terminated.
    pub fn begin(
        &mut self,
        sequencer: &mut StartupSequencer,
        registry: &mut ModuleRegistry,
        now: Instant,
    ) -> Result<bool, SessionError> {
        if self.stage != Stage::Idle {
            info!("logout already in progress");
            return Ok(false);
        }

        sequencer.advance(SessionPhase::LoggingOut)?;
        info!(modules = registry.len(), grace_period = ?self.config.grace_period, "logging out");
        registry.terminate_all();
        self.stage = Stage::Terminating {
            kill_at: now + self.config.grace_period,
        };
        Ok(true)
    }

    /// Whether a logout has been requested.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }

    /// Whether the teardown is complete.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Finished
    }

    /// When [`Self::on_deadline`] must be called next.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        match self.stage {
            Stage::Terminating { kill_at } => Some(kill_at),
            Stage::Killing { give_up_at } => Some(give_up_at),
            Stage::Idle | Stage::Finished => None,
        }
    }

    /// Advances the teardown once the current deadline has passed: first
    /// SIGKILL for every remaining module, then giving up on them.
    pub fn on_deadline(&mut self, registry: &mut ModuleRegistry, now: Instant) {
        match self.stage {
            Stage::Terminating { .. } => {
                warn!(
                    remaining = registry.len(),
                    "grace period elapsed, force-killing remaining modules"
                );
                registry.kill_all();
                self.stage = Stage::Killing {
                    give_up_at: now + self.config.kill_timeout,
                };
            },
            Stage::Killing { .. } => {
                warn!(
                    remaining = ?registry.list().collect::<Vec<_>>(),
                    "modules did not exit after SIGKILL, giving up"
                );
                self.stage = Stage::Finished;
            },
            Stage::Idle | Stage::Finished => {},
        }
    }

    /// Marks the teardown complete when no module is left. Returns whether
    /// the teardown is complete.
    pub fn check_finished(&mut self, registry: &ModuleRegistry) -> bool {
        if self.is_active() && registry.is_empty() {
            self.stage = Stage::Finished;
        }
        self.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::descriptor::ModuleDescriptor;
    use crate::environment::EnvironmentBuilder;
    use crate::events::EventBus;
    use crate::registry::ExitNotice;

    fn setup() -> (
        StartupSequencer,
        ModuleRegistry,
        mpsc::UnboundedReceiver<ExitNotice>,
    ) {
        let events = EventBus::new();
        let (registry, exit_rx) =
            ModuleRegistry::new(EnvironmentBuilder::from_process().build(), events.clone());
        (StartupSequencer::new(events), registry, exit_rx)
    }

    fn config() -> LogoutConfig {
        LogoutConfig {
            grace_period: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_begin_is_idempotent() {
        let (mut sequencer, mut registry, _exit_rx) = setup();
        let mut logout = LogoutController::new(config());
        let now = Instant::now();

        assert!(logout.begin(&mut sequencer, &mut registry, now).unwrap());
        assert!(!logout.begin(&mut sequencer, &mut registry, now).unwrap());
        assert_eq!(sequencer.phase(), SessionPhase::LoggingOut);
        assert_eq!(logout.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_empty_registry_finishes_immediately() {
        let (mut sequencer, mut registry, _exit_rx) = setup();
        let mut logout = LogoutController::new(config());

        assert!(!logout.check_finished(&registry));
        logout
            .begin(&mut sequencer, &mut registry, Instant::now())
            .unwrap();
        assert!(logout.check_finished(&registry));
        assert_eq!(logout.deadline(), None);
    }

    #[tokio::test]
    async fn test_deadlines_escalate_then_give_up() {
        let (mut sequencer, mut registry, _exit_rx) = setup();
        let mut logout = LogoutController::new(config());
        registry
            .start(Arc::new(ModuleDescriptor::new(
                "stubborn",
                "sh",
                ["-c", "trap '' TERM; sleep 30"],
            )))
            .unwrap();

        let start = Instant::now();
        logout.begin(&mut sequencer, &mut registry, start).unwrap();
        assert!(registry.get("stubborn").unwrap().is_terminating());

        let kill_at = logout.deadline().unwrap();
        logout.on_deadline(&mut registry, kill_at);
        assert_eq!(logout.deadline(), Some(kill_at + Duration::from_secs(1)));
        assert!(!logout.check_finished(&registry));

        logout.on_deadline(&mut registry, kill_at + Duration::from_secs(1));
        assert!(logout.is_finished());
        assert_eq!(logout.deadline(), None);
    }

    #[tokio::test]
    async fn test_logout_after_terminated_is_rejected() {
        let (mut sequencer, mut registry, _exit_rx) = setup();
        sequencer.advance(SessionPhase::Terminated).unwrap();

        let mut logout = LogoutController::new(config());
        let err = logout
            .begin(&mut sequencer, &mut registry, Instant::now())
            .unwrap_err();
        assert!(matches!(err, SessionError::PhaseRegression { .. }));
    }
}
