//! The session control loop.
//!
//! A [`Session`] owns every piece of supervision state and mutates it from a
//! single task. Child exits, control commands, platform notifications,
//! readiness waits, logout deadlines, theme changes and the crash-history
//! sweep are multiplexed with `tokio::select!`; each handler runs to
//! completion before the next event is looked at.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{self, SessionConfig};
use crate::crash::{CrashDecision, CrashMonitor};
use crate::descriptor::{ConfigResolver, DescriptorResolver, ModuleDescriptor};
use crate::environment::{EnvTemplate, EnvironmentBuilder};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, UserAlert};
use crate::logout::LogoutController;
use crate::probe::CommandProbe;
use crate::process::{self, WindowManagerInfo};
use crate::readiness::{PlatformEvent, Readiness, ReadinessProbe, ReadinessWatcher, ReadySignal};
use crate::registry::{ExitNotice, ModuleRegistry, RegistryError};
use crate::sequencer::{NextStep, SessionPhase, StartupSequencer};
use crate::theme::{self, FsChange, ThemeChange, ThemeWatcher};

/// Picks a window manager when none is configured.
pub trait WindowManagerSelector: Send {
    /// Returns the chosen command line, or `None` if the user declined.
    /// May block; it is run on the blocking thread pool.
    fn select(&mut self, candidates: &[WindowManagerInfo]) -> Option<String>;
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogoutReason {
    /// `logout()` was called.
    Requested,
    /// A non-essential module (normally the window manager) exited.
    ModuleExited(String),
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "logout requested"),
            Self::ModuleExited(name) => write!(f, "'{name}' exited"),
        }
    }
}

/// Result of a session that ended through logout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// What triggered the logout.
    pub reason: LogoutReason,
}

/// Requests processed by the control loop.
#[derive(Debug)]
pub enum SessionCommand {
    /// End the session.
    Logout,
    /// Start a module by name.
    StartModule {
        /// Module name, resolved through the descriptor resolver.
        name: String,
        /// Receives the PID or the failure.
        reply: oneshot::Sender<Result<u32, SessionError>>,
    },
    /// Stop a running module.
    StopModule {
        /// Module name.
        name: String,
        /// Receives the outcome.
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Clonable handle for talking to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    platform: mpsc::UnboundedSender<PlatformEvent>,
    events: EventBus,
}

impl SessionHandle {
    /// Requests logout. Repeated requests are no-ops.
    pub fn logout(&self) {
        if self.commands.send(SessionCommand::Logout).is_err() {
            debug!("logout requested after the session ended");
        }
    }

    /// Starts the named module.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Registry` if the name is unknown, already
    /// running or cannot be spawned, and `SessionError::NotRunning` once
    /// the session is ending.
    pub async fn start_module(&self, name: impl Into<String>) -> Result<u32, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::StartModule {
                name: name.into(),
                reply,
            })
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.map_err(|_| SessionError::NotRunning)?
    }

    /// Stops the named module. The stop does not count as a crash.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Registry` if the module is not running, and
    /// `SessionError::NotRunning` once the session has ended.
    pub async fn stop_module(&self, name: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::StopModule {
                name: name.into(),
                reply,
            })
            .map_err(|_| SessionError::NotRunning)?;
        rx.await.map_err(|_| SessionError::NotRunning)?
    }

    /// Subscribes to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Sender for raw platform notifications.
    #[must_use]
    pub fn platform_events(&self) -> mpsc::UnboundedSender<PlatformEvent> {
        self.platform.clone()
    }
}

#[derive(Debug)]
struct PendingWait {
    readiness: Readiness,
    signal: ReadySignal,
    deadline: Option<Instant>,
}

/// A desktop session.
pub struct Session {
    config: SessionConfig,
    config_path: Option<PathBuf>,
    resolver: Box<dyn DescriptorResolver>,
    selector: Option<Box<dyn WindowManagerSelector>>,
    events: EventBus,
    env: Arc<EnvTemplate>,
    registry: ModuleRegistry,
    exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    crash: CrashMonitor,
    sequencer: StartupSequencer,
    logout: LogoutController,
    logout_reason: Option<LogoutReason>,
    readiness: ReadinessWatcher,
    pending: Option<PendingWait>,
    probes: Vec<JoinHandle<()>>,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    platform_tx: mpsc::UnboundedSender<PlatformEvent>,
    platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
    theme: Option<ThemeWatcher>,
    theme_tx: mpsc::UnboundedSender<FsChange>,
    theme_rx: mpsc::UnboundedReceiver<FsChange>,
}

impl Session {
    /// Creates a session from its configuration. The environment template
    /// is computed here, once, from the process environment and the
    /// `[environment]` section.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let events = EventBus::new();
        let mut env = EnvironmentBuilder::from_process();
        env.apply(&config.environment);
        let env = env.build();

        let (registry, exit_rx) = ModuleRegistry::new(Arc::clone(&env), events.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (theme_tx, theme_rx) = mpsc::unbounded_channel();

        Self {
            resolver: Box::new(ConfigResolver::from_entries(&config.autostart)),
            selector: None,
            config_path: None,
            crash: CrashMonitor::new(config.flood_control.clone()),
            sequencer: StartupSequencer::new(events.clone()),
            logout: LogoutController::new(config.logout.clone()),
            logout_reason: None,
            readiness: ReadinessWatcher::new(config.readiness.screen),
            pending: None,
            probes: Vec::new(),
            theme: None,
            config,
            events,
            env,
            registry,
            exit_rx,
            commands_tx,
            commands_rx,
            platform_tx,
            platform_rx,
            theme_tx,
            theme_rx,
        }
    }

    /// Replaces the descriptor resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl DescriptorResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Sets the prompt used when no window manager is configured.
    #[must_use]
    pub fn with_selector(mut self, selector: impl WindowManagerSelector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    /// Sets the configuration file the selected window manager is saved to.
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Returns a handle for controlling the session.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            platform: self.platform_tx.clone(),
            events: self.events.clone(),
        }
    }

    /// The environment every module is spawned with.
    #[must_use]
    pub fn environment(&self) -> &Arc<EnvTemplate> {
        &self.env
    }

    /// Runs the session until logout completes.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::WindowManagerUnavailable` if no window manager
    /// could be started.
    pub async fn run(mut self) -> Result<SessionOutcome, SessionError> {
        self.sequencer.advance(SessionPhase::ConfUpdate)?;
        self.run_conf_update().await;

        let command = self.resolve_window_manager().await?;
        let Some(window_manager) = ModuleDescriptor::window_manager(&command) else {
            return Err(self.window_manager_unavailable(&command, "empty command"));
        };
        let step = self
            .sequencer
            .start_window_manager(&mut self.registry, Arc::new(window_manager))?;
        self.watch_theme();
        self.continue_startup(step)?;

        let mut sweep = tokio::time::interval(self.crash.config().sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.logout.check_finished(&self.registry) {
            let wait_deadline = self.pending.as_ref().and_then(|wait| wait.deadline);
            let logout_deadline = self.logout.deadline();

            tokio::select! {
                Some(notice) = self.exit_rx.recv() => self.on_exit(&notice)?,
                Some(command) = self.commands_rx.recv() => self.on_command(command)?,
                Some(event) = self.platform_rx.recv() => {
                    self.readiness.observe(&event);
                },
                readiness = wait_pending(&mut self.pending) => self.on_ready(readiness)?,
                () = sleep_until_opt(wait_deadline) => self.on_wait_timeout()?,
                () = sleep_until_opt(logout_deadline) => {
                    self.logout.on_deadline(&mut self.registry, Instant::now());
                },
                Some(change) = self.theme_rx.recv() => self.on_theme_change(&change),
                _ = sweep.tick() => {
                    self.crash.sweep(Instant::now());
                },
            }
        }

        self.sequencer.advance(SessionPhase::Terminated)?;
        let reason = self.logout_reason.take().unwrap_or(LogoutReason::Requested);
        info!(%reason, "session terminated");
        Ok(SessionOutcome { reason })
    }

    async fn run_conf_update(&self) {
        let Some(argv) = &self.config.session.conf_update else {
            return;
        };
        let timeout = self.config.session.conf_update_timeout;
        match process::run_to_completion(argv, &self.env, timeout).await {
            Ok(status) if status.kind().exit_code() == Some(0) => {
                info!("configuration update finished");
            },
            Ok(status) => warn!(%status, "configuration update failed"),
            Err(e) => warn!("configuration update did not complete: {e}"),
        }
    }

    async fn resolve_window_manager(&mut self) -> Result<String, SessionError> {
        if let Some(command) = self
            .config
            .session
            .window_manager
            .clone()
            .filter(|command| !command.trim().is_empty())
        {
            return Ok(command);
        }

        let candidates =
            process::available_window_managers(&self.config.session.known_window_managers, true);
        let Some(mut selector) = self.selector.take() else {
            return Err(self.window_manager_unavailable("", "no window manager configured"));
        };

        info!(candidates = candidates.len(), "no window manager configured, asking the user");
        let choice = tokio::task::spawn_blocking(move || selector.select(&candidates))
            .await
            .unwrap_or_else(|e| {
                warn!("window manager prompt failed: {e}");
                None
            });
        let Some(command) = choice.filter(|command| !command.trim().is_empty()) else {
            return Err(self.window_manager_unavailable("", "no window manager selected"));
        };

        if let Some(path) = &self.config_path {
            match config::persist_window_manager(path, &command) {
                Ok(()) => {
                    info!(
                        window_manager = %command,
                        path = %path.display(),
                        "saved window manager choice"
                    );
                },
                Err(e) => {
                    warn!(path = %path.display(), "failed to save window manager choice: {e}");
                },
            }
        }
        Ok(command)
    }

    fn window_manager_unavailable(&self, command: &str, reason: &str) -> SessionError {
        error!(window_manager = %command, "{reason}");
        self.events
            .emit(SessionEvent::Alert(UserAlert::WindowManagerFailed {
                command: command.to_string(),
                reason: reason.to_string(),
            }));
        SessionError::WindowManagerUnavailable {
            reason: reason.to_string(),
        }
    }

    /// Moves the sequencer forward until it has to wait for a condition
    /// that does not hold yet.
    fn continue_startup(&mut self, mut step: NextStep) -> Result<(), SessionError> {
        loop {
            let readiness = match step {
                NextStep::AwaitWindowManager => Readiness::WindowManager,
                NextStep::AwaitTray => Readiness::Tray,
                NextStep::Done => {
                    self.pending = None;
                    return Ok(());
                },
            };

            let signal = match readiness {
                Readiness::WindowManager => self.readiness.window_manager_ready(),
                Readiness::Tray => self.readiness.tray_available(),
            };
            if !signal.is_ready() {
                self.start_probe(readiness);
                let deadline = match readiness {
                    Readiness::WindowManager => self
                        .config
                        .readiness
                        .window_manager_deadline()
                        .map(|timeout| Instant::now() + timeout),
                    Readiness::Tray => None,
                };
                debug!(?readiness, "waiting for readiness");
                self.pending = Some(PendingWait {
                    readiness,
                    signal,
                    deadline,
                });
                return Ok(());
            }
            step = self.resume(readiness)?;
        }
    }

    fn resume(&mut self, readiness: Readiness) -> Result<NextStep, SessionError> {
        match readiness {
            Readiness::WindowManager => {
                let autostart = self.resolver.autostart();
                self.sequencer.start_autostart(&mut self.registry, autostart)
            },
            Readiness::Tray => self.sequencer.start_tray_dependent(&mut self.registry),
        }
    }

    /// Starts the configured probe command for `readiness`, if any.
    /// Without one the condition is left to platform events.
    fn start_probe(&mut self, readiness: Readiness) {
        let settings = &self.config.readiness;
        let (argv, event) = match readiness {
            Readiness::WindowManager => (
                settings.window_manager_probe.clone(),
                PlatformEvent::window_manager_claimed(),
            ),
            Readiness::Tray => (
                settings.tray_probe.clone(),
                PlatformEvent::tray_claimed(settings.screen, 0),
            ),
        };
        let Some(argv) = argv.filter(|argv| !argv.is_empty()) else {
            info!(?readiness, "waiting for platform notification");
            return;
        };
        let probe = CommandProbe::new(argv, settings.probe_interval, event);
        self.probes.push(probe.spawn(
            Arc::clone(&self.env),
            self.platform_tx.clone(),
            self.events.clone(),
        ));
    }

    fn on_ready(&mut self, readiness: Readiness) -> Result<(), SessionError> {
        self.pending = None;
        let step = self.resume(readiness)?;
        self.continue_startup(step)
    }

    fn on_wait_timeout(&mut self) -> Result<(), SessionError> {
        let Some(wait) = self.pending.take() else {
            return Ok(());
        };
        warn!(
            readiness = ?wait.readiness,
            timeout = ?self.config.readiness.window_manager_timeout,
            "readiness not reported in time, continuing anyway"
        );
        let step = self.resume(wait.readiness)?;
        self.continue_startup(step)
    }

    fn on_exit(&mut self, notice: &ExitNotice) -> Result<(), SessionError> {
        let Some(module) = self.registry.reap(notice) else {
            return Ok(());
        };
        let descriptor = Arc::clone(module.descriptor());
        let terminating = module.is_terminating() || self.logout.is_active();
        let decision = self
            .crash
            .evaluate(&descriptor, terminating, notice.status, Instant::now());

        match decision {
            CrashDecision::Expected | CrashDecision::LeaveStopped => {
                info!(module = %notice.name, status = %notice.status, %decision, "module exited");
            },
            CrashDecision::AlreadyAbandoned => {
                warn!(module = %notice.name, status = %notice.status, %decision, "module exited");
            },
            CrashDecision::EndSession => {
                warn!(
                    module = %notice.name,
                    status = %notice.status,
                    %decision,
                    "session module exited"
                );
                self.request_logout(LogoutReason::ModuleExited(notice.name.clone()))?;
            },
            CrashDecision::Restart { .. } => {
                warn!(module = %notice.name, status = %notice.status, %decision, "module crashed");
                if let Err(e) = self.registry.start(descriptor) {
                    warn!(module = %notice.name, "failed to restart module: {e}");
                }
            },
            CrashDecision::Abandon { crashes } => {
                error!(
                    module = %notice.name,
                    status = %notice.status,
                    %decision,
                    "module crashed too often"
                );
                self.events.emit(SessionEvent::Alert(UserAlert::CrashFlood {
                    name: notice.name.clone(),
                    label: descriptor.label().to_string(),
                    crashes,
                }));
            },
        }
        Ok(())
    }

    fn on_command(&mut self, command: SessionCommand) -> Result<(), SessionError> {
        match command {
            SessionCommand::Logout => self.request_logout(LogoutReason::Requested)?,
            SessionCommand::StartModule { name, reply } => {
                let result = self.start_module(&name);
                let _ = reply.send(result);
            },
            SessionCommand::StopModule { name, reply } => {
                let result = self.registry.stop(&name).map_err(SessionError::from);
                let _ = reply.send(result);
            },
        }
        Ok(())
    }

    fn start_module(&mut self, name: &str) -> Result<u32, SessionError> {
        if self.logout.is_active() {
            return Err(SessionError::NotRunning);
        }
        let descriptor = self
            .resolver
            .resolve(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(self.registry.start(descriptor)?)
    }

    fn request_logout(&mut self, reason: LogoutReason) -> Result<(), SessionError> {
        if self
            .logout
            .begin(&mut self.sequencer, &mut self.registry, Instant::now())?
        {
            info!(%reason, "ending session");
            self.pending = None;
            for probe in self.probes.drain(..) {
                probe.abort();
            }
            self.logout_reason = Some(reason);
        }
        Ok(())
    }

    fn watch_theme(&mut self) {
        let Some(theme_config) = self.config.theme.clone() else {
            return;
        };
        let configured = theme_config.name.clone();
        let watcher = match ThemeWatcher::new(theme_config) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!("theme watching disabled: {e}");
                return;
            },
        };

        let current = watcher.current().clone();
        if current.name != configured {
            self.events.emit(SessionEvent::Alert(UserAlert::ThemeFallback {
                from: configured,
                to: current.name.clone(),
            }));
        }
        self.events.emit(SessionEvent::ThemeChanged {
            name: current.name.clone(),
            path: current.path.clone(),
        });
        self.spawn_theme_watch(&current.path);
        self.theme = Some(watcher);
    }

    fn spawn_theme_watch(&self, path: &std::path::Path) {
        match theme::spawn_theme_watch(path, self.theme_tx.clone()) {
            Ok(_) => debug!(path = %path.display(), "watching theme"),
            Err(e) => warn!("{e}"),
        }
    }

    fn on_theme_change(&mut self, change: &FsChange) {
        let Some(watcher) = self.theme.as_mut() else {
            return;
        };
        match watcher.handle(change) {
            ThemeChange::Reapply(theme) => {
                self.events.emit(SessionEvent::ThemeChanged {
                    name: theme.name,
                    path: theme.path,
                });
            },
            ThemeChange::FellBack { from, to } => {
                warn!(from = %from, to = %to.name, "theme no longer available");
                self.events.emit(SessionEvent::Alert(UserAlert::ThemeFallback {
                    from,
                    to: to.name.clone(),
                }));
                self.events.emit(SessionEvent::ThemeChanged {
                    name: to.name,
                    path: to.path.clone(),
                });
                self.spawn_theme_watch(&to.path);
            },
            ThemeChange::Unavailable { name, default } => {
                error!(theme = %name, default = %default, "no usable theme left");
            },
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("phase", &self.sequencer.phase())
            .field("modules", &self.registry.list().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

async fn wait_pending(pending: &mut Option<PendingWait>) -> Readiness {
    match pending {
        Some(wait) => {
            wait.signal.wait().await;
            wait.readiness
        },
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
