//! Module registry.
//!
//! Maps module names to their running-process records. Each child process
//! is owned by a small supervision task that waits for it to exit and
//! relays terminate/kill requests; the registry itself only ever talks to
//! those tasks through channels, so every bookkeeping change happens on the
//! control loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::descriptor::ModuleDescriptor;
use crate::environment::EnvTemplate;
use crate::events::{EventBus, SessionEvent};
use crate::process::{self, ExitStatus, ProcessError};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A module with this name is already tracked.
    #[error("module '{0}' is already running")]
    AlreadyRunning(String),

    /// No module with this name is tracked.
    #[error("module '{0}' is not running")]
    NotFound(String),

    /// The process could not be created.
    #[error("failed to start module '{name}': {source}")]
    Spawn {
        /// Module name.
        name: String,
        /// Underlying spawn error.
        #[source]
        source: ProcessError,
    },
}

/// Lifecycle state of a tracked module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Spawn requested, not yet confirmed.
    Starting,
    /// The process is alive.
    Running,
    /// The supervisor asked the process to stop.
    Terminating,
    /// The process has exited.
    Stopped,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Sent by a supervision task when its child exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    /// Module name.
    pub name: String,
    /// Spawn instance the notice belongs to.
    pub instance: u64,
    /// How the process ended.
    pub status: ExitStatus,
}

#[derive(Debug, Clone, Copy)]
enum ChildControl {
    Terminate,
    Kill,
}

/// A tracked module process.
#[derive(Debug)]
pub struct RunningModule {
    descriptor: Arc<ModuleDescriptor>,
    pid: u32,
    instance: u64,
    state: ModuleState,
    terminating: bool,
    control: mpsc::UnboundedSender<ChildControl>,
}

impl RunningModule {
    /// The descriptor the module was spawned from.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<ModuleDescriptor> {
        &self.descriptor
    }

    /// OS process ID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Spawn instance number, unique within the registry.
    #[must_use]
    pub const fn instance(&self) -> u64 {
        self.instance
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ModuleState {
        self.state
    }

    /// Whether the supervisor initiated the termination of this process.
    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.terminating
    }

    fn send(&self, control: ChildControl) {
        if self.control.send(control).is_err() {
            debug!(module = %self.descriptor.name, ?control, "supervision task already finished");
        }
    }
}

/// Tracks every module process of the session.
#[derive(Debug)]
pub struct ModuleRegistry {
    modules: HashMap<String, RunningModule>,
    env: Arc<EnvTemplate>,
    events: EventBus,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    next_instance: u64,
}

impl ModuleRegistry {
    /// Creates an empty registry. Exit notices of every module started
    /// through it arrive on the returned receiver.
    #[must_use]
    pub fn new(
        env: Arc<EnvTemplate>,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Self {
            modules: HashMap::new(),
            env,
            events,
            exit_tx,
            next_instance: 0,
        };
        (registry, exit_rx)
    }

    /// Spawns a process for `descriptor` and starts tracking it.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::AlreadyRunning` if a module with the same
    /// name is tracked, or `RegistryError::Spawn` if the process could not
    /// be created.
    pub fn start(&mut self, descriptor: Arc<ModuleDescriptor>) -> Result<u32, RegistryError> {
        if self.modules.contains_key(&descriptor.name) {
            return Err(RegistryError::AlreadyRunning(descriptor.name.clone()));
        }

        let spawned =
            process::spawn(&descriptor, &self.env).map_err(|source| RegistryError::Spawn {
                name: descriptor.name.clone(),
                source,
            })?;

        self.next_instance += 1;
        let instance = self.next_instance;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let mut module = RunningModule {
            descriptor: Arc::clone(&descriptor),
            pid: spawned.pid,
            instance,
            state: ModuleState::Starting,
            terminating: false,
            control: control_tx,
        };

        tokio::spawn(supervise_child(
            descriptor.name.clone(),
            instance,
            spawned.child,
            control_rx,
            self.exit_tx.clone(),
        ));

        module.state = ModuleState::Running;
        info!(module = %descriptor.name, pid = spawned.pid, instance, "module started");
        self.modules.insert(descriptor.name.clone(), module);
        self.events.emit(SessionEvent::ModuleStateChanged {
            name: descriptor.name.clone(),
            running: true,
        });
        Ok(spawned.pid)
    }

    /// Marks the module as terminating and sends it SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` if no such module is tracked.
    pub fn stop(&mut self, name: &str) -> Result<(), RegistryError> {
        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        module.terminating = true;
        module.state = ModuleState::Terminating;
        info!(module = %name, pid = module.pid, "terminating module");
        module.send(ChildControl::Terminate);
        Ok(())
    }

    /// Sends SIGTERM to every tracked module.
    pub fn terminate_all(&mut self) {
        for name in self.list() {
            if let Err(e) = self.stop(&name) {
                warn!(module = %name, "failed to terminate module: {e}");
            }
        }
    }

    /// Sends SIGKILL to every tracked module.
    pub fn kill_all(&mut self) {
        for (name, module) in &mut self.modules {
            warn!(module = %name, pid = module.pid, "force-killing module");
            module.terminating = true;
            module.state = ModuleState::Terminating;
            module.send(ChildControl::Kill);
        }
    }

    /// Removes the module an exit notice refers to.
    ///
    /// Returns `None` for notices of an instance that is no longer tracked
    /// (for instance a process that exited after being replaced).
    pub fn reap(&mut self, notice: &ExitNotice) -> Option<RunningModule> {
        if self
            .modules
            .get(&notice.name)
            .is_none_or(|module| module.instance != notice.instance)
        {
            debug!(module = %notice.name, instance = notice.instance, "ignoring stale exit notice");
            return None;
        }

        let mut module = self.modules.remove(&notice.name)?;
        module.state = ModuleState::Stopped;
        debug!(module = %notice.name, status = %notice.status, "module removed from registry");
        self.events.emit(SessionEvent::ModuleStateChanged {
            name: notice.name.clone(),
            running: false,
        });
        Some(module)
    }

    /// Snapshot of the tracked module names, sorted.
    #[must_use]
    pub fn list(&self) -> std::vec::IntoIter<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names.into_iter()
    }

    /// Looks up a tracked module.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RunningModule> {
        self.modules.get(name)
    }

    /// Whether a module with this name is tracked.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Number of tracked modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

async fn supervise_child(
    name: String,
    instance: u64,
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<ChildControl>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
) {
    let pid = child.id().and_then(|pid| i32::try_from(pid).ok());

    let status = loop {
        tokio::select! {
            result = child.wait() => {
                break match result {
                    Ok(status) => ExitStatus::from_std(status),
                    Err(e) => {
                        warn!(module = %name, "failed to wait on module: {e}");
                        ExitStatus::unknown()
                    },
                };
            },
            Some(request) = control.recv() => match request {
                ChildControl::Terminate => {
                    if let Some(pid) = pid {
                        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                            warn!(module = %name, pid, "failed to send SIGTERM: {e}");
                        }
                    }
                },
                ChildControl::Kill => {
                    if let Err(e) = child.start_kill() {
                        warn!(module = %name, "failed to send SIGKILL: {e}");
                    }
                },
            },
        }
    };

    let _ = exit_tx.send(ExitNotice {
        name,
        instance,
        status,
    });
}
