//! Window manager and system tray readiness.
//!
//! The [`ReadinessWatcher`] filters raw platform notifications and turns
//! two of them into level-triggered signals: the window manager has
//! claimed the display, and a system tray host owns the tray selection.
//! Waiters hold a [`ReadySignal`], which resolves immediately when the
//! condition already holds. Nothing is ever assumed: a condition holds only
//! once a platform event (from the display server or a probe command) says
//! so.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Root window property set by an EWMH-compliant window manager.
pub const WM_CHECK_PROPERTY: &str = "_NET_SUPPORTING_WM_CHECK";

/// Client message type broadcast by a new selection owner.
pub const MANAGER_MESSAGE: &str = "MANAGER";

/// Name of the system tray selection for `screen`.
#[must_use]
pub fn tray_selection(screen: u32) -> String {
    format!("_NET_SYSTEM_TRAY_S{screen}")
}

/// `[readiness]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// X screen number the tray selection belongs to.
    #[serde(default)]
    pub screen: u32,

    /// How long to wait for the window manager before carrying on anyway.
    /// Zero waits forever.
    #[serde(default = "default_window_manager_timeout")]
    #[serde(with = "crate::config::humantime_serde")]
    pub window_manager_timeout: Duration,

    /// Command that succeeds once the window manager manages the display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_manager_probe: Option<Vec<String>>,

    /// Command that succeeds once a system tray is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tray_probe: Option<Vec<String>>,

    /// Delay between probe attempts.
    #[serde(default = "default_probe_interval")]
    #[serde(with = "crate::config::humantime_serde")]
    pub probe_interval: Duration,
}

const fn default_window_manager_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_probe_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            screen: 0,
            window_manager_timeout: default_window_manager_timeout(),
            window_manager_probe: None,
            tray_probe: None,
            probe_interval: default_probe_interval(),
        }
    }
}

impl ReadinessConfig {
    /// The window manager wait bound, `None` when disabled.
    #[must_use]
    pub fn window_manager_deadline(&self) -> Option<Duration> {
        (!self.window_manager_timeout.is_zero()).then_some(self.window_manager_timeout)
    }
}

/// A raw notification from the windowing platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// A window property changed.
    PropertyChanged {
        /// Whether the window is the root window.
        root: bool,
        /// Property (atom) name.
        property: String,
    },
    /// A selection changed owner.
    SelectionOwnerChanged {
        /// Selection (atom) name.
        selection: String,
        /// New owner window, `None` when the selection was released.
        owner: Option<u32>,
    },
    /// A client message was sent to the root window.
    ClientMessage {
        /// Message type (atom) name.
        message_type: String,
        /// Selection named in the message data.
        selection: String,
    },
}

impl PlatformEvent {
    /// The event a window manager produces when it takes over the display.
    #[must_use]
    pub fn window_manager_claimed() -> Self {
        Self::PropertyChanged {
            root: true,
            property: WM_CHECK_PROPERTY.to_string(),
        }
    }

    /// The event a tray host produces when it acquires the tray selection.
    #[must_use]
    pub fn tray_claimed(screen: u32, owner: u32) -> Self {
        Self::SelectionOwnerChanged {
            selection: tray_selection(screen),
            owner: Some(owner),
        }
    }
}

/// Which readiness condition an event satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The window manager manages the display.
    WindowManager,
    /// A system tray is available.
    Tray,
}

/// A one-shot, level-triggered readiness handle.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<bool>,
}

impl ReadySignal {
    /// Whether the condition already holds.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the condition holds; immediately if it already does.
    /// Never resolves if the source goes away before that.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|ready| *ready).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Capability interface for the two readiness conditions the startup
/// sequence waits on.
pub trait ReadinessProbe {
    /// Resolves once the window manager has claimed the display.
    fn window_manager_ready(&self) -> ReadySignal;

    /// Resolves once a system tray host owns the tray selection.
    fn tray_available(&self) -> ReadySignal;
}

/// Translates platform events into readiness signals.
#[derive(Debug)]
pub struct ReadinessWatcher {
    tray_selection: String,
    window_manager: watch::Sender<bool>,
    tray: watch::Sender<bool>,
}

impl ReadinessWatcher {
    /// Creates a watcher for the tray selection of `screen`.
    #[must_use]
    pub fn new(screen: u32) -> Self {
        Self {
            tray_selection: tray_selection(screen),
            window_manager: watch::Sender::new(false),
            tray: watch::Sender::new(false),
        }
    }

    /// Inspects a platform event. Returns the condition it satisfied, if
    /// any. Unrelated events are ignored.
    pub fn observe(&self, event: &PlatformEvent) -> Option<Readiness> {
        let readiness = match event {
            PlatformEvent::PropertyChanged { root: true, property }
                if property == WM_CHECK_PROPERTY =>
            {
                Readiness::WindowManager
            },
            PlatformEvent::SelectionOwnerChanged {
                selection,
                owner: Some(_),
            } if *selection == self.tray_selection => Readiness::Tray,
            PlatformEvent::ClientMessage {
                message_type,
                selection,
            } if message_type == MANAGER_MESSAGE && *selection == self.tray_selection => {
                Readiness::Tray
            },
            _ => {
                debug!(?event, "ignoring platform event");
                return None;
            },
        };
        self.mark(readiness);
        Some(readiness)
    }

    /// Marks a condition as satisfied.
    pub fn mark(&self, readiness: Readiness) {
        let sender = match readiness {
            Readiness::WindowManager => &self.window_manager,
            Readiness::Tray => &self.tray,
        };
        if sender.send_if_modified(|ready| !std::mem::replace(ready, true)) {
            info!(?readiness, "readiness condition satisfied");
        }
    }
}

impl ReadinessProbe for ReadinessWatcher {
    fn window_manager_ready(&self) -> ReadySignal {
        ReadySignal {
            rx: self.window_manager.subscribe(),
        }
    }

    fn tray_available(&self) -> ReadySignal {
        ReadySignal {
            rx: self.tray.subscribe(),
        }
    }
}
