//! Crash monitor and flood control.
//!
//! Every module exit is routed through [`CrashMonitor::evaluate`], which
//! decides between doing nothing, restarting the module, abandoning it,
//! or ending the session. Crash timestamps are kept per module name so a
//! module's history survives its own respawns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::descriptor::ModuleDescriptor;
use crate::process::ExitStatus;

/// `[flood_control]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodControlConfig {
    /// Crashes within `window` that abandon a module.
    #[serde(default = "default_threshold")]
    pub threshold: u32,

    /// Time window for counting crashes.
    #[serde(default = "default_window")]
    #[serde(with = "crate::config::humantime_serde")]
    pub window: Duration,

    /// Crash entries older than this are cleared by the sweep.
    #[serde(default = "default_quiet_period")]
    #[serde(with = "crate::config::humantime_serde")]
    pub quiet_period: Duration,

    /// How often the sweep runs.
    #[serde(default = "default_sweep_interval")]
    #[serde(with = "crate::config::humantime_serde")]
    pub sweep_interval: Duration,
}

const fn default_threshold() -> u32 {
    5
}

const fn default_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_quiet_period() -> Duration {
    Duration::from_secs(60)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for FloodControlConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window: default_window(),
            quiet_period: default_quiet_period(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Policy decision taken for a module exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// The supervisor stopped the module itself; only bookkeeping remains.
    Expected,
    /// A non-essential module exited: the session ends.
    EndSession,
    /// The module exited on its own; it is not restarted.
    LeaveStopped,
    /// The module crashed and is respawned.
    Restart {
        /// Crashes counted in the window, including this one.
        crashes: usize,
    },
    /// The module crashed too often and is given up for the session.
    Abandon {
        /// Crashes counted in the window, including this one.
        crashes: usize,
    },
    /// The module was abandoned earlier; it stays down.
    AlreadyAbandoned,
}

impl fmt::Display for CrashDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expected => write!(f, "expected"),
            Self::EndSession => write!(f, "end session"),
            Self::LeaveStopped => write!(f, "leave stopped"),
            Self::Restart { crashes } => write!(f, "restart (crash {crashes})"),
            Self::Abandon { crashes } => write!(f, "abandon after {crashes} crashes"),
            Self::AlreadyAbandoned => write!(f, "already abandoned"),
        }
    }
}

/// Records crashes and applies the flood-control policy.
#[derive(Debug)]
pub struct CrashMonitor {
    config: FloodControlConfig,
    reports: HashMap<String, VecDeque<Instant>>,
    abandoned: HashSet<String>,
}

impl CrashMonitor {
    /// Creates a monitor with no crash history.
    #[must_use]
    pub fn new(config: FloodControlConfig) -> Self {
        Self {
            config,
            reports: HashMap::new(),
            abandoned: HashSet::new(),
        }
    }

    /// The flood-control configuration.
    #[must_use]
    pub const fn config(&self) -> &FloodControlConfig {
        &self.config
    }

    /// Decides what to do about a module exit.
    ///
    /// `terminating` is true when the supervisor asked the module to stop,
    /// or when the whole session is logging out.
    pub fn evaluate(
        &mut self,
        descriptor: &ModuleDescriptor,
        terminating: bool,
        status: ExitStatus,
        now: Instant,
    ) -> CrashDecision {
        if terminating {
            return CrashDecision::Expected;
        }
        if !descriptor.essential {
            return CrashDecision::EndSession;
        }
        if !status.kind().is_abnormal() {
            return CrashDecision::LeaveStopped;
        }
        if self.abandoned.contains(&descriptor.name) {
            return CrashDecision::AlreadyAbandoned;
        }

        let crashes = self.record(&descriptor.name, now);
        if crashes >= self.threshold() {
            self.reports.remove(&descriptor.name);
            self.abandoned.insert(descriptor.name.clone());
            CrashDecision::Abandon { crashes }
        } else {
            CrashDecision::Restart { crashes }
        }
    }

    /// Clears crash entries older than the quiet period. Reports left empty
    /// are deleted. Returns the number of modules whose history was fully
    /// cleared.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let quiet_period = self.config.quiet_period;
        let before = self.reports.len();
        self.reports.retain(|name, crashes| {
            while crashes
                .front()
                .is_some_and(|&at| now.saturating_duration_since(at) > quiet_period)
            {
                crashes.pop_front();
            }
            if crashes.is_empty() {
                debug!(module = %name, "crash history cleared");
            }
            !crashes.is_empty()
        });
        before - self.reports.len()
    }

    /// Crashes currently on record for `name`.
    #[must_use]
    pub fn crash_count(&self, name: &str) -> usize {
        self.reports.get(name).map_or(0, VecDeque::len)
    }

    /// Whether `name` has been abandoned for the rest of the session.
    #[must_use]
    pub fn is_abandoned(&self, name: &str) -> bool {
        self.abandoned.contains(name)
    }

    fn threshold(&self) -> usize {
        usize::try_from(self.config.threshold).unwrap_or(usize::MAX)
    }

    fn record(&mut self, name: &str, now: Instant) -> usize {
        let window = self.config.window;
        let crashes = self.reports.entry(name.to_string()).or_default();
        if crashes.back().is_none_or(|&last| last <= now) {
            crashes.push_back(now);
        }
        while crashes
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) > window)
        {
            crashes.pop_front();
        }
        crashes.len()
    }
}
