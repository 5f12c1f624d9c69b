//! Environment template propagated to every spawned module.
//!
//! The template is computed once, before the first spawn, from the
//! supervisor's own environment plus the configured `set`/`prepend`
//! operations. It is then frozen behind an [`Arc`] and handed to every
//! spawn; nothing mutates it afterwards.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// `[environment]` configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Variables replaced outright.
    #[serde(default)]
    pub set: HashMap<String, String>,

    /// Values prepended to existing variables, applied in order.
    #[serde(default)]
    pub prepend: Vec<PrependEntry>,
}

/// A prepend operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrependEntry {
    /// Variable name.
    pub name: String,
    /// Value placed in front of the current value.
    pub value: String,
    /// Separator between the new and the current value.
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_separator() -> String {
    ":".to_string()
}

/// Frozen set of variables every module is spawned with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvTemplate {
    vars: BTreeMap<OsString, OsString>,
}

impl EnvTemplate {
    /// Returns the value of `name`, if set.
    #[must_use]
    pub fn get(&self, name: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(name.as_ref()).map(OsString::as_os_str)
    }

    /// Iterates over all variables.
    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// Number of variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the template holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Accumulates set/prepend operations before the template is frozen.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    vars: BTreeMap<OsString, OsString>,
}

impl EnvironmentBuilder {
    /// Starts from the supervisor's own environment.
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Starts from an empty environment.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replaces `name` with `value`.
    pub fn set(&mut self, name: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Prepends `value` to the current value of `name`, joined by
    /// `separator`. An unset or empty variable simply becomes `value`.
    pub fn prepend(
        &mut self,
        name: impl Into<OsString>,
        value: impl AsRef<OsStr>,
        separator: impl AsRef<OsStr>,
    ) -> &mut Self {
        let name = name.into();
        let mut combined = value.as_ref().to_os_string();
        if let Some(current) = self.vars.get(&name).filter(|current| !current.is_empty()) {
            combined.push(separator.as_ref());
            combined.push(current);
        }
        self.vars.insert(name, combined);
        self
    }

    /// Applies a configuration section: all `set` entries first, then the
    /// `prepend` entries in order.
    pub fn apply(&mut self, config: &EnvironmentConfig) -> &mut Self {
        let mut names: Vec<_> = config.set.keys().collect();
        names.sort();
        for name in names {
            self.set(name.as_str(), config.set[name].as_str());
        }
        for entry in &config.prepend {
            self.prepend(entry.name.as_str(), &entry.value, &entry.separator);
        }
        self
    }

    /// Freezes the template.
    #[must_use]
    pub fn build(self) -> Arc<EnvTemplate> {
        Arc::new(EnvTemplate { vars: self.vars })
    }
}
