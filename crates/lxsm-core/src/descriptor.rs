//! Module descriptors and the descriptor resolver.
//!
//! A [`ModuleDescriptor`] is the immutable, already-parsed description of a
//! session component: its unique name, command line and the two policy
//! flags that drive startup ordering and crash handling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Immutable description of a supervised module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Unique key, typically derived from the desktop entry file name.
    pub name: String,
    /// Human-readable name for alerts.
    pub display_name: Option<String>,
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// The module must not start until a system tray is available.
    pub requires_tray: bool,
    /// The module does not itself end the session: crashes are retried
    /// under flood control and clean exits are left alone. When `false`,
    /// any exit of the module ends the session.
    pub essential: bool,
}

impl ModuleDescriptor {
    /// Creates a descriptor for an ordinary essential module.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            display_name: None,
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            requires_tray: false,
            essential: true,
        }
    }

    /// Creates the descriptor for a window manager command line.
    ///
    /// The command is split on whitespace; the module name is the basename
    /// of the program. The window manager is never essential: its exit
    /// ends the session.
    ///
    /// Returns `None` for an empty command.
    #[must_use]
    pub fn window_manager(command: &str) -> Option<Self> {
        let mut words = command.split_whitespace();
        let program = words.next()?;
        let name = Path::new(program)
            .file_name()
            .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned());
        Some(Self {
            name,
            display_name: Some("Window manager".to_string()),
            program: program.to_string(),
            args: words.map(String::from).collect(),
            working_dir: None,
            requires_tray: false,
            essential: false,
        })
    }

    /// Sets the tray requirement.
    #[must_use]
    pub const fn requiring_tray(mut self, requires_tray: bool) -> Self {
        self.requires_tray = requires_tray;
        self
    }

    /// Sets the essential flag.
    #[must_use]
    pub const fn essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    /// Name used in user-visible messages.
    #[must_use]
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// An `[[autostart]]` entry from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutostartEntry {
    /// Unique module name.
    pub name: String,

    /// Program followed by its arguments.
    pub exec: Vec<String>,

    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Wait for a system tray before starting.
    #[serde(default)]
    pub requires_tray: bool,

    /// Restart on crash instead of ending the session on exit.
    #[serde(default = "default_true")]
    pub essential: bool,

    /// Disabled entries are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl AutostartEntry {
    /// Converts the entry into a descriptor. Returns `None` when `exec` is
    /// empty.
    #[must_use]
    pub fn to_descriptor(&self) -> Option<ModuleDescriptor> {
        let (program, args) = self.exec.split_first()?;
        Some(ModuleDescriptor {
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            program: program.clone(),
            args: args.to_vec(),
            working_dir: self.working_dir.clone(),
            requires_tray: self.requires_tray,
            essential: self.essential,
        })
    }
}

/// Resolves module names into descriptors.
///
/// Desktop entry discovery and parsing live outside the supervisor; this is
/// the seam through which already-parsed descriptors arrive.
pub trait DescriptorResolver: Send {
    /// Looks up a descriptor by module name.
    fn resolve(&self, name: &str) -> Option<Arc<ModuleDescriptor>>;

    /// The enabled autostart descriptors, in configuration order.
    fn autostart(&self) -> Vec<Arc<ModuleDescriptor>>;
}

/// Resolver backed by the `[[autostart]]` entries of the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    descriptors: Vec<Arc<ModuleDescriptor>>,
}

impl ConfigResolver {
    /// Builds the resolver from configuration entries, skipping disabled
    /// entries.
    #[must_use]
    pub fn from_entries(entries: &[AutostartEntry]) -> Self {
        let descriptors = entries
            .iter()
            .filter(|entry| entry.enabled)
            .filter_map(AutostartEntry::to_descriptor)
            .map(Arc::new)
            .collect();
        Self { descriptors }
    }

    /// Builds the resolver from descriptors directly.
    #[must_use]
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> Self {
        Self {
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
        }
    }
}

impl DescriptorResolver for ConfigResolver {
    fn resolve(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        self.descriptors.iter().find(|d| d.name == name).cloned()
    }

    fn autostart(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.descriptors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, enabled: bool) -> AutostartEntry {
        AutostartEntry {
            name: name.to_string(),
            exec: vec!["prog".to_string(), "--flag".to_string()],
            display_name: None,
            working_dir: None,
            requires_tray: false,
            essential: true,
            enabled,
        }
    }

    #[test]
    fn test_window_manager_descriptor() {
        let wm = ModuleDescriptor::window_manager("/usr/bin/openbox --replace").unwrap();
        assert_eq!(wm.name, "openbox");
        assert_eq!(wm.program, "/usr/bin/openbox");
        assert_eq!(wm.args, vec!["--replace"]);
        assert!(!wm.essential);
        assert!(!wm.requires_tray);
    }

    #[test]
    fn test_window_manager_empty_command() {
        assert!(ModuleDescriptor::window_manager("   ").is_none());
    }

    #[test]
    fn test_entry_to_descriptor() {
        let descriptor = entry("panel", true).to_descriptor().unwrap();
        assert_eq!(descriptor.name, "panel");
        assert_eq!(descriptor.program, "prog");
        assert_eq!(descriptor.args, vec!["--flag"]);
        assert!(descriptor.essential);
        assert_eq!(descriptor.label(), "panel");
    }

    #[test]
    fn test_resolver_skips_disabled_and_keeps_order() {
        let resolver = ConfigResolver::from_entries(&[
            entry("b", true),
            entry("hidden", false),
            entry("a", true),
        ]);
        let names: Vec<_> = resolver
            .autostart()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(resolver.resolve("hidden").is_none());
        assert!(resolver.resolve("a").is_some());
    }
}
