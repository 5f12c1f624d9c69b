//! Configuration parsing and management.
//!
//! This module handles parsing of the session configuration file (TOML)
//! that defines the window manager, autostart modules, flood control,
//! logout timing, readiness probing, environment and theme settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crash::FloodControlConfig;
use crate::descriptor::AutostartEntry;
use crate::environment::EnvironmentConfig;
use crate::logout::LogoutConfig;
use crate::readiness::ReadinessConfig;
use crate::theme::ThemeConfig;

/// Name of the configuration file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "session.toml";

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session-wide settings.
    #[serde(default)]
    pub session: SessionSection,

    /// Crash flood control.
    #[serde(default)]
    pub flood_control: FloodControlConfig,

    /// Logout timing.
    #[serde(default)]
    pub logout: LogoutConfig,

    /// Window manager and tray readiness detection.
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Variables propagated to every spawned module.
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Theme watching. Disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<ThemeConfig>,

    /// User alert forwarding.
    #[serde(default)]
    pub alerts: AlertConfig,

    /// Autostart modules, in start order.
    #[serde(default)]
    pub autostart: Vec<AutostartEntry>,
}

impl SessionConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it
    /// fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path`, or the defaults when the file does
    /// not exist.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, if an autostart entry has
    /// an empty `exec`, or if two autostart entries share a name.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for entry in &self.autostart {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "autostart entry with an empty name".to_string(),
                ));
            }
            if entry.exec.first().is_none_or(|program| program.is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "autostart entry '{}' has an empty exec",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate autostart entry '{}'",
                    entry.name
                )));
            }
        }
        if self.flood_control.threshold == 0 {
            return Err(ConfigError::Validation(
                "flood_control.threshold must be at least 1".to_string(),
            ));
        }
        if self.flood_control.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "flood_control.sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Window manager command line. When unset the selection prompt runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_manager: Option<String>,

    /// Window managers offered by the selection prompt, filtered down to
    /// the installed ones.
    #[serde(default = "default_known_window_managers")]
    pub known_window_managers: Vec<String>,

    /// Configuration migration helper run before anything else starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_update: Option<Vec<String>>,

    /// Upper bound on the migration helper's run time.
    #[serde(default = "default_conf_update_timeout")]
    #[serde(with = "humantime_serde")]
    pub conf_update_timeout: Duration,
}

fn default_known_window_managers() -> Vec<String> {
    ["openbox", "kwin_x11", "xfwm4", "fluxbox", "icewm", "marco", "metacity"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_conf_update_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            window_manager: None,
            known_window_managers: default_known_window_managers(),
            conf_update: None,
            conf_update_timeout: default_conf_update_timeout(),
        }
    }
}

/// Forwarding of user-visible alerts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Command prefix; the alert summary and body are appended as the two
    /// final arguments (e.g. `["notify-send"]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// Returns the default configuration path, `lxsm/session.toml` under the
/// user's configuration directory (`$XDG_CONFIG_HOME`, or `~/.config`).
/// Falls back to `/etc/xdg` when no home directory can be determined.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::BaseDirs::new()
        .map_or_else(
            || PathBuf::from("/etc/xdg"),
            |dirs| dirs.config_dir().to_path_buf(),
        )
        .join("lxsm")
        .join(CONFIG_FILE_NAME)
}

/// Persist the chosen window manager into the config file at `path`,
/// keeping every other key intact. The file is created when missing.
pub fn persist_window_manager(path: &Path, command: &str) -> Result<(), ConfigError> {
    let mut table = if path.exists() {
        std::fs::read_to_string(path)
            .map_err(ConfigError::Io)?
            .parse::<toml::Table>()
            .map_err(ConfigError::Parse)?
    } else {
        toml::Table::new()
    };

    let session = table
        .entry("session")
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let Some(session) = session.as_table_mut() else {
        return Err(ConfigError::Validation(
            "'session' must be a table".to_string(),
        ));
    };
    session.insert(
        "window_manager".to_string(),
        toml::Value::String(command.to_string()),
    );

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
    }
    let rendered = toml::to_string_pretty(&table).map_err(ConfigError::Serialize)?;
    std::fs::write(path, rendered).map_err(ConfigError::Io)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

pub(crate) mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [session]
        window_manager = "openbox --replace"
        conf_update = ["lxqt-confupdate"]
        conf_update_timeout = "5s"

        [flood_control]
        threshold = 3
        window = "10s"
        quiet_period = "30s"

        [logout]
        grace_period = "1s"

        [environment]
        set = { XDG_CURRENT_DESKTOP = "LXQt" }
        prepend = [{ name = "XDG_DATA_DIRS", value = "/opt/lxsm/share" }]

        [[autostart]]
        name = "panel"
        exec = ["lxqt-panel"]

        [[autostart]]
        name = "nm-applet"
        exec = ["nm-applet", "--indicator"]
        requires_tray = true
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = SessionConfig::from_toml(FULL).unwrap();
        assert_eq!(
            config.session.window_manager.as_deref(),
            Some("openbox --replace")
        );
        assert_eq!(config.session.conf_update_timeout, Duration::from_secs(5));
        assert_eq!(config.flood_control.threshold, 3);
        assert_eq!(config.flood_control.window, Duration::from_secs(10));
        assert_eq!(config.flood_control.quiet_period, Duration::from_secs(30));
        assert_eq!(config.logout.grace_period, Duration::from_secs(1));
        assert_eq!(config.autostart.len(), 2);
        assert!(config.autostart[0].essential);
        assert!(!config.autostart[0].requires_tray);
        assert!(config.autostart[1].requires_tray);
        assert_eq!(config.environment.prepend[0].separator, ":");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SessionConfig::from_toml("").unwrap();
        assert!(config.session.window_manager.is_none());
        assert_eq!(config.flood_control.threshold, 5);
        assert_eq!(config.flood_control.window, Duration::from_secs(60));
        assert!(config.theme.is_none());
        assert!(config.autostart.is_empty());
    }

    #[test]
    fn test_rejects_empty_exec() {
        let err = SessionConfig::from_toml(
            r#"
            [[autostart]]
            name = "broken"
            exec = []
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("broken")));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let err = SessionConfig::from_toml(
            r#"
            [[autostart]]
            name = "panel"
            exec = ["a"]

            [[autostart]]
            name = "panel"
            exec = ["b"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = SessionConfig::from_toml("[flood_control]\nthreshold = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = SessionConfig::from_toml(FULL).unwrap();
        let rendered = config.to_toml().unwrap();
        let reparsed = SessionConfig::from_toml(&rendered).unwrap();
        assert_eq!(reparsed.autostart.len(), 2);
        assert_eq!(reparsed.flood_control.window, Duration::from_secs(10));
    }

    #[test]
    fn test_persist_window_manager_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, FULL).unwrap();

        persist_window_manager(&path, "kwin_x11").unwrap();

        let config = SessionConfig::from_file(&path).unwrap();
        assert_eq!(config.session.window_manager.as_deref(), Some("kwin_x11"));
        assert_eq!(config.autostart.len(), 2);
        assert_eq!(config.flood_control.threshold, 3);
    }

    #[test]
    fn test_persist_window_manager_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);

        persist_window_manager(&path, "openbox").unwrap();

        let config = SessionConfig::from_file(&path).unwrap();
        assert_eq!(config.session.window_manager.as_deref(), Some("openbox"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::from_file_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(config.autostart.is_empty());
    }

    #[test]
    fn test_example_config_parses() {
        let example = include_str!("../../../../docs/session.example.toml");
        let config = SessionConfig::from_toml(example).unwrap();
        assert_eq!(config.session.window_manager.as_deref(), Some("openbox"));
        assert_eq!(config.flood_control.threshold, 5);
        assert_eq!(config.logout.grace_period, Duration::from_secs(5));
        assert_eq!(config.readiness.probe_interval, Duration::from_millis(250));
        assert_eq!(config.environment.prepend.len(), 1);
        assert_eq!(config.autostart.len(), 4);
        assert!(config.autostart.iter().any(|entry| entry.requires_tray));
        assert!(config.autostart.iter().any(|entry| !entry.essential));
    }

    #[test]
    fn test_default_config_path_is_under_user_config_dir() {
        let path = default_config_path();
        assert!(path.ends_with("lxsm/session.toml"));
        if let Some(dirs) = directories::BaseDirs::new() {
            assert_eq!(path, dirs.config_dir().join("lxsm").join(CONFIG_FILE_NAME));
        }
    }
}
