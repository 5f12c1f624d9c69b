//! Theme watcher.
//!
//! Watches the active theme directory and re-validates the theme whenever
//! it changes. If the directory disappears the default theme takes over and
//! is watched instead.

use std::path::{Path, PathBuf};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SYSTEM_THEME_DIR: &str = "/usr/share/lxsm/themes";

/// Theme used when the configured one is unavailable.
pub const DEFAULT_THEME: &str = "frost";

/// `[theme]` configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeConfig {
    /// Active theme name.
    pub name: String,

    /// Directories searched for theme directories, in order.
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,

    /// Fallback theme name.
    #[serde(default = "default_theme")]
    pub default_theme: String,
}

/// User themes (`$XDG_DATA_HOME/lxsm/themes`) shadow the system ones.
fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(base_dirs) = directories::BaseDirs::new() {
        dirs.push(base_dirs.data_dir().join("lxsm").join("themes"));
    }
    dirs.push(PathBuf::from(SYSTEM_THEME_DIR));
    dirs
}

fn default_theme() -> String {
    DEFAULT_THEME.to_string()
}

/// Theme errors.
#[derive(Debug, Error)]
pub enum ThemeError {
    /// Neither the configured nor the default theme exists.
    #[error("no usable theme: '{name}' and default '{default}' not found")]
    NotFound {
        /// Configured theme.
        name: String,
        /// Fallback theme.
        default: String,
    },

    /// The file-system watch could not be set up.
    #[error("failed to watch {path}: {source}")]
    Watch {
        /// Watched path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: nix::Error,
    },
}

/// A resolved theme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTheme {
    /// Theme name.
    pub name: String,
    /// Theme directory.
    pub path: PathBuf,
}

/// A change reported by the file-system watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    /// Something inside the watched directory changed.
    Modified(PathBuf),
    /// The watched directory itself is gone.
    Removed(PathBuf),
}

/// Outcome of re-validating the theme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThemeChange {
    /// The active theme is still present and should be re-applied.
    Reapply(ActiveTheme),
    /// The active theme vanished; the default theme replaced it.
    FellBack {
        /// The theme that vanished.
        from: String,
        /// The theme now active.
        to: ActiveTheme,
    },
    /// No theme is usable any more.
    Unavailable {
        /// The theme that vanished.
        name: String,
        /// The fallback that is missing too.
        default: String,
    },
}

/// Finds the directory of theme `name` in `search_dirs`.
#[must_use]
pub fn resolve_theme(name: &str, search_dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') {
        return None;
    }
    search_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|path| path.is_dir())
}

/// Tracks the active theme.
#[derive(Debug)]
pub struct ThemeWatcher {
    config: ThemeConfig,
    current: ActiveTheme,
}

impl ThemeWatcher {
    /// Resolves the configured theme, falling back to the default theme.
    ///
    /// # Errors
    ///
    /// Returns `ThemeError::NotFound` if neither theme exists.
    pub fn new(config: ThemeConfig) -> Result<Self, ThemeError> {
        let current = if let Some(path) = resolve_theme(&config.name, &config.search_dirs) {
            ActiveTheme {
                name: config.name.clone(),
                path,
            }
        } else {
            warn!(theme = %config.name, "configured theme not found, using default");
            fallback(&config)?
        };
        Ok(Self { config, current })
    }

    /// The active theme.
    #[must_use]
    pub const fn current(&self) -> &ActiveTheme {
        &self.current
    }

    /// Re-validates the active theme after a file-system change.
    pub fn handle(&mut self, change: &FsChange) -> ThemeChange {
        debug!(?change, theme = %self.current.name, "theme directory changed");
        if self.current.path.is_dir() {
            return ThemeChange::Reapply(self.current.clone());
        }

        let from = self.current.name.clone();
        match fallback(&self.config) {
            Ok(to) if to.path != self.current.path => {
                info!(from = %from, to = %to.name, "theme vanished, falling back");
                self.current = to.clone();
                ThemeChange::FellBack { from, to }
            },
            Ok(_) | Err(_) => ThemeChange::Unavailable {
                name: from,
                default: self.config.default_theme.clone(),
            },
        }
    }
}

fn fallback(config: &ThemeConfig) -> Result<ActiveTheme, ThemeError> {
    resolve_theme(&config.default_theme, &config.search_dirs)
        .map(|path| ActiveTheme {
            name: config.default_theme.clone(),
            path,
        })
        .ok_or_else(|| ThemeError::NotFound {
            name: config.name.clone(),
            default: config.default_theme.clone(),
        })
}

/// Watches `path` on a dedicated thread, forwarding changes to `tx`.
///
/// The thread ends after the directory is removed or when `tx` is closed
/// and another event arrives.
///
/// # Errors
///
/// Returns `ThemeError::Watch` if inotify cannot be set up.
pub fn spawn_theme_watch(
    path: &Path,
    tx: mpsc::UnboundedSender<FsChange>,
) -> Result<std::thread::JoinHandle<()>, ThemeError> {
    let watch_mask = AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF;
    let watch_error = |source| ThemeError::Watch {
        path: path.to_path_buf(),
        source,
    };

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC).map_err(watch_error)?;
    inotify.add_watch(path, watch_mask).map_err(watch_error)?;

    let path = path.to_path_buf();
    Ok(std::thread::spawn(move || {
        let inotify = inotify;

        loop {
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(error) => {
                    warn!(path = %path.display(), "theme watch read failed: {error}");
                    return;
                },
            };

            let removed = events.iter().any(|event| {
                event.mask.intersects(
                    AddWatchFlags::IN_DELETE_SELF
                        | AddWatchFlags::IN_MOVE_SELF
                        | AddWatchFlags::IN_IGNORED,
                )
            });
            let change = if removed {
                FsChange::Removed(path.clone())
            } else {
                FsChange::Modified(path.clone())
            };
            if tx.send(change).is_err() || removed {
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn themes(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    fn config(dir: &Path, name: &str) -> ThemeConfig {
        ThemeConfig {
            name: name.to_string(),
            search_dirs: vec![dir.to_path_buf()],
            default_theme: DEFAULT_THEME.to_string(),
        }
    }

    #[test]
    fn test_resolve_theme_in_order() {
        let first = themes(&[]);
        let second = themes(&["dark"]);
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert_eq!(
            resolve_theme("dark", &dirs),
            Some(second.path().join("dark"))
        );
        assert_eq!(resolve_theme("light", &dirs), None);
        assert_eq!(resolve_theme("../dark", &dirs), None);
    }

    #[test]
    fn test_default_search_dirs() {
        let config: ThemeConfig = toml::from_str("name = \"dark\"").unwrap();
        assert_eq!(
            config.search_dirs.last(),
            Some(&PathBuf::from(SYSTEM_THEME_DIR))
        );
        if let Some(dirs) = directories::BaseDirs::new() {
            assert_eq!(
                config.search_dirs.first(),
                Some(&dirs.data_dir().join("lxsm").join("themes"))
            );
        }
    }

    #[test]
    fn test_missing_configured_theme_uses_default() {
        let dir = themes(&[DEFAULT_THEME]);
        let watcher = ThemeWatcher::new(config(dir.path(), "dark")).unwrap();
        assert_eq!(watcher.current().name, DEFAULT_THEME);
    }

    #[test]
    fn test_no_theme_at_all_is_an_error() {
        let dir = themes(&[]);
        let err = ThemeWatcher::new(config(dir.path(), "dark")).unwrap_err();
        assert!(matches!(err, ThemeError::NotFound { .. }));
    }

    #[test]
    fn test_modification_reapplies() {
        let dir = themes(&["dark", DEFAULT_THEME]);
        let mut watcher = ThemeWatcher::new(config(dir.path(), "dark")).unwrap();

        let change = watcher.handle(&FsChange::Modified(dir.path().join("dark")));
        assert!(matches!(change, ThemeChange::Reapply(theme) if theme.name == "dark"));
    }

    #[test]
    fn test_removal_falls_back_to_default() {
        let dir = themes(&["dark", DEFAULT_THEME]);
        let mut watcher = ThemeWatcher::new(config(dir.path(), "dark")).unwrap();

        std::fs::remove_dir(dir.path().join("dark")).unwrap();
        let change = watcher.handle(&FsChange::Removed(dir.path().join("dark")));

        match change {
            ThemeChange::FellBack { from, to } => {
                assert_eq!(from, "dark");
                assert_eq!(to.name, DEFAULT_THEME);
                assert_eq!(to.path, dir.path().join(DEFAULT_THEME));
            },
            other => panic!("expected fallback, got {other:?}"),
        }
        assert_eq!(watcher.current().name, DEFAULT_THEME);
    }

    #[test]
    fn test_default_theme_removed_is_unavailable() {
        let dir = themes(&[DEFAULT_THEME]);
        let mut watcher = ThemeWatcher::new(config(dir.path(), DEFAULT_THEME)).unwrap();

        std::fs::remove_dir(dir.path().join(DEFAULT_THEME)).unwrap();
        let change = watcher.handle(&FsChange::Removed(dir.path().join(DEFAULT_THEME)));
        assert!(matches!(change, ThemeChange::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_watch_reports_modification_and_removal() {
        let dir = themes(&["dark"]);
        let theme_dir = dir.path().join("dark");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_theme_watch(&theme_dir, tx).unwrap();

        std::fs::write(theme_dir.join("panel.qss"), b"color: red").unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, FsChange::Modified(theme_dir.clone()));

        std::fs::remove_dir_all(&theme_dir).unwrap();
        let removed = loop {
            let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap();
            match change {
                Some(FsChange::Removed(path)) => break path,
                Some(FsChange::Modified(_)) => {},
                None => panic!("watch ended without reporting removal"),
            }
        };
        assert_eq!(removed, theme_dir);
        handle.join().unwrap();
    }
}
