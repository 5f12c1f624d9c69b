//! Program lookup and window manager discovery.

use std::path::PathBuf;

/// A window manager offered by the selection prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowManagerInfo {
    /// Command used to start it.
    pub command: String,
    /// Resolved executable, when installed.
    pub path: Option<PathBuf>,
}

impl WindowManagerInfo {
    /// Whether the executable was found.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.path.is_some()
    }
}

/// Resolves `program` to an executable, either as given (absolute or
/// relative path) or through `PATH`.
#[must_use]
pub fn find_program(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

/// Looks up each known window manager. With `only_available`, entries that
/// are not installed are dropped.
#[must_use]
pub fn available_window_managers(known: &[String], only_available: bool) -> Vec<WindowManagerInfo> {
    known
        .iter()
        .map(|command| WindowManagerInfo {
            command: command.clone(),
            path: command.split_whitespace().next().and_then(find_program),
        })
        .filter(|info| !only_available || info.exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_program_on_path() {
        assert!(find_program("sh").is_some());
    }

    #[test]
    fn test_find_program_missing() {
        assert!(find_program("lxsm-definitely-not-installed").is_none());
    }

    #[test]
    fn test_available_window_managers_filters() {
        let known = vec!["sh".to_string(), "lxsm-no-such-wm".to_string()];

        let all = available_window_managers(&known, false);
        assert_eq!(all.len(), 2);
        assert!(all[0].exists());
        assert!(!all[1].exists());

        let installed = available_window_managers(&known, true);
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].command, "sh");
    }
}
