//! Exit classification for supervised modules.
//!
//! The crash monitor only cares whether an exit was clean or abnormal: a
//! process that called `exit()` (with any code) exited normally, while one
//! terminated by a signal crashed or was killed.

use std::fmt;
use std::process::ExitStatus as StdExitStatus;

use nix::libc;

/// How a module process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Process exited with code 0.
    CleanExit,
    /// Process exited with a non-zero code.
    ErrorExit {
        /// The exit code returned by the process.
        exit_code: i32,
    },
    /// Process was terminated by a signal.
    Signal {
        /// The signal number that terminated the process.
        signal: i32,
        /// Human-readable name of the signal.
        signal_name: &'static str,
    },
    /// Exit status could not be determined.
    Unknown,
}

impl ExitKind {
    /// Whether the process crashed or was killed rather than exiting on its
    /// own.
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        matches!(self, Self::Signal { .. } | Self::Unknown)
    }

    /// Returns the exit code for normal exits.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ErrorExit { exit_code } => Some(*exit_code),
            Self::CleanExit => Some(0),
            _ => None,
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CleanExit => write!(f, "clean exit (code 0)"),
            Self::ErrorExit { exit_code } => write!(f, "error exit (code {exit_code})"),
            Self::Signal {
                signal,
                signal_name,
            } => write!(f, "signal {signal} ({signal_name})"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Wrapper around `std::process::ExitStatus` that can be constructed
/// directly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// The raw exit code, if the process exited normally.
    pub code: Option<i32>,
    /// The signal that terminated the process.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Creates an `ExitStatus` from a standard library `ExitStatus`.
    #[must_use]
    pub fn from_std(status: StdExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Creates an `ExitStatus` representing a clean exit (code 0).
    #[must_use]
    pub const fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    /// Creates an `ExitStatus` representing an error exit with the given code.
    #[must_use]
    pub const fn error(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Creates an `ExitStatus` representing termination by a signal.
    #[must_use]
    pub const fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// An exit whose status could not be collected.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Classifies this status.
    #[must_use]
    pub fn kind(&self) -> ExitKind {
        classify_exit_status(*self)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind().fmt(f)
    }
}

/// Classifies an exit status into an `ExitKind`.
#[must_use]
pub fn classify_exit_status(status: ExitStatus) -> ExitKind {
    if let Some(signal) = status.signal {
        return ExitKind::Signal {
            signal,
            signal_name: signal_name(signal),
        };
    }

    match status.code {
        Some(0) => ExitKind::CleanExit,
        Some(code) => ExitKind::ErrorExit { exit_code: code },
        None => ExitKind::Unknown,
    }
}

/// Returns the conventional name of a signal number.
#[must_use]
pub const fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGTERM => "SIGTERM",
        libc::SIGINT => "SIGINT",
        libc::SIGHUP => "SIGHUP",
        libc::SIGKILL => "SIGKILL",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGABRT => "SIGABRT",
        libc::SIGSYS => "SIGSYS",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_clean_exit() {
        let kind = classify_exit_status(ExitStatus::success());
        assert_eq!(kind, ExitKind::CleanExit);
        assert!(!kind.is_abnormal());
    }

    #[test]
    fn test_classify_error_exit_is_not_abnormal() {
        let kind = classify_exit_status(ExitStatus::error(1));
        assert_eq!(kind, ExitKind::ErrorExit { exit_code: 1 });
        assert!(!kind.is_abnormal());
        assert_eq!(kind.exit_code(), Some(1));
    }

    #[test]
    fn test_classify_signal_is_abnormal() {
        let kind = classify_exit_status(ExitStatus::from_signal(libc::SIGSEGV));
        assert!(matches!(
            kind,
            ExitKind::Signal {
                signal_name: "SIGSEGV",
                ..
            }
        ));
        assert!(kind.is_abnormal());
        assert_eq!(kind.exit_code(), None);
    }

    #[test]
    fn test_classify_unknown_is_abnormal() {
        let kind = ExitStatus::unknown().kind();
        assert_eq!(kind, ExitKind::Unknown);
        assert!(kind.is_abnormal());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(12345), "UNKNOWN");
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitStatus::success().to_string(), "clean exit (code 0)");
        assert_eq!(ExitStatus::error(42).to_string(), "error exit (code 42)");
        assert_eq!(
            ExitStatus::from_signal(libc::SIGKILL).to_string(),
            "signal 9 (SIGKILL)"
        );
    }

    #[tokio::test]
    async fn test_from_std_signal() {
        let status = tokio::process::Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .await
            .unwrap();
        let status = ExitStatus::from_std(status);
        assert_eq!(status.signal, Some(libc::SIGKILL));
        assert!(status.kind().is_abnormal());
    }
}
