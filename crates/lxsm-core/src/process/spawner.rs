//! Process spawning utilities.
//!
//! Every module is spawned with the frozen session environment rather than
//! whatever the supervisor's environment happens to be at spawn time.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::ProcessError;
use super::exit::ExitStatus;
use crate::descriptor::ModuleDescriptor;
use crate::environment::EnvTemplate;

/// A spawned process with its child handle and PID.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// The child process handle.
    pub child: Child,
    /// The OS process ID.
    pub pid: u32,
}

fn command(program: &str, args: &[String], env: &EnvTemplate) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(false);
    cmd
}

/// Spawn a module according to its descriptor.
///
/// # Errors
///
/// Returns `ProcessError::SpawnFailed` if the process cannot be spawned,
/// or if the PID cannot be obtained.
pub fn spawn(
    descriptor: &ModuleDescriptor,
    env: &EnvTemplate,
) -> Result<SpawnedProcess, ProcessError> {
    let mut cmd = command(&descriptor.program, &descriptor.args, env);
    if let Some(dir) = &descriptor.working_dir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
        program: descriptor.program.clone(),
        reason: e.to_string(),
    })?;

    let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
        program: descriptor.program.clone(),
        reason: "failed to get process ID".to_string(),
    })?;

    debug!(module = %descriptor.name, pid, program = %descriptor.program, "spawned module");
    Ok(SpawnedProcess { child, pid })
}

/// Run a one-shot helper to completion, killing it if it exceeds
/// `timeout`.
///
/// # Errors
///
/// Returns `ProcessError::SpawnFailed` for an empty argv or a failed spawn,
/// `ProcessError::WaitFailed` if waiting fails and `ProcessError::TimedOut`
/// when the bound is exceeded.
pub async fn run_to_completion(
    argv: &[String],
    env: &EnvTemplate,
    timeout: Duration,
) -> Result<ExitStatus, ProcessError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ProcessError::SpawnFailed {
            program: String::new(),
            reason: "empty command".to_string(),
        });
    };

    let mut child = command(program, args, env)
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(ExitStatus::from_std(status)),
        Ok(Err(e)) => Err(ProcessError::WaitFailed {
            program: program.clone(),
            reason: e.to_string(),
        }),
        Err(_) => {
            warn!(program = %program, ?timeout, "helper exceeded its time bound, killing it");
            if let Err(e) = child.kill().await {
                warn!(program = %program, "failed to kill helper: {e}");
            }
            Err(ProcessError::TimedOut {
                program: program.clone(),
                timeout,
            })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentBuilder;

    fn env() -> std::sync::Arc<EnvTemplate> {
        EnvironmentBuilder::from_process().build()
    }

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let descriptor = ModuleDescriptor::new("echo", "echo", ["hello"]);

        let result = spawn(&descriptor, &env());
        assert!(result.is_ok());

        let mut spawned = result.unwrap();
        assert!(spawned.pid > 0);

        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_uses_template_environment() {
        let mut builder = EnvironmentBuilder::from_process();
        builder.set("LXSM_TEST_VAR", "expected");
        let env = builder.build();

        let descriptor = ModuleDescriptor::new(
            "env-check",
            "sh",
            ["-c", "test \"$LXSM_TEST_VAR\" = expected"],
        );
        let mut spawned = spawn(&descriptor, &env).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_invalid_command() {
        let descriptor =
            ModuleDescriptor::new("invalid", "nonexistent_command_12345", Vec::<String>::new());

        let result = spawn(&descriptor, &env());
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_to_completion_reports_status() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let status = run_to_completion(&argv, &env(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.code, Some(3));
    }

    #[tokio::test]
    async fn test_run_to_completion_times_out() {
        let argv = vec!["sleep".to_string(), "5".to_string()];
        let result = run_to_completion(&argv, &env(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProcessError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn test_run_to_completion_empty_argv() {
        let result = run_to_completion(&[], &env(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }
}
