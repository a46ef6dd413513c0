//! Service restart and log retrieval

use crate::platform::{Invocation, LaunchStrategy};
use crate::policy::{validate_line_count, validate_name};
use crate::runner::{
    decode_bounded, CommandRunner, CompletedRun, ExecutionContext, RunOptions, RunOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wall-clock budget for each service manager call
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Service operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Invalid service name")]
    InvalidName,

    #[error("Invalid lines parameter (expected 1-1000)")]
    InvalidLines,

    #[error("Failed to restart service: {0}")]
    RestartFailed(String),

    #[error("Failed to get logs: {0}")]
    LogsFailed(String),
}

/// Successful restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub success: bool,
    pub message: String,
    pub output: String,
}

/// Newest log lines of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLogs {
    pub service: String,
    pub lines: usize,
    pub logs: Vec<String>,
    pub truncated: bool,
}

/// Restart services and read their logs through the platform service manager
pub struct ServiceOps {
    launcher: Arc<dyn LaunchStrategy>,
    runner: Arc<dyn CommandRunner>,
    options: RunOptions,
    timeout: Duration,
}

impl ServiceOps {
    pub fn new(launcher: Arc<dyn LaunchStrategy>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            launcher,
            runner,
            options: RunOptions::service(),
            timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.options = self.options.with_max_output_bytes(max_output_bytes);
        self
    }

    /// Restart a service.
    ///
    /// Multi-step restarts (stop then start) keep going when an early step
    /// fails, since stopping a service that is not running is not an error
    /// for a restart. Only the final step decides success. All steps share
    /// one output budget.
    pub async fn restart(
        &self,
        name: &str,
        shutdown: &CancellationToken,
    ) -> Result<RestartReport, ServiceError> {
        let name = validate_name(name).map_err(|_| ServiceError::InvalidName)?;
        let steps = self.launcher.restart_service(name);

        info!(service = name, steps = steps.len(), "Restarting service");

        let mut output = Vec::new();
        let mut budget = self.options.max_output_bytes;
        let last = steps.len().saturating_sub(1);

        for (i, step) in steps.iter().enumerate() {
            let options = self.options.clone().with_max_output_bytes(budget);
            let run = self
                .run_step(step, &options, shutdown)
                .await
                .map_err(ServiceError::RestartFailed)?;

            budget = budget.saturating_sub(run.output.len());
            output.extend_from_slice(&run.output);

            if let Some(error) = run.error {
                if i == last {
                    warn!(service = name, error = %error, "Service restart failed");
                    return Err(ServiceError::RestartFailed(error));
                }
                warn!(service = name, step = %step, error = %error, "Restart step failed, continuing");
            }
        }

        let (output, _) = decode_bounded(&output, self.options.max_output_bytes);

        Ok(RestartReport {
            success: true,
            message: "Service restarted successfully".to_string(),
            output,
        })
    }

    /// Fetch the newest log lines of a service; `lines` defaults to 100
    pub async fn logs(
        &self,
        name: &str,
        lines: Option<&str>,
        shutdown: &CancellationToken,
    ) -> Result<ServiceLogs, ServiceError> {
        let name = validate_name(name).map_err(|_| ServiceError::InvalidName)?;
        let count = validate_line_count(lines).map_err(|_| ServiceError::InvalidLines)?;

        let invocation = self.launcher.service_logs(name, count);
        info!(service = name, lines = count, "Fetching service logs");

        let run = self
            .run_step(&invocation, &self.options, shutdown)
            .await
            .map_err(ServiceError::LogsFailed)?;

        if let Some(error) = run.error {
            warn!(service = name, error = %error, "Log retrieval failed");
            return Err(ServiceError::LogsFailed(error));
        }

        let (text, cut) = decode_bounded(&run.output, self.options.max_output_bytes);
        let truncated = run.truncated || cut;
        if truncated {
            warn!(service = name, "Log output truncated");
        }

        let logs: Vec<String> = text.lines().map(str::to_string).collect();

        Ok(ServiceLogs {
            service: name.to_string(),
            lines: logs.len(),
            logs,
            truncated,
        })
    }

    async fn run_step(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
        shutdown: &CancellationToken,
    ) -> Result<CompletedRun, String> {
        let invocation = resolve_program(invocation);
        let context = ExecutionContext::child_of(shutdown, self.timeout);

        match self.runner.run(&invocation, options, &context).await {
            RunOutcome::Completed(run) => Ok(run),
            RunOutcome::TimedOut { after } => {
                Err(format!("timeout after {} seconds", after.as_secs()))
            }
            RunOutcome::Cancelled => Err("cancelled: server shutting down".to_string()),
        }
    }
}

/// Resolve the program through PATH; unresolved names are left for spawn to report
fn resolve_program(invocation: &Invocation) -> Invocation {
    if std::path::Path::new(&invocation.program).is_absolute() {
        return invocation.clone();
    }

    match which::which(&invocation.program) {
        Ok(path) => Invocation {
            program: path.to_string_lossy().to_string(),
            args: invocation.args.clone(),
        },
        Err(_) => invocation.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{UnixLauncher, WindowsLauncher};
    use crate::runner::testing::{completed, RecordingRunner};

    fn ops(launcher: Arc<dyn LaunchStrategy>, runner: Arc<RecordingRunner>) -> ServiceOps {
        ServiceOps::new(launcher, runner)
    }

    fn program_name(invocation: &Invocation) -> String {
        std::path::Path::new(&invocation.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_restart_success() {
        let runner = RecordingRunner::ok("");
        let ops = ops(Arc::new(UnixLauncher), runner.clone());

        let report = ops.restart("nginx", &CancellationToken::new()).await.unwrap();

        assert!(report.success);
        assert_eq!(report.message, "Service restarted successfully");

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(program_name(&calls[0]), "systemctl");
        assert_eq!(calls[0].args, vec!["restart", "nginx"]);
        assert!(!runner.options()[0].clear_env);
    }

    #[tokio::test]
    async fn test_restart_rejects_unsafe_name() {
        let runner = RecordingRunner::ok("");
        let ops = ops(Arc::new(UnixLauncher), runner.clone());

        for name in ["nginx;reboot", "a&b", "x|y", "$(id)"] {
            assert_eq!(
                ops.restart(name, &CancellationToken::new()).await,
                Err(ServiceError::InvalidName)
            );
        }
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_failure() {
        let runner = RecordingRunner::replying(completed("Unit foo.service not found.\n", 5));
        let ops = ops(Arc::new(UnixLauncher), runner);

        let err = ops.restart("foo", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, ServiceError::RestartFailed("exit status 5".to_string()));
        assert_eq!(err.to_string(), "Failed to restart service: exit status 5");
    }

    #[tokio::test]
    async fn test_windows_restart_continues_after_stop_failure() {
        let runner = RecordingRunner::sequence(vec![
            completed("The service is not started.\n", 2),
            completed("The service was started successfully.\n", 0),
        ]);
        let ops = ops(Arc::new(WindowsLauncher), runner.clone());

        let report = ops.restart("Spooler", &CancellationToken::new()).await.unwrap();

        assert!(report.output.contains("not started"));
        assert!(report.output.contains("started successfully"));

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["stop", "Spooler"]);
        assert_eq!(calls[1].args, vec!["start", "Spooler"]);
    }

    #[tokio::test]
    async fn test_restart_timeout() {
        let runner = RecordingRunner::replying(RunOutcome::TimedOut {
            after: DEFAULT_SERVICE_TIMEOUT,
        });
        let ops = ops(Arc::new(UnixLauncher), runner);

        let err = ops.restart("nginx", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err,
            ServiceError::RestartFailed("timeout after 30 seconds".to_string())
        );
    }

    #[tokio::test]
    async fn test_logs_split_into_lines() {
        let runner = RecordingRunner::ok("line one\nline two\nline three\n");
        let ops = ops(Arc::new(UnixLauncher), runner.clone());

        let logs = ops
            .logs("sshd", Some("3"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(logs.service, "sshd");
        assert_eq!(logs.lines, 3);
        assert_eq!(logs.logs, vec!["line one", "line two", "line three"]);
        assert!(!logs.truncated);

        let calls = runner.calls();
        assert_eq!(program_name(&calls[0]), "journalctl");
        assert_eq!(calls[0].args, vec!["-u", "sshd", "-n", "3", "--no-pager"]);
    }

    #[tokio::test]
    async fn test_logs_hold_bound_after_decoding() {
        let runner = RecordingRunner::replying(RunOutcome::Completed(CompletedRun {
            output: vec![0xff; 8],
            truncated: false,
            exit_code: Some(0),
            error: None,
            duration: Duration::from_millis(1),
        }));
        let ops = ops(Arc::new(UnixLauncher), runner).with_max_output_bytes(8);

        let logs = ops.logs("sshd", None, &CancellationToken::new()).await.unwrap();
        assert!(logs.truncated);
        assert_eq!(logs.logs, vec!["\u{fffd}\u{fffd}"]);
    }

    #[tokio::test]
    async fn test_restart_output_holds_bound_after_decoding() {
        let runner = RecordingRunner::sequence(vec![
            RunOutcome::Completed(CompletedRun {
                output: vec![0xff; 4],
                truncated: false,
                exit_code: Some(0),
                error: None,
                duration: Duration::from_millis(1),
            }),
            completed("ok", 0),
        ]);
        let ops = ops(Arc::new(WindowsLauncher), runner).with_max_output_bytes(8);

        let report = ops.restart("Spooler", &CancellationToken::new()).await.unwrap();
        assert!(report.output.len() <= 8);
        assert_eq!(report.output, "\u{fffd}\u{fffd}");
    }

    #[tokio::test]
    async fn test_logs_default_line_count() {
        let runner = RecordingRunner::ok("");
        let ops = ops(Arc::new(UnixLauncher), runner.clone());

        let logs = ops.logs("sshd", None, &CancellationToken::new()).await.unwrap();
        assert_eq!(logs.lines, 0);
        assert!(logs.logs.is_empty());
        assert_eq!(runner.calls()[0].args[3], "100");
    }

    #[tokio::test]
    async fn test_logs_rejects_bad_input() {
        let runner = RecordingRunner::ok("");
        let ops = ops(Arc::new(UnixLauncher), runner.clone());
        let token = CancellationToken::new();

        assert_eq!(
            ops.logs("sshd", Some("100; reboot"), &token).await,
            Err(ServiceError::InvalidLines)
        );
        assert_eq!(
            ops.logs("sshd", Some("0"), &token).await,
            Err(ServiceError::InvalidLines)
        );
        assert_eq!(
            ops.logs("ss|hd", None, &token).await,
            Err(ServiceError::InvalidName)
        );
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_logs_failure() {
        let runner = RecordingRunner::replying(completed("No journal files were found.\n", 1));
        let ops = ops(Arc::new(UnixLauncher), runner);

        let err = ops.logs("sshd", None, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to get logs: exit status 1");
    }

    #[test]
    fn test_resolve_program_keeps_absolute_paths() {
        let invocation = Invocation::new("/bin/sh", ["-c", "true"]);
        assert_eq!(resolve_program(&invocation), invocation);

        let missing = Invocation::new("definitely-not-a-real-binary", Vec::<String>::new());
        assert_eq!(resolve_program(&missing), missing);
    }
}
