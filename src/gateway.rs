//! Command gateway: the only path from an untrusted command string to a process

use crate::platform::LaunchStrategy;
use crate::policy::{validate_command, Allowlist, RejectionReason};
use crate::runner::{CommandRunner, ExecutionContext, ExecutionResult, RunOptions, RunOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wall-clock budget for ad-hoc commands
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway errors that abort a request without output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Rejected(#[from] RejectionReason),

    #[error("Command execution timeout after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("Command execution cancelled: server shutting down")]
    Cancelled,
}

/// Inbound ad-hoc command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// Validates, launches and shapes ad-hoc command executions
pub struct CommandGateway {
    allowlist: Arc<Allowlist>,
    launcher: Arc<dyn LaunchStrategy>,
    runner: Arc<dyn CommandRunner>,
    options: RunOptions,
    timeout: Duration,
}

impl CommandGateway {
    pub fn new(
        allowlist: Arc<Allowlist>,
        launcher: Arc<dyn LaunchStrategy>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            allowlist,
            launcher,
            runner,
            options: RunOptions::ad_hoc(),
            timeout: DEFAULT_EXEC_TIMEOUT,
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

    pub fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one request.
    ///
    /// `Ok` means a process ran, successfully or not; the result carries
    /// whatever output it produced. `Err` means nothing is returned to the
    /// caller but the error itself.
    pub async fn execute(
        &self,
        request: &CommandRequest,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionResult, GatewayError> {
        let command = validate_command(&request.command, &self.allowlist).map_err(|reason| {
            warn!(reason = reason.code(), "Command rejected by policy");
            GatewayError::Rejected(reason)
        })?;

        let invocation = self.launcher.command(&command);
        info!(
            verb = command.verb(),
            tokens = command.tokens().len(),
            launcher = self.launcher.name(),
            "Executing command"
        );

        let context = ExecutionContext::child_of(shutdown, self.timeout);
        match self.runner.run(&invocation, &self.options, &context).await {
            RunOutcome::Completed(run) => {
                let result = run.into_execution_result(self.options.max_output_bytes);
                if !result.success {
                    warn!(
                        verb = command.verb(),
                        error = result.error.as_deref().unwrap_or_default(),
                        "Command failed"
                    );
                }
                Ok(result)
            }
            RunOutcome::TimedOut { after } => Err(GatewayError::Timeout(after)),
            RunOutcome::Cancelled => Err(GatewayError::Cancelled),
        }
    }
}
