//! Subprocess execution with a cancellable deadline and bounded output capture

use crate::limits::ResourceLimits;
use crate::platform::Invocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard cap on captured output (1 MiB)
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Error reported when captured output hit [`MAX_OUTPUT_BYTES`]
pub const TRUNCATION_ERROR: &str = "Output truncated: exceeds 1MB limit";

const READ_CHUNK_BYTES: usize = 8192;

/// Shaped result of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why an execution context finished before the process did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    DeadlineExceeded,
    Cancelled,
}

/// Deadline plus cancellation token bounding one execution.
///
/// Cancelling the parent token (server shutdown) cancels every context
/// derived from it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    timeout: Duration,
    deadline: Instant,
    token: CancellationToken,
}

impl ExecutionContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::child_of(&CancellationToken::new(), timeout)
    }

    pub fn child_of(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            token: parent.child_token(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolves once the deadline passes or the context is cancelled
    pub async fn done(&self) -> ContextError {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => ContextError::DeadlineExceeded,
            _ = self.token.cancelled() => ContextError::Cancelled,
        }
    }
}

/// Per-run process options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Spawn with an empty environment
    pub clear_env: bool,

    /// Capture bound; bytes past it are drained and dropped
    pub max_output_bytes: usize,

    /// Resource limits
    pub limits: ResourceLimits,
}

impl RunOptions {
    /// Ad-hoc commands: empty environment, rlimits, 1 MiB bound
    pub fn ad_hoc() -> Self {
        Self {
            clear_env: true,
            max_output_bytes: MAX_OUTPUT_BYTES,
            limits: ResourceLimits::default(),
        }
    }

    /// Service manager calls: inherited environment, no rlimits, 1 MiB bound
    pub fn service() -> Self {
        Self {
            clear_env: false,
            max_output_bytes: MAX_OUTPUT_BYTES,
            limits: ResourceLimits::unlimited(),
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

/// A process that ran to completion (or failed to start)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    /// Combined stdout and stderr in arrival order, at most the capture bound
    pub output: Vec<u8>,

    /// Whether output past the bound was dropped
    pub truncated: bool,

    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,

    /// Spawn failure, abnormal exit or non-zero status
    pub error: Option<String>,

    /// Wall-clock duration
    pub duration: Duration,
}

impl CompletedRun {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Decoded output held to `max_output_bytes`.
    ///
    /// Truncation wins over process failure: the response contract was broken
    /// regardless of how the process exited.
    pub fn into_execution_result(self, max_output_bytes: usize) -> ExecutionResult {
        let (output, cut) = decode_bounded(&self.output, max_output_bytes);

        if self.truncated || cut {
            return ExecutionResult {
                success: false,
                output,
                error: Some(TRUNCATION_ERROR.to_string()),
            };
        }

        ExecutionResult {
            success: self.error.is_none(),
            output,
            error: self.error,
        }
    }
}

/// Lossily decode `bytes`, then cut the text back to at most `limit` bytes
/// on a char boundary. Replacement characters are three bytes wide, so
/// invalid input can decode to more bytes than it started with.
///
/// Returns the text and whether anything was cut.
pub fn decode_bounded(bytes: &[u8], limit: usize) -> (String, bool) {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= limit {
        return (text, false);
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(CompletedRun),
    TimedOut { after: Duration },
    Cancelled,
}

/// Something that can run an [`Invocation`]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
        context: &ExecutionContext,
    ) -> RunOutcome;
}

/// Runs invocations as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn build_command(invocation: &Invocation, options: &RunOptions) -> TokioCommand {
        let mut cmd = TokioCommand::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if options.clear_env {
            cmd.env_clear();
        }

        options.limits.apply(&mut cmd);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        options: &RunOptions,
        context: &ExecutionContext,
    ) -> RunOutcome {
        let start = Instant::now();
        let mut cmd = Self::build_command(invocation, options);

        info!(
            program = %invocation.program,
            args = invocation.args.len(),
            timeout_ms = context.timeout().as_millis() as u64,
            "Spawning process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %invocation.program, error = %e, "Failed to spawn process");
                return RunOutcome::Completed(CompletedRun {
                    output: Vec::new(),
                    truncated: false,
                    exit_code: None,
                    error: Some(e.to_string()),
                    duration: start.elapsed(),
                });
            }
        };

        let pid = child.id();
        let mut collector = OutputCollector::new(options.max_output_bytes);

        let finished = tokio::select! {
            status = capture(&mut child, &mut collector) => Ok(status),
            reason = context.done() => Err(reason),
        };

        let duration = start.elapsed();

        match finished {
            Ok(status) => {
                let (exit_code, error) = match status {
                    Ok(status) => (status.code(), describe_failure(status)),
                    Err(e) => (None, Some(e.to_string())),
                };

                debug!(
                    ?exit_code,
                    duration_ms = duration.as_millis() as u64,
                    bytes = collector.buf.len(),
                    truncated = collector.truncated,
                    "Process finished"
                );

                RunOutcome::Completed(CompletedRun {
                    output: collector.buf,
                    truncated: collector.truncated,
                    exit_code,
                    error,
                    duration,
                })
            }
            Err(reason) => {
                terminate(&mut child, pid).await;

                match reason {
                    ContextError::DeadlineExceeded => {
                        warn!(
                            program = %invocation.program,
                            timeout_ms = context.timeout().as_millis() as u64,
                            "Process exceeded deadline and was killed"
                        );
                        RunOutcome::TimedOut {
                            after: context.timeout(),
                        }
                    }
                    ContextError::Cancelled => {
                        warn!(program = %invocation.program, "Process cancelled");
                        RunOutcome::Cancelled
                    }
                }
            }
        }
    }
}

/// Accumulates output up to a byte bound, remembering whether anything was dropped
struct OutputCollector {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCollector {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
}

/// Drain stdout and stderr into the collector, then reap the child
async fn capture(
    child: &mut Child,
    collector: &mut OutputCollector,
) -> std::io::Result<ExitStatus> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = [0u8; READ_CHUNK_BYTES];
    let mut err_buf = [0u8; READ_CHUNK_BYTES];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
                Ok(0) | Err(_) => stdout = None,
                Ok(n) => collector.push(&out_buf[..n]),
            },
            read = read_chunk(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
                Ok(0) | Err(_) => stderr = None,
                Ok(n) => collector.push(&err_buf[..n]),
            },
        }
    }

    child.wait().await
}

async fn read_chunk<R>(stream: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match stream {
        Some(stream) => stream.read(buf).await,
        None => Ok(0),
    }
}

fn describe_failure(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }

    Some(match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "process terminated by signal".to_string(),
    })
}

/// Kill the child (and on Unix its whole process group), then reap it
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Err(e) = crate::limits::kill_process_group(pid) {
            warn!(pid, error = %e, "Failed to kill process group");
        }
    }

    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already gone");
    }
}
