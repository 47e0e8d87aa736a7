//! External command execution.
//!
//! Provides controlled command execution with:
//! - Working directory isolation
//! - Optional timeout enforcement
//! - Cancellation via `CancellationToken`
//! - Bounded output capture (head and tail of each stream)

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Maximum output size kept per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Command runner failures that happen before an exit code exists.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn: {0}")]
    Spawn(String),

    #[error("failed while waiting for process: {0}")]
    Io(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Capability to run external processes. Substituted with a fake in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands as child processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| CommandError::Spawn(format!("{}: {e}", spec.program)))?;

        // Returning early drops the child, and kill_on_drop reaps it.
        let deadline = async {
            match spec.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            tokio::try_join!(capture(stdout), capture(stderr), child.wait())
        };

        let (stdout, stderr, status) = tokio::select! {
            output = collect => output.map_err(|e| CommandError::Io(e.to_string()))?,
            _ = cancel.cancelled() => return Err(CommandError::Cancelled),
            _ = deadline => {
                return Err(CommandError::TimedOut(spec.timeout.unwrap_or_default()));
            }
        };

        Ok(CommandOutput {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Keeps the first and last `MAX_OUTPUT_SIZE / 2` bytes of a stream and
/// counts what falls in between.
#[derive(Debug, Default)]
struct BoundedCapture {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    dropped: usize,
}

impl BoundedCapture {
    fn push(&mut self, mut chunk: &[u8]) {
        let half = MAX_OUTPUT_SIZE / 2;
        if self.head.len() < half {
            let take = chunk.len().min(half - self.head.len());
            self.head.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }

        self.tail.extend(chunk);
        if self.tail.len() > half {
            let excess = self.tail.len() - half;
            self.tail.drain(..excess);
            self.dropped += excess;
        }
    }

    fn into_string(self) -> String {
        let mut tail = Vec::from(self.tail);
        if self.dropped == 0 {
            let mut all = self.head;
            all.append(&mut tail);
            return String::from_utf8_lossy(&all).into_owned();
        }
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            String::from_utf8_lossy(&self.head),
            self.dropped,
            String::from_utf8_lossy(&tail)
        )
    }
}

/// Drain a child stream into a `BoundedCapture`.
async fn capture<R>(reader: Option<R>) -> std::io::Result<BoundedCapture>
where
    R: AsyncRead + Unpin,
{
    let mut captured = BoundedCapture::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.push(&buf[..n]);
    }
}
