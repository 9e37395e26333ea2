//! Subprocess plumbing: long-lived API pipes and one-shot invocations.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RunOptions;
use crate::error::{BotError, Result};
use crate::ipc::transport::{LineTransport, Transport};

/// How long `close` waits for a pipe process to exit after its stdin closes.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// A running `keybase ... api` process used as a [`Transport`].
///
/// # Process Cleanup Safety
/// The child is spawned with `kill_on_drop`, so a transport dropped without
/// `close` still terminates its process. `close` additionally reaps it.
pub struct ProcessTransport {
    child: Child,
    lines: LineTransport<BufReader<ChildStdout>, ChildStdin>,
    label: String,
}

impl ProcessTransport {
    /// Launch the given subcommand with piped stdin/stdout.
    pub fn spawn<S: AsRef<str>>(opts: &RunOptions, args: &[S]) -> Result<Self> {
        let label = opts.describe(args);
        let mut child = opts
            .command(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BotError::spawn(&opts.program().display().to_string(), &opts.command_args(args), e)
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BotError::Io(missing_pipe("stdin", &label)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BotError::Io(missing_pipe("stdout", &label)))?;

        debug!("Spawned {} (pid {:?})", label, child.id());

        Ok(Self {
            child,
            lines: LineTransport::new(BufReader::new(stdout), stdin),
            label,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.lines.send(payload).await
    }

    async fn read_line(&mut self) -> Result<String> {
        self.lines.read_line().await
    }

    async fn close(&mut self) -> Result<()> {
        self.lines.close().await?;
        reap(&mut self.child, &self.label, CLOSE_GRACE).await.map(|_| ())
    }
}

/// Wait for a child to exit, killing it if it outlives `grace`.
pub async fn reap(child: &mut Child, label: &str, grace: Duration) -> Result<ExitStatus> {
    match timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!("{} exited with {}", label, status);
            Ok(status)
        }
        Err(_) => {
            warn!("{} didn't exit gracefully, killing", label);
            child.start_kill()?;
            Ok(child.wait().await?)
        }
    }
}

/// Run a subcommand to completion with `input` on stdin, returning stdout.
///
/// When the process exits non-zero but printed something, the output is
/// still returned so the caller can decode the API error it contains.
pub async fn run_with_input<S: AsRef<str>>(
    opts: &RunOptions,
    args: &[S],
    input: &[u8],
) -> Result<String> {
    let label = opts.describe(args);
    let mut child = opts
        .command(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| {
            BotError::spawn(&opts.program().display().to_string(), &opts.command_args(args), e)
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
    }

    let output = child.wait_with_output().await?;
    let stdout = String::from_utf8(output.stdout)
        .map_err(|e| BotError::Decode(format!("{} output is not valid UTF-8: {}", label, e)))?;

    if !output.status.success() && stdout.trim().is_empty() {
        return Err(exit_error(&label, output.status));
    }
    Ok(stdout)
}

/// Run a subcommand and require a zero exit status.
pub async fn run_checked<S: AsRef<str>>(opts: &RunOptions, args: &[S]) -> Result<()> {
    let label = opts.describe(args);
    let status = opts
        .command(args)
        .status()
        .await
        .map_err(|e| {
            BotError::spawn(&opts.program().display().to_string(), &opts.command_args(args), e)
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(exit_error(&label, status))
    }
}

fn exit_error(label: &str, status: ExitStatus) -> BotError {
    BotError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{} exited with {}", label, status),
    ))
}

fn missing_pipe(which: &str, label: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to get {} handle for {}", which, label),
    )
}
