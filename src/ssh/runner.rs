//! Process execution abstraction used by the SSH channel.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Future returned by [`CommandRunner`] operations.
pub type RunnerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RunnerError>> + Send + 'a>>;

/// Result of running an external command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Per-call options for [`CommandRunner::run`].
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Bytes written to the child's stdin, which is closed afterwards. When
    /// `None` stdin is connected to `/dev/null`.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on the whole call; the child is killed when it elapses.
    pub timeout: Option<Duration>,
    /// Emit each output line as a `clwd::remote` tracing event while it is
    /// produced.
    pub stream: bool,
}

/// Errors raised while running a local process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when the program cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when talking to the child's pipes fails.
    #[error("I/O error while running {program}: {message}")]
    Io {
        /// Program being run.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the call exceeds its timeout. The child has been killed.
    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// Program being run.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion, capturing stdout and stderr.
    ///
    /// Implementations must not leave the child running when the returned
    /// future completes, fails, times out, or is dropped.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: RunOptions,
    ) -> RunnerFuture<'a, CommandOutput>;

    /// Runs `program` with inherited stdio and returns its exit code.
    fn run_interactive<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a, Option<i32>>;
}

/// Real command runner that spawns host processes through tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        options: RunOptions,
    ) -> RunnerFuture<'a, CommandOutput> {
        Box::pin(async move {
            let RunOptions {
                stdin: input,
                timeout,
                stream,
            } = options;
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(if input.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            let mut child = command.spawn().map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

            let stdin = child.stdin.take();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let io_error = move |err: io::Error| RunnerError::Io {
                program: program.to_owned(),
                message: err.to_string(),
            };

            let work = async move {
                let (fed, out, err) = tokio::join!(
                    feed_stdin(stdin, input),
                    collect(stdout, stream, "stdout"),
                    collect(stderr, stream, "stderr"),
                );
                fed.map_err(io_error)?;
                let stdout_text = out.map_err(io_error)?;
                let stderr_text = err.map_err(io_error)?;
                let status = child.wait().await.map_err(io_error)?;
                Ok(CommandOutput {
                    code: status.code(),
                    stdout: stdout_text,
                    stderr: stderr_text,
                })
            };

            match timeout {
                Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                    RunnerError::TimedOut {
                        program: program.to_owned(),
                        timeout: limit,
                    }
                })?,
                None => work.await,
            }
        })
    }

    fn run_interactive<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> RunnerFuture<'a, Option<i32>> {
        Box::pin(async move {
            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .status()
                .await
                .map_err(|err| RunnerError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;
            Ok(status.code())
        })
    }
}

async fn feed_stdin(
    pipe: Option<tokio::process::ChildStdin>,
    bytes: Option<Vec<u8>>,
) -> io::Result<()> {
    let (Some(mut pipe), Some(data)) = (pipe, bytes) else {
        return Ok(());
    };
    match pipe.write_all(&data).await {
        Ok(()) => pipe.shutdown().await,
        // The child exited without draining stdin; its exit status reports
        // the failure.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin early");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn collect<R>(
    source: Option<R>,
    stream: bool,
    stream_name: &'static str,
) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = source else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(pipe);
    let mut captured = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&line);
        if stream {
            info!(target: "clwd::remote", stream = stream_name, "{}", text.trim_end());
        }
        captured.push_str(&text);
    }
    Ok(captured)
}
