//! Remote command execution and file transfer over the system `ssh` client.
//!
//! Every call spawns a fresh `ssh` child through a [`CommandRunner`], with
//! host key checking relaxed for freshly provisioned instances and
//! key-based authentication only. Children are killed when their call ends
//! on any path, including timeouts and cancellation.

mod runner;

use std::ffi::OsString;
use std::net::IpAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use runner::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RunOptions, RunnerError, RunnerFuture,
};

/// Exit status `ssh` itself uses for connection-level failures.
const SSH_TRANSPORT_EXIT: i32 = 255;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);
const AUTH_FAILURE_PATTERNS: [&str; 3] = [
    "Permission denied",
    "Too many authentication failures",
    "Host key verification failed",
];

/// Connection settings shared by every channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user.
    pub user: String,
    /// Remote port.
    pub port: u16,
    /// Private key passed with `-i`.
    pub identity_file: Option<Utf8PathBuf>,
    /// Connection probes attempted before giving up.
    pub connect_attempts: u32,
    /// Pause between connection probes.
    pub connect_interval: Duration,
    /// Timeout for each probe, also passed to `ssh` as `ConnectTimeout`.
    pub connect_timeout: Duration,
}

/// Captured result of a remote command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteOutput {
    /// Exit status of the remote command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Errors surfaced by SSH operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshError {
    /// The host never accepted a connection within the retry budget.
    #[error("ssh to {address} not ready after {attempts} attempts: {last_error}")]
    ConnectTimeout {
        /// Target host.
        address: IpAddr,
        /// Probes made.
        attempts: u32,
        /// Last failure observed.
        last_error: String,
    },
    /// The host refused the operator's key or its host key.
    #[error("ssh authentication to {address} rejected: {message}")]
    AuthRejected {
        /// Target host.
        address: IpAddr,
        /// Diagnostic reported by `ssh`.
        message: String,
    },
    /// A remote command exceeded its timeout and was killed.
    #[error("remote command timed out after {}s", timeout.as_secs())]
    RemoteTimeout {
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The connection failed or dropped mid-command.
    #[error("ssh connection to {address} failed: {message}")]
    Transport {
        /// Target host.
        address: IpAddr,
        /// Diagnostic reported by `ssh` or the OS.
        message: String,
    },
    /// The `ssh` process ended without an exit status.
    #[error("ssh terminated without an exit status")]
    MissingExitCode,
    /// The `ssh` executable could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Uploading a file failed; the target was left untouched.
    #[error("failed to install {path} on the remote host: {message}")]
    TransferFailed {
        /// Remote target path.
        path: String,
        /// Diagnostic from the remote side.
        message: String,
    },
}

/// Builds channels to remote hosts.
#[derive(Clone, Debug)]
pub struct SshConnector<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
}

impl<R: CommandRunner + Clone> SshConnector<R> {
    /// Creates a connector with the given settings and runner.
    #[must_use]
    pub const fn new(settings: SshSettings, runner: R) -> Self {
        Self { settings, runner }
    }

    /// Returns the connection settings.
    #[must_use]
    pub const fn settings(&self) -> &SshSettings {
        &self.settings
    }

    /// Returns the process runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    /// Probes `address` with `ssh … true` until it answers, retrying refused,
    /// unreachable and timed-out connections at a fixed interval.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::AuthRejected`] immediately on key or host key
    /// rejection, [`SshError::Spawn`] when `ssh` cannot be started, and
    /// [`SshError::ConnectTimeout`] once every attempt has failed.
    pub async fn connect(&self, address: IpAddr) -> Result<SshChannel<R>, SshError> {
        let channel = self.attach(address);
        let attempts = self.settings.connect_attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            debug!(%address, attempt, attempts, "probing ssh");
            let args = channel.command_args("true", false);
            let result = self
                .runner
                .run(
                    &self.settings.ssh_bin,
                    &args,
                    RunOptions {
                        timeout: Some(self.settings.connect_timeout),
                        ..RunOptions::default()
                    },
                )
                .await;
            match result {
                Ok(output) if output.is_success() => {
                    info!(%address, attempt, "ssh connection established");
                    return Ok(channel);
                }
                Ok(output) => {
                    if let Some(message) = auth_failure(&output.stderr) {
                        return Err(SshError::AuthRejected { address, message });
                    }
                    last_error = summarise(&output);
                }
                Err(RunnerError::Spawn { program, message }) => {
                    return Err(SshError::Spawn { program, message });
                }
                Err(err) => last_error = err.to_string(),
            }

            if attempt < attempts {
                warn!(%address, attempt, attempts, error = %last_error, "ssh not ready; retrying");
                sleep(self.settings.connect_interval).await;
            }
        }

        Err(SshError::ConnectTimeout {
            address,
            attempts,
            last_error,
        })
    }

    /// Returns a channel to `address` without probing it first.
    #[must_use]
    pub fn attach(&self, address: IpAddr) -> SshChannel<R> {
        SshChannel {
            settings: self.settings.clone(),
            runner: self.runner.clone(),
            address,
        }
    }
}

/// A logical session with one remote host.
#[derive(Clone, Debug)]
pub struct SshChannel<R: CommandRunner> {
    settings: SshSettings,
    runner: R,
    address: IpAddr,
}

impl<R: CommandRunner> SshChannel<R> {
    /// Remote host this channel talks to.
    #[must_use]
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Runs `command` remotely and waits at most `timeout` for it.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::RemoteTimeout`] when the timeout elapses,
    /// [`SshError::Transport`] when `ssh` reports a connection failure, and
    /// [`SshError::MissingExitCode`] when no status was reported.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<RemoteOutput, SshError> {
        self.execute(command, None, timeout, false).await
    }

    /// Like [`SshChannel::run`], but logs each output line as it arrives.
    ///
    /// # Errors
    ///
    /// See [`SshChannel::run`].
    pub async fn run_streamed(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<RemoteOutput, SshError> {
        self.execute(command, None, timeout, true).await
    }

    /// Installs `bytes` at `remote_path` with `mode`.
    ///
    /// The content is streamed into a temporary file next to the target, its
    /// SHA-256 digest is verified remotely, the mode is applied and the file
    /// is renamed into place. On failure the temporary file is removed, so
    /// the target is either complete or untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::TransferFailed`] when any remote step fails, or
    /// the errors of [`SshChannel::run`].
    pub async fn put(
        &self,
        bytes: &[u8],
        remote_path: &str,
        mode: u32,
        timeout: Duration,
    ) -> Result<(), SshError> {
        let temp_path = format!("{remote_path}.clwd-{}", Uuid::new_v4().simple());
        let script = install_script(bytes, remote_path, &temp_path, mode);

        let result = self
            .execute(&script, Some(bytes.to_vec()), timeout, false)
            .await;
        match result {
            Ok(output) if output.exit_code == 0 => {
                debug!(path = remote_path, mode = format!("{mode:o}"), "remote file installed");
                Ok(())
            }
            Ok(output) => Err(SshError::TransferFailed {
                path: remote_path.to_owned(),
                message: output.stderr.trim().to_owned(),
            }),
            Err(err) => {
                if !matches!(err, SshError::Spawn { .. }) {
                    self.remove_quietly(&temp_path).await;
                }
                Err(err)
            }
        }
    }

    /// Opens an interactive session with a TTY, optionally running
    /// `command`, and returns its exit status.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Spawn`] when `ssh` cannot be started and
    /// [`SshError::MissingExitCode`] when no status was reported.
    pub async fn interactive(&self, command: Option<&str>) -> Result<i32, SshError> {
        let args = self.command_args(command.unwrap_or_default(), true);
        let code = self
            .runner
            .run_interactive(&self.settings.ssh_bin, &args)
            .await
            .map_err(|err| self.map_runner_error(err, self.settings.connect_timeout))?;
        code.ok_or(SshError::MissingExitCode)
    }

    /// Ends the session. Every call already completed its child process, so
    /// there is nothing left to reap.
    pub fn close(self) {
        debug!(address = %self.address, "ssh channel closed");
    }

    async fn remove_quietly(&self, temp_path: &str) {
        let command = format!("rm -f {}", escape(temp_path.into()));
        if let Err(err) = self.execute(&command, None, CLEANUP_TIMEOUT, false).await {
            debug!(error = %err, "temporary file cleanup failed");
        }
    }

    async fn execute(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
        stream: bool,
    ) -> Result<RemoteOutput, SshError> {
        let args = self.command_args(command, false);
        let output = self
            .runner
            .run(
                &self.settings.ssh_bin,
                &args,
                RunOptions {
                    stdin,
                    timeout: Some(timeout),
                    stream,
                },
            )
            .await
            .map_err(|err| self.map_runner_error(err, timeout))?;

        match output.code {
            None => Err(SshError::MissingExitCode),
            Some(SSH_TRANSPORT_EXIT) => Err(SshError::Transport {
                address: self.address,
                message: summarise(&output),
            }),
            Some(exit_code) => Ok(RemoteOutput {
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    fn map_runner_error(&self, err: RunnerError, timeout: Duration) -> SshError {
        match err {
            RunnerError::Spawn { program, message } => SshError::Spawn { program, message },
            RunnerError::TimedOut { .. } => SshError::RemoteTimeout { timeout },
            RunnerError::Io { message, .. } => SshError::Transport {
                address: self.address,
                message,
            },
        }
    }

    fn command_args(&self, command: &str, interactive: bool) -> Vec<OsString> {
        let mut args = Vec::new();
        if interactive {
            args.push(OsString::from("-t"));
        } else {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }
        for option in [
            String::from("StrictHostKeyChecking=no"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("LogLevel=ERROR"),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
            String::from("ServerAliveInterval=60"),
            String::from("ServerAliveCountMax=3"),
        ] {
            args.push(OsString::from("-o"));
            args.push(OsString::from(option));
        }
        args.push(OsString::from("-p"));
        args.push(OsString::from(self.settings.port.to_string()));
        if let Some(identity) = &self.settings.identity_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(identity.as_str()));
        }
        args.push(OsString::from(format!(
            "{}@{}",
            self.settings.user, self.address
        )));
        if !command.is_empty() {
            args.push(OsString::from(command));
        }
        args
    }
}

fn install_script(bytes: &[u8], remote_path: &str, temp_path: &str, mode: u32) -> String {
    let digest = format!("{:x}", Sha256::digest(bytes));
    let target = escape(remote_path.into());
    let temp = escape(temp_path.into());
    let parent_dir = remote_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
        .unwrap_or("/");
    let check = escape(format!("{digest}  {temp_path}").into());
    format!(
        "umask 077 && mkdir -p {parent} && cat > {temp} && \
         printf '%s\\n' {check} | sha256sum -c --status && \
         chmod {mode:o} {temp} && mv -f {temp} {target} \
         || {{ rm -f {temp}; exit 1; }}",
        parent = escape(parent_dir.into()),
    )
}

fn auth_failure(stderr: &str) -> Option<String> {
    AUTH_FAILURE_PATTERNS
        .iter()
        .any(|pattern| stderr.contains(pattern))
        .then(|| stderr.trim().to_owned())
}

fn summarise(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output
            .code
            .map_or_else(|| String::from("no exit status"), |code| format!("exit status {code}"))
    } else {
        stderr.to_owned()
    }
}

#[cfg(test)]
mod tests;
