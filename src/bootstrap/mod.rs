//! Setup and hardening of freshly provisioned instances.
//!
//! A script is assembled from the shared base setup, the hardening section
//! for the requested tier and a completion sentinel. It is uploaded over the
//! SSH channel, executed with its output streamed to the local log and
//! appended to a log file on the instance, and judged by its exit status and
//! the sentinel on the last line of output.

use std::time::Duration;

use tracing::{info, warn};

use crate::project::HardeningTier;
use crate::ssh::{CommandRunner, RemoteOutput, SshChannel, SshError};
use crate::util::tail_lines;

/// Line printed by the script once every step succeeded.
pub const SENTINEL: &str = "CLWD_BOOTSTRAP_OK";
/// Remote location of the uploaded script.
pub const REMOTE_SCRIPT_PATH: &str = "/root/clwd-bootstrap.sh";
/// Remote log file the script output is appended to.
pub const REMOTE_LOG_PATH: &str = "/var/log/clwd-bootstrap.log";
/// Lines of output kept in [`BootstrapResult::captured_output`].
pub const CAPTURED_TAIL_LINES: usize = 40;
const SCRIPT_MODE: u32 = 0o700;

const BASE_SCRIPT: &str = include_str!("scripts/base.sh");
const MINIMAL_SCRIPT: &str = include_str!("scripts/minimal.sh");
const FULL_SCRIPT: &str = include_str!("scripts/full.sh");

/// Outcome of a bootstrap run that reached the instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootstrapResult {
    /// `true` when the script exited 0 and printed the sentinel last.
    pub succeeded: bool,
    /// Exit status of the remote script.
    pub exit_code: i32,
    /// Tail of the combined script output.
    pub captured_output: String,
}

/// Renders the full script for `tier`.
#[must_use]
pub fn render_script(tier: HardeningTier) -> String {
    let hardening = match tier {
        HardeningTier::None => "# No hardening requested.\n",
        HardeningTier::Minimal => MINIMAL_SCRIPT,
        HardeningTier::Full => FULL_SCRIPT,
    };
    format!("{BASE_SCRIPT}\n# Hardening tier: {tier}\n{hardening}\necho {SENTINEL}\n")
}

/// Command that runs the uploaded script and tees its output to the remote
/// log.
#[must_use]
pub fn run_command() -> String {
    format!(
        "bash -o pipefail -c 'bash {REMOTE_SCRIPT_PATH} 2>&1 | tee -a {REMOTE_LOG_PATH}'"
    )
}

/// Judges a finished script run.
#[must_use]
pub fn interpret(output: &RemoteOutput) -> BootstrapResult {
    let last_line = output
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    let sentinel_seen = last_line == Some(SENTINEL);
    let mut combined = output.stdout.clone();
    if !output.stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&output.stderr);
    }
    BootstrapResult {
        succeeded: output.exit_code == 0 && sentinel_seen,
        exit_code: output.exit_code,
        captured_output: tail_lines(&combined, CAPTURED_TAIL_LINES),
    }
}

/// Uploads and runs bootstrap scripts over an SSH channel.
#[derive(Clone, Copy, Debug)]
pub struct Bootstrapper {
    run_timeout: Duration,
    upload_timeout: Duration,
}

impl Bootstrapper {
    /// Creates a bootstrapper bounding the script run by `run_timeout` and
    /// the upload by `upload_timeout`.
    #[must_use]
    pub const fn new(run_timeout: Duration, upload_timeout: Duration) -> Self {
        Self {
            run_timeout,
            upload_timeout,
        }
    }

    /// Uploads the script for `tier` and runs it to completion.
    ///
    /// # Errors
    ///
    /// Returns the [`SshError`] of the upload or of the remote run. A script
    /// that runs but fails is reported through [`BootstrapResult`].
    pub async fn run<R: CommandRunner>(
        &self,
        channel: &SshChannel<R>,
        tier: HardeningTier,
    ) -> Result<BootstrapResult, SshError> {
        let script = render_script(tier);
        channel
            .put(
                script.as_bytes(),
                REMOTE_SCRIPT_PATH,
                SCRIPT_MODE,
                self.upload_timeout,
            )
            .await?;

        info!(address = %channel.address(), %tier, "running bootstrap script");
        let output = channel
            .run_streamed(&run_command(), self.run_timeout)
            .await?;
        let result = interpret(&output);
        if result.succeeded {
            info!(address = %channel.address(), "bootstrap completed");
        } else {
            warn!(
                address = %channel.address(),
                exit_code = result.exit_code,
                "bootstrap did not complete"
            );
        }
        Ok(result)
    }
}
