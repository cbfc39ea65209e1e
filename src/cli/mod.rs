//! Command-line interface definitions for the `clwd` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `clwd` binary.
#[derive(Debug, Parser)]
#[command(
    name = "clwd",
    version,
    about = "Provision and manage remote AI coding-agent development instances",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true, env = "CLWD_DEBUG")]
    pub(crate) debug: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `clwd`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create a project, or resume one that did not finish, until it is ready.
    Init(InitCommand),
    /// Run a command on a ready project.
    Exec(ExecCommand),
    /// Open an interactive shell on a ready project.
    Open(OpenCommand),
    /// Show a project's stored and live status.
    Status(NameArgs),
    /// Delete a project's instance and forget the project.
    Destroy(DestroyCommand),
    /// Show the remote bootstrap log and last recorded error.
    Logs(LogsCommand),
    /// Inspect stored projects.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Project selector shared by several subcommands.
#[derive(Debug, Args)]
pub(crate) struct NameArgs {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
}

/// Supported compute providers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum ProviderArg {
    /// Hetzner Cloud.
    #[default]
    Hetzner,
}

/// Hardening tiers accepted on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum TierArg {
    /// Base setup only.
    None,
    /// Firewall and key-only SSH.
    Minimal,
    /// Minimal plus tighter SSH limits and fail2ban.
    Full,
}

/// Arguments for `clwd init`.
#[derive(Debug, Args)]
pub(crate) struct InitCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Compute provider.
    #[arg(long, value_enum, default_value_t = ProviderArg::Hetzner)]
    pub(crate) provider: ProviderArg,
    /// Instance size (small, medium, large, or a provider server type).
    #[arg(long)]
    pub(crate) size: Option<String>,
    /// Provider region.
    #[arg(long)]
    pub(crate) region: Option<String>,
    /// Security hardening tier.
    #[arg(long, value_enum)]
    pub(crate) hardening: Option<TierArg>,
    /// Skip transferring the local agent credential.
    #[arg(long)]
    pub(crate) skip_auth: bool,
    /// Replace a record stuck in `destroying`.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `clwd exec`.
#[derive(Debug, Args)]
pub(crate) struct ExecCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Command timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `clwd open`.
#[derive(Debug, Args)]
pub(crate) struct OpenCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Optional command to run in the session instead of a login shell.
    #[arg(trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `clwd destroy`.
#[derive(Debug, Args)]
pub(crate) struct DestroyCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Skip the confirmation prompt.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `clwd logs`.
#[derive(Debug, Args)]
pub(crate) struct LogsCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Number of log lines to show.
    #[arg(long, default_value_t = 50)]
    pub(crate) lines: usize,
}

/// Subcommands of `clwd config`.
#[derive(Debug, Subcommand)]
pub(crate) enum ConfigCommand {
    /// List stored projects.
    List,
    /// Show one stored project.
    Show(ShowCommand),
}

/// Arguments for `clwd config show`.
#[derive(Debug, Args)]
pub(crate) struct ShowCommand {
    /// Project name.
    #[arg(long, short = 'n')]
    pub(crate) name: String,
    /// Print the raw JSON record.
    #[arg(long)]
    pub(crate) json: bool,
}
