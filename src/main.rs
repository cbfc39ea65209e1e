//! Binary entry point for the `clwd` CLI.

mod cli;

use std::fmt::Write as _;
use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use dialoguer::Confirm;
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use clwd::{
    ClwdConfig, ConfigError, ConfiguredCredentialSource, DestroyOutcome, HardeningTier,
    HetznerConfig, HetznerProvider, InitOptions, InstanceStatus, LifecycleError,
    LifecycleOrchestrator, LogsReport, ProcessCommandRunner, Project, ProjectStore,
    ProviderError, SshConnector, StatusReport, StoreError,
};
use cli::{
    Cli, Command, ConfigCommand, DestroyCommand, ExecCommand, InitCommand, LogsCommand,
    OpenCommand, ProviderArg, ShowCommand, TierArg,
};

type Orchestrator = LifecycleOrchestrator<
    HetznerProvider,
    ConfiguredCredentialSource<ProcessCommandRunner>,
    ProcessCommandRunner,
>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0} (step: {step})", step = .0.step())]
    Lifecycle(#[from] LifecycleError),
    #[error("provider setup failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to read confirmation: {0}")]
    Prompt(String),
    #[error("failed to write output: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let exit_code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},clwd::remote=info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .try_init()
        .ok();
}

async fn dispatch(command: Command) -> Result<i32, CliError> {
    let config = ClwdConfig::load_without_cli_args()?;
    config.validate()?;
    let orchestrator = build_orchestrator(&config)?;

    match command {
        Command::Init(args) => init(&orchestrator, &config, &args).await,
        Command::Exec(args) => exec(&orchestrator, &args).await,
        Command::Open(args) => open(&orchestrator, &args).await,
        Command::Status(args) => {
            let report = orchestrator.status(&args.name).await?;
            emit(&render_status(&report))?;
            Ok(0)
        }
        Command::Destroy(args) => destroy(&orchestrator, &args).await,
        Command::Logs(args) => logs(&orchestrator, &args).await,
        Command::Config(ConfigCommand::List) => {
            emit(&render_list(&orchestrator.list()?))?;
            Ok(0)
        }
        Command::Config(ConfigCommand::Show(args)) => show(&orchestrator, &args),
    }
}

fn build_orchestrator(config: &ClwdConfig) -> Result<Orchestrator, CliError> {
    let store = ProjectStore::open(config.state_dir()?)?;
    let provider = HetznerProvider::new(HetznerConfig::load_without_cli_args()?)?;
    let runner = ProcessCommandRunner;
    let credentials = ConfiguredCredentialSource::from_kind(
        config.credential_kind()?,
        &config.session_file,
        runner,
    );
    let ssh = SshConnector::new(config.ssh_settings(), runner);
    Ok(LifecycleOrchestrator::new(
        store,
        provider,
        credentials,
        ssh,
        config.lifecycle_policy(),
    ))
}

async fn init(
    orchestrator: &Orchestrator,
    config: &ClwdConfig,
    args: &InitCommand,
) -> Result<i32, CliError> {
    let spec = config.project_spec(
        args.size.as_deref(),
        args.region.as_deref(),
        args.hardening.map(tier_from_arg),
    )?;
    let existing = orchestrator.store().get(&args.name)?;
    check_provider(args.provider, orchestrator.provider_id(), existing.as_ref())?;
    debug!(
        provider = provider_label(args.provider),
        size = %spec.size,
        region = %spec.region,
        "initialising project"
    );
    let options = InitOptions {
        force: args.force,
        skip_auth: args.skip_auth,
    };
    let project = orchestrator.init(&args.name, &spec, options).await?;
    emit(&format!(
        "Project '{}' is ready at {} (instance {}).",
        project.name,
        display_or_dash(project.address),
        project.instance_id.as_deref().unwrap_or("-"),
    ))?;
    Ok(0)
}

const fn provider_label(provider: ProviderArg) -> &'static str {
    match provider {
        ProviderArg::Hetzner => clwd::hetzner::PROVIDER_ID,
    }
}

/// Rejects an `init` whose requested provider is not the one this binary
/// drives, or differs from the provider owning an existing record.
fn check_provider(
    requested: ProviderArg,
    active: &str,
    existing: Option<&Project>,
) -> Result<(), CliError> {
    let wanted = provider_label(requested);
    if wanted != active {
        return Err(CliError::InvalidCommand(format!(
            "provider '{wanted}' is not available; configured provider is '{active}'"
        )));
    }
    match existing {
        Some(project) if project.provider_id != wanted => {
            Err(CliError::InvalidCommand(format!(
                "project '{}' is owned by provider '{}', not '{wanted}'",
                project.name, project.provider_id
            )))
        }
        _ => Ok(()),
    }
}

async fn exec(orchestrator: &Orchestrator, args: &ExecCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let remote_command = render_remote_command(&args.command);
    let output = orchestrator
        .exec(
            &args.name,
            &remote_command,
            args.timeout.map(Duration::from_secs),
        )
        .await?;
    io::stdout()
        .write_all(output.stdout.as_bytes())
        .map_err(|err| CliError::Output(err.to_string()))?;
    io::stderr()
        .write_all(output.stderr.as_bytes())
        .map_err(|err| CliError::Output(err.to_string()))?;
    Ok(output.exit_code)
}

async fn open(orchestrator: &Orchestrator, args: &OpenCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let remote_command = (!args.command.is_empty()).then(|| render_remote_command(&args.command));
    Ok(orchestrator
        .open(&args.name, remote_command.as_deref())
        .await?)
}

async fn destroy(orchestrator: &Orchestrator, args: &DestroyCommand) -> Result<i32, CliError> {
    let stored = orchestrator.store().get(args.name.trim())?;
    if let Some(project) = &stored
        && !args.force
        && !confirm_destroy(project)?
    {
        emit("Aborted.")?;
        return Ok(1);
    }

    match orchestrator.destroy(&args.name).await? {
        DestroyOutcome::Destroyed { instance_id } => emit(&format!(
            "Project '{}' destroyed (instance {}).",
            args.name.trim(),
            instance_id.as_deref().unwrap_or("-")
        ))?,
        DestroyOutcome::AlreadyDestroyed => {
            emit(&format!("Project '{}' was already destroyed.", args.name.trim()))?;
        }
    }
    Ok(0)
}

fn confirm_destroy(project: &Project) -> Result<bool, CliError> {
    Confirm::new()
        .with_prompt(format!(
            "Destroy project '{}' and delete instance {}?",
            project.name,
            project.instance_id.as_deref().unwrap_or("(none)")
        ))
        .default(false)
        .interact()
        .map_err(|err| CliError::Prompt(err.to_string()))
}

async fn logs(orchestrator: &Orchestrator, args: &LogsCommand) -> Result<i32, CliError> {
    let report = orchestrator.logs(&args.name, args.lines).await?;
    emit(&render_logs(&report))?;
    Ok(0)
}

fn show(orchestrator: &Orchestrator, args: &ShowCommand) -> Result<i32, CliError> {
    let project = orchestrator.show(&args.name)?;
    if args.json {
        let rendered = serde_json::to_string_pretty(&project)
            .map_err(|err| CliError::Output(err.to_string()))?;
        emit(&rendered)?;
    } else {
        emit(&render_project(&project))?;
    }
    Ok(0)
}

const fn tier_from_arg(arg: TierArg) -> HardeningTier {
    match arg {
        TierArg::None => HardeningTier::None,
        TierArg::Minimal => HardeningTier::Minimal,
        TierArg::Full => HardeningTier::Full,
    }
}

fn display_or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| String::from("-"), |inner| inner.to_string())
}

fn render_project(project: &Project) -> String {
    let mut out = String::new();
    let fields = [
        ("name", project.name.clone()),
        ("status", project.status.to_string()),
        ("provider", project.provider_id.clone()),
        ("instance", display_or_dash(project.instance_id.as_deref())),
        ("address", display_or_dash(project.address)),
        ("size", project.size.clone()),
        ("region", project.region.clone()),
        ("image", project.image.clone()),
        ("hardening", project.hardening_tier.to_string()),
        ("created", project.created_at.to_rfc3339()),
        ("updated", project.updated_at.to_rfc3339()),
    ];
    for (label, value) in fields {
        writeln!(out, "{label:<10} {value}").ok();
    }
    if !project.last_error.is_empty() {
        writeln!(out, "{:<10} {}", "last error", project.last_error).ok();
    }
    out.trim_end().to_owned()
}

fn render_instance(instance: &InstanceStatus) -> String {
    format!(
        "{:?} ({})",
        instance.state,
        display_or_dash(instance.address)
    )
}

fn render_status(report: &StatusReport) -> String {
    let mut out = render_project(&report.project);
    match &report.instance {
        Some(Ok(instance)) => {
            write!(out, "\n{:<10} {}", "live", render_instance(instance)).ok();
        }
        Some(Err(err)) => {
            write!(out, "\n{:<10} unavailable: {err}", "live").ok();
        }
        None => {}
    }
    out
}

fn render_logs(report: &LogsReport) -> String {
    let project = &report.project;
    let mut out = format!("Project '{}' is {}.", project.name, project.status);
    if !project.last_error.is_empty() {
        write!(out, "\nLast error:\n{}", project.last_error).ok();
    }
    match &report.remote {
        Some(Ok(output)) if output.exit_code == 0 => {
            write!(out, "\nRemote bootstrap log:\n{}", output.stdout.trim_end()).ok();
        }
        Some(Ok(output)) => {
            write!(
                out,
                "\nRemote bootstrap log unavailable: {}",
                output.stderr.trim()
            )
            .ok();
        }
        Some(Err(err)) => {
            write!(out, "\nRemote bootstrap log unavailable: {err}").ok();
        }
        None => {
            out.push_str("\nNo address recorded; the instance has no remote log yet.");
        }
    }
    out
}

fn render_list(projects: &[Project]) -> String {
    if projects.is_empty() {
        return String::from("No projects found.");
    }
    let mut out = format!(
        "{:<24} {:<18} {:<10} {:<16} {:<9} {}",
        "NAME", "STATUS", "PROVIDER", "ADDRESS", "TIER", "UPDATED"
    );
    for project in projects {
        write!(
            out,
            "\n{:<24} {:<18} {:<10} {:<16} {:<9} {}",
            project.name,
            project.status.as_str(),
            project.provider_id,
            display_or_dash(project.address),
            project.hardening_tier.as_str(),
            project.updated_at.format("%Y-%m-%d %H:%M")
        )
        .ok();
    }
    out
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| escape(arg.as_str().into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn emit(text: &str) -> Result<(), CliError> {
    writeln!(io::stdout(), "{text}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
