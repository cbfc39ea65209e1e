//! Project lifecycle orchestration.
//!
//! [`LifecycleOrchestrator`] sequences provider calls, readiness polling,
//! SSH, credential injection and bootstrap into the `init` workflow, and
//! implements the read-mostly operations on existing projects. Every
//! transition is written to the [`ProjectStore`] before the next step
//! starts, so an interrupted run leaves a record that `init` can resume.

mod error;

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::bootstrap::{Bootstrapper, REMOTE_LOG_PATH};
use crate::credential::{CredentialSource, SecretBlob};
use crate::project::{Project, ProjectSpec, ProjectStatus, validate_name};
use crate::provider::{InstanceSpec, InstanceStatus, Provider, ProviderError};
use crate::ssh::{CommandRunner, RemoteOutput, SshChannel, SshConnector, SshError};
use crate::store::ProjectStore;
use crate::util::{redact, tail_lines};

pub use error::{LifecycleError, LifecycleStep};

/// Marker echoed by the liveness probe.
pub const LIVENESS_MARKER: &str = "clwd-liveness-ok";
const CREDENTIAL_MODE: u32 = 0o600;
const FAILURE_TAIL_LINES: usize = 20;

/// Timing policy for lifecycle operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LifecyclePolicy {
    /// First pause between readiness polls.
    pub poll_initial: Duration,
    /// Factor applied to the pause after each poll.
    pub poll_factor: u32,
    /// Upper bound on the pause between polls.
    pub poll_max: Duration,
    /// Total time allowed for the instance to report networking.
    pub provision_budget: Duration,
    /// Delete attempts made by `destroy`.
    pub delete_attempts: u32,
    /// Pause between delete attempts.
    pub delete_interval: Duration,
    /// Timeout for operator commands, file uploads and log reads.
    pub command_timeout: Duration,
    /// Timeout for the bootstrap script.
    pub bootstrap_timeout: Duration,
    /// Timeout for the liveness probe.
    pub liveness_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            poll_initial: Duration::from_secs(2),
            poll_factor: 2,
            poll_max: Duration::from_secs(15),
            provision_budget: Duration::from_secs(180),
            delete_attempts: 3,
            delete_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(120),
            bootstrap_timeout: Duration::from_secs(1800),
            liveness_timeout: Duration::from_secs(30),
        }
    }
}

/// Flags accepted by [`LifecycleOrchestrator::init`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InitOptions {
    /// Replace a record stuck in `destroying` with a fresh one.
    pub force: bool,
    /// Skip credential retrieval and injection.
    pub skip_auth: bool,
}

/// Result of [`LifecycleOrchestrator::destroy`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DestroyOutcome {
    /// The instance was deleted (or never existed) and the record removed.
    Destroyed {
        /// Provider handle of the deleted instance.
        instance_id: Option<String>,
    },
    /// The project had already been destroyed; nothing was done.
    AlreadyDestroyed,
}

/// Snapshot returned by [`LifecycleOrchestrator::status`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatusReport {
    /// Stored record.
    pub project: Project,
    /// Live provider view, when the project has an instance.
    pub instance: Option<Result<InstanceStatus, ProviderError>>,
}

/// Output of [`LifecycleOrchestrator::logs`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogsReport {
    /// Stored record, including its `last_error`.
    pub project: Project,
    /// Tail of the remote bootstrap log, when the project has an address.
    pub remote: Option<Result<RemoteOutput, SshError>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    Create,
    Poll,
    Connect,
}

/// Drives projects through their lifecycle.
#[derive(Debug)]
pub struct LifecycleOrchestrator<P, C, R: CommandRunner> {
    store: ProjectStore,
    provider: P,
    credentials: C,
    ssh: SshConnector<R>,
    policy: LifecyclePolicy,
}

impl<P, C, R> LifecycleOrchestrator<P, C, R>
where
    P: Provider,
    C: CredentialSource,
    R: CommandRunner + Clone,
{
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub const fn new(
        store: ProjectStore,
        provider: P,
        credentials: C,
        ssh: SshConnector<R>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            provider,
            credentials,
            ssh,
            policy,
        }
    }

    /// Returns the project store.
    #[must_use]
    pub const fn store(&self) -> &ProjectStore {
        &self.store
    }

    /// Returns the identifier of the provider new records are created with.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        self.provider.id()
    }

    /// Creates a project, or resumes one left in an incomplete state, and
    /// drives it to `ready`.
    ///
    /// Resumed projects keep the parameters they were first created with;
    /// `spec` only applies to new records.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] naming the failing step. Every failure
    /// after validation is recorded on the project before returning, and no
    /// failure deletes the instance.
    pub async fn init(
        &self,
        name: &str,
        spec: &ProjectSpec,
        options: InitOptions,
    ) -> Result<Project, LifecycleError> {
        let project_name = validate_name(name)?;
        let (mut project, stage) = match self.store.get(&project_name)? {
            None => (self.fresh_record(&project_name, spec), Stage::Create),
            Some(existing) => self.resume_point(existing, spec, options.force)?,
        };
        info!(project = %project.name, stage = ?stage, "starting init");

        let instance_id = match (stage, project.instance_id.clone()) {
            (Stage::Poll | Stage::Connect, Some(id)) => id,
            _ => self.provision(&mut project).await?,
        };
        let address = match (stage, project.address) {
            (Stage::Connect, Some(address)) => {
                self.transition(&mut project, ProjectStatus::Bootstrapping)?;
                address
            }
            _ => self.await_network(&mut project, &instance_id).await?,
        };
        self.bootstrap(&mut project, address, options.skip_auth)
            .await?;
        Ok(project)
    }

    /// Runs `command` on a ready project and returns its captured output.
    /// `timeout` defaults to the policy's command timeout.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StateMismatch`] without any remote call
    /// when the project is not ready, and [`LifecycleError::Ssh`] when the
    /// command cannot be run.
    pub async fn exec(
        &self,
        name: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<RemoteOutput, LifecycleError> {
        let (project, address) = self.require_ready(name, "exec")?;
        debug!(project = %project.name, command, "running remote command");
        self.ssh
            .attach(address)
            .run(command, timeout.unwrap_or(self.policy.command_timeout))
            .await
            .map_err(|source| LifecycleError::Ssh {
                step: LifecycleStep::Remote,
                source,
            })
    }

    /// Opens an interactive session on a ready project and returns the
    /// session's exit status.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::StateMismatch`] without any remote call
    /// when the project is not ready, and [`LifecycleError::Ssh`] when `ssh`
    /// cannot be run.
    pub async fn open(&self, name: &str, command: Option<&str>) -> Result<i32, LifecycleError> {
        let (project, address) = self.require_ready(name, "open")?;
        info!(project = %project.name, %address, "opening interactive session");
        self.ssh
            .attach(address)
            .interactive(command)
            .await
            .map_err(|source| LifecycleError::Ssh {
                step: LifecycleStep::Remote,
                source,
            })
    }

    /// Returns the stored record together with the provider's live view of
    /// its instance. Provider errors are reported, not recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for unknown names.
    pub async fn status(&self, name: &str) -> Result<StatusReport, LifecycleError> {
        let project = self.show(name)?;
        let instance = match project.instance_id.as_deref() {
            Some(instance_id) => Some(self.provider.get_status(instance_id).await),
            None => None,
        };
        Ok(StatusReport { project, instance })
    }

    /// Deletes the project's instance and removes its record.
    ///
    /// Works from every stored status. Projects that were already destroyed
    /// report [`DestroyOutcome::AlreadyDestroyed`] without provider calls.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for names that were never
    /// stored, and [`LifecycleError::DestroyFailed`] when every delete
    /// attempt fails; the record then stays in `destroying`.
    pub async fn destroy(&self, name: &str) -> Result<DestroyOutcome, LifecycleError> {
        let project_name = validate_name(name)?;
        let Some(mut project) = self.store.get(&project_name)? else {
            if self.store.tombstone(&project_name)?.is_some() {
                info!(project = %project_name, "project already destroyed");
                return Ok(DestroyOutcome::AlreadyDestroyed);
            }
            return Err(LifecycleError::NotFound(project_name));
        };

        let prior_error = project.last_error.clone();
        self.transition(&mut project, ProjectStatus::Destroying)?;
        if let Some(instance_id) = project.instance_id.clone() {
            if let Err((attempts, source)) = self.delete_with_retries(&instance_id).await {
                let message = if prior_error.is_empty() {
                    source.to_string()
                } else {
                    format!("{source} (previously: {prior_error})")
                };
                let failure = LifecycleError::DestroyFailed {
                    instance_id,
                    attempts,
                    source,
                };
                return Err(self.record_failure(
                    &mut project,
                    ProjectStatus::Destroying,
                    message,
                    failure,
                ));
            }
        }

        self.store.remove(&project.name, Utc::now())?;
        info!(project = %project.name, status = %ProjectStatus::Destroyed, "project destroyed");
        Ok(DestroyOutcome::Destroyed {
            instance_id: project.instance_id,
        })
    }

    /// Returns the stored record and, when the project has an address, the
    /// last `lines` lines of the remote bootstrap log.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for unknown names. Remote
    /// failures are reported inside [`LogsReport`].
    pub async fn logs(&self, name: &str, lines: usize) -> Result<LogsReport, LifecycleError> {
        let project = self.show(name)?;
        let remote = match project.address {
            Some(address) => {
                let command = format!("tail -n {} {REMOTE_LOG_PATH}", lines.max(1));
                Some(
                    self.ssh
                        .attach(address)
                        .run(&command, self.policy.command_timeout)
                        .await,
                )
            }
            None => None,
        };
        Ok(LogsReport { project, remote })
    }

    /// Lists stored projects sorted by name.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Store`] when the store cannot be read.
    pub fn list(&self) -> Result<Vec<Project>, LifecycleError> {
        Ok(self.store.list()?)
    }

    /// Returns one stored project.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::NotFound`] for unknown names.
    pub fn show(&self, name: &str) -> Result<Project, LifecycleError> {
        let project_name = validate_name(name)?;
        self.store
            .get(&project_name)?
            .ok_or(LifecycleError::NotFound(project_name))
    }

    fn fresh_record(&self, name: &str, spec: &ProjectSpec) -> Project {
        Project::new(name, self.provider.id(), spec, Utc::now())
    }

    fn resume_point(
        &self,
        existing: Project,
        spec: &ProjectSpec,
        force: bool,
    ) -> Result<(Project, Stage), LifecycleError> {
        let stage = match existing.status {
            ProjectStatus::Ready => {
                return Err(LifecycleError::AlreadyExists {
                    name: existing.name,
                    status: existing.status,
                });
            }
            ProjectStatus::Destroying if force => {
                warn!(
                    project = %existing.name,
                    instance_id = existing.instance_id.as_deref().unwrap_or("none"),
                    "replacing a record that was being destroyed; its instance may be orphaned"
                );
                return Ok((self.fresh_record(&existing.name, spec), Stage::Create));
            }
            ProjectStatus::Destroying => {
                return Err(LifecycleError::StateMismatch {
                    name: existing.name,
                    status: existing.status,
                    operation: "init",
                    hint: "finish with `destroy` or rerun init with --force",
                });
            }
            ProjectStatus::Destroyed => {
                return Ok((self.fresh_record(&existing.name, spec), Stage::Create));
            }
            ProjectStatus::Requested | ProjectStatus::ProvisionFailed => Stage::Create,
            ProjectStatus::Provisioning
            | ProjectStatus::AwaitingNetwork
            | ProjectStatus::NetworkTimeout => Stage::Poll,
            ProjectStatus::Bootstrapping | ProjectStatus::BootstrapFailed => Stage::Connect,
        };
        let effective = match (stage, &existing.instance_id, existing.address) {
            (_, None, _) => Stage::Create,
            (Stage::Connect, Some(_), None) => Stage::Poll,
            _ => stage,
        };
        if existing.spec() != *spec {
            info!(
                project = %existing.name,
                "resuming with the parameters the project was created with"
            );
        }
        info!(project = %existing.name, status = %existing.status, "resuming project");
        Ok((existing, effective))
    }

    async fn provision(&self, project: &mut Project) -> Result<String, LifecycleError> {
        project.instance_id = None;
        project.address = None;
        self.transition(project, ProjectStatus::Requested)?;

        let request = InstanceSpec {
            project: project.name.clone(),
            size: project.size.clone(),
            region: project.region.clone(),
            image: project.image.clone(),
            hardening_tier: project.hardening_tier,
        };
        match self.provider.create(&request).await {
            Ok(instance_id) => {
                project.instance_id = Some(instance_id.clone());
                self.transition(project, ProjectStatus::Provisioning)?;
                Ok(instance_id)
            }
            Err(err) => {
                let message = err.message().to_owned();
                Err(self.record_failure(
                    project,
                    ProjectStatus::ProvisionFailed,
                    message,
                    LifecycleError::Provision(err),
                ))
            }
        }
    }

    async fn await_network(
        &self,
        project: &mut Project,
        instance_id: &str,
    ) -> Result<IpAddr, LifecycleError> {
        self.transition(project, ProjectStatus::AwaitingNetwork)?;
        let budget = self.policy.provision_budget;
        let deadline = Instant::now() + budget;
        let mut pause = self.policy.poll_initial;
        let mut last_observation = String::from("no status received");

        loop {
            match self.provider.get_status(instance_id).await {
                Ok(status) => {
                    if let Some(address) = status.ready_address() {
                        project.address = Some(address);
                        self.transition(project, ProjectStatus::Bootstrapping)?;
                        return Ok(address);
                    }
                    debug!(instance_id, state = ?status.state, "instance not ready");
                    last_observation = format!("last reported state {:?}", status.state);
                }
                Err(err) if err.is_retryable() => {
                    warn!(instance_id, error = %err, "status poll failed; retrying");
                    last_observation = err.to_string();
                }
                Err(err) => {
                    let message = err.message().to_owned();
                    let failure = LifecycleError::NetworkTimeout {
                        instance_id: instance_id.to_owned(),
                        message: err.to_string(),
                    };
                    return Err(self.record_failure(
                        project,
                        ProjectStatus::NetworkTimeout,
                        message,
                        failure,
                    ));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            sleep(pause.min(remaining)).await;
            pause = pause
                .saturating_mul(self.policy.poll_factor.max(1))
                .min(self.policy.poll_max);
        }

        let message = format!(
            "not running with an address after {}s ({last_observation})",
            budget.as_secs()
        );
        let failure = LifecycleError::NetworkTimeout {
            instance_id: instance_id.to_owned(),
            message: message.clone(),
        };
        Err(self.record_failure(project, ProjectStatus::NetworkTimeout, message, failure))
    }

    async fn bootstrap(
        &self,
        project: &mut Project,
        address: IpAddr,
        skip_auth: bool,
    ) -> Result<(), LifecycleError> {
        let channel = match self.ssh.connect(address).await {
            Ok(channel) => channel,
            Err(source) => {
                let failure = LifecycleError::Ssh {
                    step: LifecycleStep::Connect,
                    source,
                };
                let message = failure.to_string();
                return Err(self.record_failure(
                    project,
                    ProjectStatus::BootstrapFailed,
                    message,
                    failure,
                ));
            }
        };

        let secret = if skip_auth {
            info!(project = %project.name, "skipping credential injection");
            None
        } else {
            Some(self.inject_credentials(project, &channel).await?)
        };

        let bootstrapper =
            Bootstrapper::new(self.policy.bootstrap_timeout, self.policy.command_timeout);
        let outcome = bootstrapper.run(&channel, project.hardening_tier).await;
        let bootstrap_failure = match outcome {
            Ok(result) if result.succeeded => None,
            Ok(result) => Some(if result.exit_code == 0 {
                format!(
                    "script finished without the completion marker:\n{}",
                    result.captured_output
                )
            } else {
                format!(
                    "script exited with status {}:\n{}",
                    result.exit_code, result.captured_output
                )
            }),
            Err(err) => Some(err.to_string()),
        };
        if let Some(detail) = bootstrap_failure {
            return Err(self.bootstrap_failure(
                project,
                LifecycleStep::Bootstrap,
                &detail,
                secret.as_ref(),
            ));
        }

        if let Err(detail) = self.probe_liveness(&channel).await {
            return Err(self.bootstrap_failure(
                project,
                LifecycleStep::Liveness,
                &detail,
                secret.as_ref(),
            ));
        }
        channel.close();

        self.transition(project, ProjectStatus::Ready)?;
        Ok(())
    }

    async fn inject_credentials(
        &self,
        project: &mut Project,
        channel: &SshChannel<R>,
    ) -> Result<SecretBlob, LifecycleError> {
        let secret = match self.credentials.get().await {
            Ok(secret) => secret,
            Err(err) => {
                let message = err.to_string();
                return Err(self.record_failure(
                    project,
                    ProjectStatus::BootstrapFailed,
                    message,
                    LifecycleError::Credential(err),
                ));
            }
        };
        let install_path = self.credentials.install_path();
        if let Err(err) = channel
            .put(
                secret.expose(),
                install_path,
                CREDENTIAL_MODE,
                self.policy.command_timeout,
            )
            .await
        {
            return Err(self.bootstrap_failure(
                project,
                LifecycleStep::InjectCredentials,
                &err.to_string(),
                Some(&secret),
            ));
        }
        info!(project = %project.name, path = install_path, "credential installed");
        Ok(secret)
    }

    async fn probe_liveness(&self, channel: &SshChannel<R>) -> Result<(), String> {
        let output = channel
            .run(
                &format!("echo {LIVENESS_MARKER}"),
                self.policy.liveness_timeout,
            )
            .await
            .map_err(|err| err.to_string())?;
        if output.exit_code == 0 && output.stdout.trim() == LIVENESS_MARKER {
            debug!(address = %channel.address(), "liveness probe answered");
            return Ok(());
        }
        Err(format!(
            "liveness probe exited with status {} and printed {:?}",
            output.exit_code,
            output.stdout.trim()
        ))
    }

    async fn delete_with_retries(&self, instance_id: &str) -> Result<(), (u32, ProviderError)> {
        let attempts = self.policy.delete_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.provider.delete(instance_id).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(instance_id, attempt, attempts, error = %err, "delete failed; retrying");
                    sleep(self.policy.delete_interval).await;
                    attempt += 1;
                }
                Err(err) => return Err((attempt, err)),
            }
        }
    }

    fn require_ready(
        &self,
        name: &str,
        operation: &'static str,
    ) -> Result<(Project, IpAddr), LifecycleError> {
        let project = self.show(name)?;
        match (project.status, project.address) {
            (ProjectStatus::Ready, Some(address)) => Ok((project, address)),
            (status, _) => Err(LifecycleError::StateMismatch {
                name: project.name,
                status,
                operation,
                hint: "run `clwd init` until the project is ready",
            }),
        }
    }

    fn bootstrap_failure(
        &self,
        project: &mut Project,
        step: LifecycleStep,
        detail: &str,
        secret: Option<&SecretBlob>,
    ) -> LifecycleError {
        let secrets: Vec<&str> = secret.and_then(SecretBlob::as_str).into_iter().collect();
        let message = tail_lines(&redact(detail, &secrets), FAILURE_TAIL_LINES);
        let failure = LifecycleError::BootstrapFailed {
            step,
            message: message.clone(),
        };
        self.record_failure(project, ProjectStatus::BootstrapFailed, message, failure)
    }

    fn transition(
        &self,
        project: &mut Project,
        status: ProjectStatus,
    ) -> Result<(), LifecycleError> {
        project.advance(status, Utc::now());
        self.store.upsert(project)?;
        info!(project = %project.name, %status, "project transitioned");
        Ok(())
    }

    fn record_failure(
        &self,
        project: &mut Project,
        status: ProjectStatus,
        message: String,
        failure: LifecycleError,
    ) -> LifecycleError {
        warn!(
            project = %project.name,
            %status,
            step = %failure.step(),
            error = %failure,
            "lifecycle step failed"
        );
        project.fail(status, message, Utc::now());
        match self.store.upsert(project) {
            Ok(()) => failure,
            Err(store) => LifecycleError::PersistFailure {
                primary: Box::new(failure),
                store,
            },
        }
    }
}
