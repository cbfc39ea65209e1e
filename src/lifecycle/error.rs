//! Error types for the lifecycle workflow.

use std::fmt;

use thiserror::Error;

use crate::credential::CredentialError;
use crate::project::{NameError, ProjectStatus};
use crate::provider::ProviderError;
use crate::ssh::SshError;
use crate::store::StoreError;

/// Step of a lifecycle operation an error is attributed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleStep {
    /// Checking the request against the stored record.
    Validate,
    /// Creating the instance.
    Provision,
    /// Waiting for the instance to report networking.
    AwaitNetwork,
    /// Establishing SSH.
    Connect,
    /// Retrieving and installing the agent credential.
    InjectCredentials,
    /// Running the bootstrap script.
    Bootstrap,
    /// Probing the instance after bootstrap.
    Liveness,
    /// Running an operator command on the instance.
    Remote,
    /// Deleting the instance.
    Destroy,
    /// Reading or writing the project store.
    Store,
}

impl LifecycleStep {
    /// Returns the label used in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Provision => "provision",
            Self::AwaitNetwork => "await-network",
            Self::Connect => "connect",
            Self::InjectCredentials => "inject-credentials",
            Self::Bootstrap => "bootstrap",
            Self::Liveness => "liveness",
            Self::Remote => "remote",
            Self::Destroy => "destroy",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised by [`super::LifecycleOrchestrator`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The project name is unusable.
    #[error(transparent)]
    InvalidName(#[from] NameError),
    /// No live project with this name exists.
    #[error("project '{0}' not found")]
    NotFound(String),
    /// `init` was asked to create a project that is already ready.
    #[error("project '{name}' already exists and is {status}")]
    AlreadyExists {
        /// Project name.
        name: String,
        /// Stored status.
        status: ProjectStatus,
    },
    /// The stored status does not allow the requested operation.
    #[error("cannot {operation} project '{name}' while it is {status}; {hint}")]
    StateMismatch {
        /// Project name.
        name: String,
        /// Stored status.
        status: ProjectStatus,
        /// Operation that was refused.
        operation: &'static str,
        /// What the operator can do about it.
        hint: &'static str,
    },
    /// The provider refused or failed to create the instance.
    #[error("provisioning failed: {0}")]
    Provision(#[source] ProviderError),
    /// The instance never reported networking within the wait budget.
    #[error("instance {instance_id} did not become reachable: {message}")]
    NetworkTimeout {
        /// Provider handle of the instance, which is left running.
        instance_id: String,
        /// Last observation or provider error.
        message: String,
    },
    /// An SSH operation failed.
    #[error("{step} failed: {source}")]
    Ssh {
        /// Step that issued the SSH call.
        step: LifecycleStep,
        /// Underlying SSH error.
        #[source]
        source: SshError,
    },
    /// The local agent credential could not be retrieved.
    #[error("credential retrieval failed: {0}")]
    Credential(#[source] CredentialError),
    /// Credential installation, the bootstrap script or the liveness probe
    /// failed on the instance.
    #[error("bootstrap failed during {step}: {message}")]
    BootstrapFailed {
        /// Failing step.
        step: LifecycleStep,
        /// Scrubbed description, including trailing remote output.
        message: String,
    },
    /// Every delete attempt failed; the record stays in `destroying`.
    #[error("failed to delete instance {instance_id} after {attempts} attempts: {source}")]
    DestroyFailed {
        /// Provider handle of the instance.
        instance_id: String,
        /// Attempts made.
        attempts: u32,
        /// Last provider error.
        #[source]
        source: ProviderError,
    },
    /// Reading or writing the project store failed.
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    /// A failure could not be recorded in the store.
    #[error("{primary} (recording the failure also failed: {store})")]
    PersistFailure {
        /// Error that triggered the write.
        primary: Box<LifecycleError>,
        /// Store error raised while recording it.
        store: StoreError,
    },
}

impl LifecycleError {
    /// Returns the step the error is attributed to.
    #[must_use]
    pub fn step(&self) -> LifecycleStep {
        match self {
            Self::InvalidName(_)
            | Self::NotFound(_)
            | Self::AlreadyExists { .. }
            | Self::StateMismatch { .. } => LifecycleStep::Validate,
            Self::Provision(_) => LifecycleStep::Provision,
            Self::NetworkTimeout { .. } => LifecycleStep::AwaitNetwork,
            Self::Ssh { step, .. } | Self::BootstrapFailed { step, .. } => *step,
            Self::Credential(_) => LifecycleStep::InjectCredentials,
            Self::DestroyFailed { .. } => LifecycleStep::Destroy,
            Self::Store(_) => LifecycleStep::Store,
            Self::PersistFailure { primary, .. } => primary.step(),
        }
    }

    /// Returns `true` when the error means the project does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
