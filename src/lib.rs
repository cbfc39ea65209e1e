//! Core library for the `clwd` remote agent workstation tool.
//!
//! The crate manages named projects, each backed by one cloud instance
//! running an AI coding agent. A project is created by provisioning an
//! instance through a [`Provider`], waiting for it to report networking,
//! connecting over SSH, injecting the operator's agent credential and
//! running a hardening script. Every transition is persisted in a
//! [`ProjectStore`] so interrupted runs can be resumed.

pub mod bootstrap;
pub mod config;
pub mod credential;
pub mod hetzner;
pub mod lifecycle;
pub mod project;
pub mod provider;
pub mod ssh;
pub mod store;
pub mod test_support;
pub mod util;

pub use bootstrap::{BootstrapResult, Bootstrapper};
pub use config::{ClwdConfig, ConfigError, HetznerConfig};
pub use credential::{
    ConfiguredCredentialSource, CredentialError, CredentialKind, CredentialSource,
    KeychainSource, SecretBlob, SessionFileSource,
};
pub use hetzner::HetznerProvider;
pub use lifecycle::{
    DestroyOutcome, InitOptions, LifecycleError, LifecycleOrchestrator, LifecyclePolicy,
    LifecycleStep, LogsReport, StatusReport,
};
pub use project::{HardeningTier, Project, ProjectSpec, ProjectStatus};
pub use provider::{InstanceSpec, InstanceState, InstanceStatus, Provider, ProviderError};
pub use ssh::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteOutput, SshChannel, SshConnector,
    SshError, SshSettings,
};
pub use store::{ProjectStore, StoreError, Tombstone};
