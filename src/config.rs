//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `clwd.toml` (discovered through `CLWD_CONFIG_PATH`,
//! the user config directory, a dotfile, or the project directory) and
//! environment variables, in that order of precedence.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::credential::CredentialKind;
use crate::lifecycle::LifecyclePolicy;
use crate::project::{HardeningTier, ProjectSpec};
use crate::ssh::SshSettings;
use crate::util::{expand_tilde, home_dir};

/// Default state directory, relative to the home directory.
pub const DEFAULT_STATE_DIR_NAME: &str = ".clwd";
/// Default Hetzner Cloud API endpoint.
pub const DEFAULT_HETZNER_API_URL: &str = "https://api.hetzner.cloud/v1";

/// Orchestrator settings shared by every command.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CLWD",
    discovery(
        app_name = "clwd",
        env_var = "CLWD_CONFIG_PATH",
        config_file_name = "clwd.toml",
        dotfile_name = ".clwd.toml",
        project_file_name = "clwd.toml"
    )
)]
pub struct ClwdConfig {
    /// Directory holding `projects.json`. Defaults to `~/.clwd`.
    pub state_dir: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key passed with `-i`. Supports `~/` expansion; when unset SSH
    /// falls back to its default key locations.
    pub ssh_identity_file: Option<String>,
    /// Connection probes attempted before giving up.
    #[ortho_config(default = 12)]
    pub connect_attempts: u32,
    /// Pause between connection probes, in seconds.
    #[ortho_config(default = 5)]
    pub connect_interval_secs: u64,
    /// Timeout applied to each connection probe, in seconds.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Default timeout for remote commands, in seconds.
    #[ortho_config(default = 120)]
    pub command_timeout_secs: u64,
    /// Timeout for the bootstrap script, in seconds.
    #[ortho_config(default = 1800)]
    pub bootstrap_timeout_secs: u64,
    /// Total budget for the instance to report running with an address, in
    /// seconds.
    #[ortho_config(default = 180)]
    pub provision_timeout_secs: u64,
    /// Where the agent credential is read from: `session-file` or `keychain`.
    #[ortho_config(default = "session-file".to_owned())]
    pub credential_source: String,
    /// Session file used by the `session-file` credential source.
    #[ortho_config(default = "~/.claude.json".to_owned())]
    pub session_file: String,
    /// Size alias or server type used when `init` omits `--size`.
    #[ortho_config(default = "small".to_owned())]
    pub default_size: String,
    /// Region used when `init` omits `--region`.
    #[ortho_config(default = "nbg1".to_owned())]
    pub default_region: String,
    /// Boot image for new instances.
    #[ortho_config(default = "ubuntu-24.04".to_owned())]
    pub default_image: String,
    /// Hardening tier used when `init` omits `--hardening`.
    #[ortho_config(default = "none".to_owned())]
    pub default_hardening: String,
}

/// Hetzner Cloud credentials and endpoint.
#[derive(Clone, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HETZNER",
    discovery(
        app_name = "clwd",
        env_var = "CLWD_CONFIG_PATH",
        config_file_name = "clwd.toml",
        dotfile_name = ".clwd.toml",
        project_file_name = "clwd.toml"
    )
)]
pub struct HetznerConfig {
    /// API token. Only commands that talk to the provider require it.
    pub api_token: Option<String>,
    /// Base URL of the REST API.
    #[ortho_config(default = DEFAULT_HETZNER_API_URL.to_owned())]
    pub api_base_url: String,
    /// Public key registered with the provider. When unset the first of
    /// `~/.ssh/id_ed25519.pub`, `~/.ssh/id_rsa.pub` and `~/.ssh/id_ecdsa.pub`
    /// that exists is used.
    pub ssh_public_key_file: Option<String>,
}

impl std::fmt::Debug for HetznerConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HetznerConfig")
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_base_url", &self.api_base_url)
            .field("ssh_public_key_file", &self.ssh_public_key_file)
            .finish()
    }
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to clwd.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, detail: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {}: {detail}; set {} or {} in clwd.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const SSH_BIN: FieldMetadata = FieldMetadata::new("ssh executable", "CLWD_SSH_BIN", "ssh_bin");
const SSH_USER: FieldMetadata = FieldMetadata::new("SSH user", "CLWD_SSH_USER", "ssh_user");
const SSH_IDENTITY: FieldMetadata = FieldMetadata::new(
    "SSH identity file",
    "CLWD_SSH_IDENTITY_FILE",
    "ssh_identity_file",
);
const CONNECT_ATTEMPTS: FieldMetadata = FieldMetadata::new(
    "connection attempt count",
    "CLWD_CONNECT_ATTEMPTS",
    "connect_attempts",
);
const CREDENTIAL_SOURCE: FieldMetadata = FieldMetadata::new(
    "credential source",
    "CLWD_CREDENTIAL_SOURCE",
    "credential_source",
);
const DEFAULT_HARDENING: FieldMetadata = FieldMetadata::new(
    "default hardening tier",
    "CLWD_DEFAULT_HARDENING",
    "default_hardening",
);
const STATE_DIR: FieldMetadata =
    FieldMetadata::new("state directory", "CLWD_STATE_DIR", "state_dir");
const API_TOKEN: FieldMetadata =
    FieldMetadata::new("Hetzner API token", "HETZNER_API_TOKEN", "api_token");

fn require(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl ClwdConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("clwd")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that set the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required value is empty or malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require(&self.ssh_bin, &SSH_BIN)?;
        require(&self.ssh_user, &SSH_USER)?;
        if let Some(identity) = &self.ssh_identity_file {
            require(identity, &SSH_IDENTITY)?;
        }
        if self.connect_attempts == 0 {
            return Err(CONNECT_ATTEMPTS.invalid("must be at least 1"));
        }
        self.credential_kind()?;
        self.default_hardening_tier()?;
        Ok(())
    }

    /// Resolves the state directory, defaulting to `~/.clwd`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no state directory is
    /// configured and the home directory cannot be determined.
    pub fn state_dir(&self) -> Result<Utf8PathBuf, ConfigError> {
        match &self.state_dir {
            Some(dir) if !dir.trim().is_empty() => Ok(Utf8PathBuf::from(expand_tilde(dir.trim()))),
            _ => home_dir()
                .map(|home| home.join(DEFAULT_STATE_DIR_NAME))
                .ok_or_else(|| STATE_DIR.missing()),
        }
    }

    /// Parses the configured credential source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown source names.
    pub fn credential_kind(&self) -> Result<CredentialKind, ConfigError> {
        self.credential_source
            .parse::<CredentialKind>()
            .map_err(|err| CREDENTIAL_SOURCE.invalid(&err.to_string()))
    }

    /// Parses the default hardening tier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown tier labels.
    pub fn default_hardening_tier(&self) -> Result<HardeningTier, ConfigError> {
        self.default_hardening
            .parse::<HardeningTier>()
            .map_err(|err| DEFAULT_HARDENING.invalid(&err.to_string()))
    }

    /// Builds the request parameters for `init`, letting explicit values win
    /// over configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the default tier is malformed
    /// and no explicit tier was given.
    pub fn project_spec(
        &self,
        size: Option<&str>,
        region: Option<&str>,
        hardening_tier: Option<HardeningTier>,
    ) -> Result<ProjectSpec, ConfigError> {
        let tier = match hardening_tier {
            Some(tier) => tier,
            None => self.default_hardening_tier()?,
        };
        Ok(ProjectSpec {
            size: size.unwrap_or(&self.default_size).trim().to_owned(),
            region: region.unwrap_or(&self.default_region).trim().to_owned(),
            image: self.default_image.trim().to_owned(),
            hardening_tier: tier,
        })
    }

    /// SSH client settings derived from this configuration.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self
                .ssh_identity_file
                .as_deref()
                .map(|path| Utf8PathBuf::from(expand_tilde(path))),
            connect_attempts: self.connect_attempts,
            connect_interval: Duration::from_secs(self.connect_interval_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    /// Timing policy for the lifecycle orchestrator.
    #[must_use]
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            provision_budget: Duration::from_secs(self.provision_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout_secs),
            ..LifecyclePolicy::default()
        }
    }
}

impl HetznerConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("clwd")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the API token, failing with guidance when it is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no token is configured.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        match self.api_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(API_TOKEN.missing()),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value cannot be interpreted.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
