//! Project records and the lifecycle states they move through.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_NAME_LEN: usize = 63;

/// Lifecycle state of a project.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    /// Recorded locally; no provider call made yet.
    Requested,
    /// Provider create call in flight or completed without networking.
    Provisioning,
    /// Waiting for the instance to report running with an address.
    AwaitingNetwork,
    /// Address known; credentials and setup script being applied.
    Bootstrapping,
    /// Instance bootstrapped and answering the liveness probe.
    Ready,
    /// Provider rejected or failed the create call.
    ProvisionFailed,
    /// Instance never became reachable within the wait budget.
    NetworkTimeout,
    /// Credential injection, setup script, or liveness probe failed.
    BootstrapFailed,
    /// Teardown started but not yet confirmed by the provider.
    Destroying,
    /// Teardown confirmed.
    Destroyed,
}

impl ProjectStatus {
    /// Returns the kebab-case label used in the store and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::AwaitingNetwork => "awaiting-network",
            Self::Bootstrapping => "bootstrapping",
            Self::Ready => "ready",
            Self::ProvisionFailed => "provision-failed",
            Self::NetworkTimeout => "network-timeout",
            Self::BootstrapFailed => "bootstrap-failed",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }

    /// Returns `true` for the three terminal-until-retried failure states.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ProvisionFailed | Self::NetworkTimeout | Self::BootstrapFailed
        )
    }

    /// Returns `true` when the provider should hold an instance and the
    /// project is expected to carry both an instance id and an address.
    #[must_use]
    pub const fn has_network(self) -> bool {
        matches!(
            self,
            Self::Bootstrapping | Self::BootstrapFailed | Self::Ready
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Security profile applied during bootstrap.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HardeningTier {
    /// Base setup only.
    #[default]
    None,
    /// Firewall plus password login disabled.
    Minimal,
    /// Minimal plus root login disabled, tighter auth limits, and fail2ban.
    Full,
}

impl HardeningTier {
    /// Returns the lowercase label for the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Minimal => "minimal",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for HardeningTier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Raised when parsing an unknown hardening tier label.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown hardening tier '{0}': expected none, minimal, or full")]
pub struct ParseTierError(pub String);

impl FromStr for HardeningTier {
    type Err = ParseTierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "minimal" => Ok(Self::Minimal),
            "full" => Ok(Self::Full),
            other => Err(ParseTierError(other.to_owned())),
        }
    }
}

/// Raised when a project name cannot be used as a store key.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NameError {
    /// The name is empty after trimming.
    #[error("project name must not be empty")]
    Empty,
    /// The name exceeds the maximum length.
    #[error("project name must be at most {MAX_NAME_LEN} characters")]
    TooLong,
    /// The name contains characters outside `[A-Za-z0-9_-]` or starts with
    /// a separator.
    #[error("project name '{0}' must start with a letter or digit and contain only letters, digits, '-' or '_'")]
    InvalidCharacters(String),
}

/// Validates a project name, returning the trimmed form.
///
/// # Errors
///
/// Returns [`NameError`] when the name is empty, too long, or contains
/// characters that would not survive as a provider label.
pub fn validate_name(name: &str) -> Result<String, NameError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(NameError::Empty);
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong);
    }
    let starts_ok = trimmed
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphanumeric());
    let chars_ok = trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if !starts_ok || !chars_ok {
        return Err(NameError::InvalidCharacters(trimmed.to_owned()));
    }
    Ok(trimmed.to_owned())
}

/// A managed remote instance paired with its local lifecycle state.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Project {
    /// Unique project name; the store key.
    pub name: String,
    /// Identifier of the provider owning the instance.
    pub provider_id: String,
    /// Provider handle, present once creation succeeded.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Public address, present once the instance reported networking.
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Requested size alias or provider type.
    pub size: String,
    /// Requested region.
    pub region: String,
    /// Requested image.
    pub image: String,
    /// Hardening applied during bootstrap.
    pub hardening_tier: HardeningTier,
    /// Current lifecycle state.
    pub status: ProjectStatus,
    /// Creation time of the record.
    pub created_at: DateTime<Utc>,
    /// Time of the last persisted transition.
    pub updated_at: DateTime<Utc>,
    /// Last failure description; empty unless the project is failing.
    #[serde(default)]
    pub last_error: String,
}

impl Project {
    /// Builds a fresh record in the `requested` state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider_id: impl Into<String>,
        spec: &ProjectSpec,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            provider_id: provider_id.into(),
            instance_id: None,
            address: None,
            size: spec.size.clone(),
            region: spec.region.clone(),
            image: spec.image.clone(),
            hardening_tier: spec.hardening_tier,
            status: ProjectStatus::Requested,
            created_at: now,
            updated_at: now,
            last_error: String::new(),
        }
    }

    /// Moves the project to a non-failure status and clears the last error.
    pub fn advance(&mut self, status: ProjectStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        self.last_error.clear();
    }

    /// Records a failure status together with its description.
    pub fn fail(&mut self, status: ProjectStatus, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        self.last_error = message.into();
    }

    /// Returns the request parameters the project was created with.
    #[must_use]
    pub fn spec(&self) -> ProjectSpec {
        ProjectSpec {
            size: self.size.clone(),
            region: self.region.clone(),
            image: self.image.clone(),
            hardening_tier: self.hardening_tier,
        }
    }
}

/// Immutable request parameters chosen at `init`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectSpec {
    /// Size alias or provider type.
    pub size: String,
    /// Provider region.
    pub region: String,
    /// Boot image.
    pub image: String,
    /// Hardening tier.
    pub hardening_tier: HardeningTier,
}
