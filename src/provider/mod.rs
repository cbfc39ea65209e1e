//! Capability interface for compute providers.
//!
//! Every provider is modelled as asynchronous create-then-poll: `create`
//! returns as soon as the provider accepted the request and callers poll
//! [`Provider::get_status`] at their own cadence until the instance reports
//! running with an address.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::project::HardeningTier;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Parameters for a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Project the instance belongs to; used for naming and labels.
    pub project: String,
    /// Size alias or raw provider type.
    pub size: String,
    /// Provider region or location.
    pub region: String,
    /// Boot image.
    pub image: String,
    /// Hardening tier recorded as a label.
    pub hardening_tier: HardeningTier,
}

/// Power state reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Instance is being created or starting.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is powered off.
    Stopped,
    /// Provider does not know the instance.
    Missing,
    /// Any provider state without a direct mapping.
    Other(String),
}

/// Snapshot returned by [`Provider::get_status`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceStatus {
    /// Reported power state.
    pub state: InstanceState,
    /// Public address once one is assigned.
    pub address: Option<IpAddr>,
}

impl InstanceStatus {
    /// Returns the address when the instance is running and reachable.
    #[must_use]
    pub fn ready_address(&self) -> Option<IpAddr> {
        match self.state {
            InstanceState::Running => self.address,
            _ => None,
        }
    }
}

/// Errors raised by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Credentials were missing, invalid, or lacked permission.
    #[error("provider authentication failed: {0}")]
    Auth(String),
    /// Account limits prevent the request.
    #[error("provider quota exceeded: {0}")]
    Quota(String),
    /// Network failure, rate limiting, or provider-side error.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// The provider refused the request as invalid.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Returns `true` when the call may succeed if repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns the provider-supplied message without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Auth(message)
            | Self::Quota(message)
            | Self::Transient(message)
            | Self::Rejected(message) => message,
        }
    }
}

/// Minimal interface implemented by compute providers.
pub trait Provider: Send + Sync {
    /// Identifier stored in `Project::provider_id`.
    fn id(&self) -> &str;

    /// Requests a new instance and returns its provider handle.
    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, String>;

    /// Fetches the current state of an instance with a single request.
    fn get_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus>;

    /// Deletes an instance. Unknown instances are treated as already deleted.
    fn delete<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()>;
}
