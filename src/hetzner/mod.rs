//! Hetzner Cloud implementation of the [`Provider`] contract.
//!
//! Talks to the REST API directly over `reqwest`. Before the first server is
//! created the operator's local public key is registered with the account so
//! the new instance accepts the operator's SSH key.

mod error;
mod types;

use std::collections::BTreeMap;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::Utc;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::HetznerConfig;
use crate::provider::{
    InstanceSpec, InstanceState, InstanceStatus, Provider, ProviderError, ProviderFuture,
};
use crate::util::{expand_tilde, home_dir};
use types::{
    CreateServerRequest, CreateSshKeyRequest, ServerEnvelope, SshKeyEnvelope, SshKeyList,
};

/// Identifier stored in `Project::provider_id`.
pub const PROVIDER_ID: &str = "hetzner";
/// Label attached to every resource this tool creates.
pub const MANAGED_BY_LABEL: &str = "clwd";
/// Regions accepted by [`HetznerProvider::create`].
pub const REGIONS: [&str; 5] = ["nbg1", "fsn1", "hel1", "ash", "hil"];
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SSH_KEY_PAGE_SIZE: &str = "50";
const PUBLIC_KEY_CANDIDATES: [&str; 3] = [
    ".ssh/id_ed25519.pub",
    ".ssh/id_rsa.pub",
    ".ssh/id_ecdsa.pub",
];

/// Maps the size aliases onto Hetzner server types. Any other value is
/// passed through as a raw server type name.
#[must_use]
pub fn server_type_for(size: &str) -> &str {
    match size {
        "small" => "cpx11",
        "medium" => "cpx21",
        "large" => "cpx31",
        other => other,
    }
}

/// Provider backed by the Hetzner Cloud API.
#[derive(Clone)]
pub struct HetznerProvider {
    client: Client,
    config: HetznerConfig,
}

impl HetznerProvider {
    /// Builds a provider from configuration. A missing token is reported on
    /// the first API call, so commands that never reach the provider keep
    /// working without one.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Transient`] when the HTTP client cannot be
    /// constructed.
    pub fn new(config: HetznerConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        Ok(Self { client, config })
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.config
            .require_token()
            .map_err(|err| ProviderError::Auth(err.to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.api_base_url.trim_end_matches('/'))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error::classify(status.as_u16(), &body));
        }
        response.json::<T>().await.map_err(error::transport)
    }

    async fn ensure_ssh_key(&self) -> Result<u64, ProviderError> {
        let public_key = self.local_public_key()?;
        let token = self.token()?;

        let mut page = 1_u64;
        loop {
            let page_number = page.to_string();
            let response = self
                .client
                .get(self.url("/ssh_keys"))
                .query(&[("page", page_number.as_str()), ("per_page", SSH_KEY_PAGE_SIZE)])
                .bearer_auth(token)
                .send()
                .await
                .map_err(error::transport)?;
            let listing: SshKeyList = Self::decode(response).await?;
            match scan_key_page(&listing, &public_key, page) {
                KeyScan::Found(key_id) => {
                    debug!(key_id, page, "reusing registered ssh key");
                    return Ok(key_id);
                }
                KeyScan::Next(next) => page = next,
                KeyScan::Exhausted => break,
            }
        }

        let request = CreateSshKeyRequest {
            name: format!("{MANAGED_BY_LABEL}-{}", Utc::now().timestamp()),
            public_key: public_key.trim(),
            labels: BTreeMap::from([("managed-by", MANAGED_BY_LABEL)]),
        };
        let response = self
            .client
            .post(self.url("/ssh_keys"))
            .bearer_auth(token)
            .json(&request)
            .send()
            .await
            .map_err(error::transport)?;
        let created: SshKeyEnvelope = Self::decode(response).await?;
        info!(key_id = created.ssh_key.id, "registered local ssh key");
        Ok(created.ssh_key.id)
    }

    fn local_public_key(&self) -> Result<String, ProviderError> {
        let candidates: Vec<Utf8PathBuf> = match &self.config.ssh_public_key_file {
            Some(path) => vec![Utf8PathBuf::from(expand_tilde(path))],
            None => home_dir()
                .map(|home| {
                    PUBLIC_KEY_CANDIDATES
                        .iter()
                        .map(|candidate| home.join(candidate))
                        .collect()
                })
                .unwrap_or_default(),
        };
        candidates
            .iter()
            .find_map(|path| read_key(path))
            .ok_or_else(|| {
                ProviderError::Rejected(String::from(
                    "no local SSH public key found; generate one with `ssh-keygen -t ed25519`",
                ))
            })
    }
}

fn read_key(path: &Utf8Path) -> Option<String> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path.file_name()?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).ok()?;
    let contents = dir.read_to_string(name).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Compares public keys by type and body, ignoring the trailing comment.
/// Outcome of searching one page of registered keys.
#[derive(Debug, Eq, PartialEq)]
enum KeyScan {
    Found(u64),
    Next(u64),
    Exhausted,
}

/// Looks for the local key on one listing page and decides whether another
/// page must be fetched. A `next_page` that does not advance ends the scan.
fn scan_key_page(listing: &SshKeyList, local: &str, page: u64) -> KeyScan {
    if let Some(key) = listing
        .ssh_keys
        .iter()
        .find(|key| same_key(&key.public_key, local))
    {
        return KeyScan::Found(key.id);
    }
    match listing.next_page() {
        Some(next) if next > page => KeyScan::Next(next),
        _ => KeyScan::Exhausted,
    }
}

fn same_key(registered: &str, local: &str) -> bool {
    let fields = |key: &str| key.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    fields(registered) == fields(local)
}

fn validate_spec(spec: &InstanceSpec) -> Result<(), ProviderError> {
    if !REGIONS.contains(&spec.region.as_str()) {
        return Err(ProviderError::Rejected(format!(
            "unsupported region '{}'; expected one of {}",
            spec.region,
            REGIONS.join(", ")
        )));
    }
    if spec.size.trim().is_empty() {
        return Err(ProviderError::Rejected(String::from("size must not be empty")));
    }
    Ok(())
}

impl Provider for HetznerProvider {
    fn id(&self) -> &str {
        PROVIDER_ID
    }

    fn create<'a>(&'a self, spec: &'a InstanceSpec) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            validate_spec(spec)?;
            let token = self.token()?;
            let key_id = self.ensure_ssh_key().await?;

            let request = CreateServerRequest {
                name: format!(
                    "{MANAGED_BY_LABEL}-{}-{}",
                    spec.project,
                    Utc::now().timestamp()
                ),
                server_type: server_type_for(&spec.size),
                image: &spec.image,
                location: &spec.region,
                ssh_keys: vec![key_id],
                labels: BTreeMap::from([
                    ("project", spec.project.clone()),
                    ("managed-by", MANAGED_BY_LABEL.to_owned()),
                    ("hardening", spec.hardening_tier.to_string()),
                ]),
                start_after_create: true,
            };
            let response = self
                .client
                .post(self.url("/servers"))
                .bearer_auth(token)
                .json(&request)
                .send()
                .await
                .map_err(error::transport)?;
            let created: ServerEnvelope = Self::decode(response).await?;
            info!(
                instance_id = created.server.id,
                server_type = request.server_type,
                region = %spec.region,
                "hetzner server created"
            );
            Ok(created.server.id.to_string())
        })
    }

    fn get_status<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let token = self.token()?;
            let response = self
                .client
                .get(self.url(&format!("/servers/{instance_id}")))
                .bearer_auth(token)
                .send()
                .await
                .map_err(error::transport)?;
            if response.status().as_u16() == 404 {
                return Ok(InstanceStatus {
                    state: InstanceState::Missing,
                    address: None,
                });
            }
            let envelope: ServerEnvelope = Self::decode(response).await?;
            Ok(envelope.server.to_status())
        })
    }

    fn delete<'a>(&'a self, instance_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let token = self.token()?;
            let response = self
                .client
                .delete(self.url(&format!("/servers/{instance_id}")))
                .bearer_auth(token)
                .send()
                .await
                .map_err(error::transport)?;
            let status = response.status();
            if status.is_success() || status.as_u16() == 404 {
                info!(instance_id, "hetzner server deleted");
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(error::classify(status.as_u16(), &body))
        })
    }
}
