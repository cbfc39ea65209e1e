//! Wire types for the Hetzner Cloud REST API.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::provider::{InstanceState, InstanceStatus};

#[derive(Debug, Serialize)]
pub(super) struct CreateServerRequest<'a> {
    pub(super) name: String,
    pub(super) server_type: &'a str,
    pub(super) image: &'a str,
    pub(super) location: &'a str,
    pub(super) ssh_keys: Vec<u64>,
    pub(super) labels: BTreeMap<&'static str, String>,
    pub(super) start_after_create: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: Server,
}

#[derive(Debug, Deserialize)]
pub(super) struct Server {
    pub(super) id: u64,
    pub(super) status: String,
    #[serde(default)]
    pub(super) public_net: Option<PublicNet>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct PublicNet {
    #[serde(default)]
    pub(super) ipv4: Option<Ipv4Block>,
}

#[derive(Debug, Deserialize)]
pub(super) struct Ipv4Block {
    pub(super) ip: String,
}

impl Server {
    pub(super) fn to_status(&self) -> InstanceStatus {
        let state = match self.status.as_str() {
            "initializing" | "starting" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "off" | "stopping" => InstanceState::Stopped,
            other => InstanceState::Other(other.to_owned()),
        };
        let address = self
            .public_net
            .as_ref()
            .and_then(|net| net.ipv4.as_ref())
            .and_then(|block| block.ip.parse::<IpAddr>().ok());
        InstanceStatus { state, address }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKeyList {
    #[serde(default)]
    pub(super) ssh_keys: Vec<SshKey>,
    #[serde(default)]
    pub(super) meta: Option<ListMeta>,
}

impl SshKeyList {
    /// Page number advertised by the API for the next slice of keys.
    pub(super) fn next_page(&self) -> Option<u64> {
        self.meta
            .as_ref()
            .and_then(|meta| meta.pagination.as_ref())
            .and_then(|pagination| pagination.next_page)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListMeta {
    #[serde(default)]
    pub(super) pagination: Option<Pagination>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct Pagination {
    #[serde(default)]
    pub(super) next_page: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKeyEnvelope {
    pub(super) ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
pub(super) struct SshKey {
    pub(super) id: u64,
    pub(super) public_key: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CreateSshKeyRequest<'a> {
    pub(super) name: String,
    pub(super) public_key: &'a str,
    pub(super) labels: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ApiErrorEnvelope {
    pub(super) error: ApiError,
}

#[derive(Debug, Deserialize)]
pub(super) struct ApiError {
    #[serde(default)]
    pub(super) code: String,
    #[serde(default)]
    pub(super) message: String,
}
