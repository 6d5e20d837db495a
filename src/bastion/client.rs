//! Runner-side client for the bastion RPC.
//!
//! Each call opens a fresh connection, writes one request line, and reads
//! one response line. The client never interprets transport failures as
//! policy decisions: a refused connection is an error, and an in-band
//! `success: false` is surfaced with the bastion's own message.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::bastion::protocol::{BastionRequest, BastionResponse, NetworkLeaseConfig};
use crate::constants::{
    BASTION_OP_TIMEOUT, DEFAULT_BASTION_CLIENT_ADDRESS, DEFAULT_MIN_IPS, ENV_BASTION_ADDRESS,
    MAX_LINE_LEN, NETWORK_DRIVER,
};
use crate::error::{Error, Result};
use crate::policy::NetworkPolicy;
use crate::validation::compute_config_hash;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A leased network as returned by the bastion.
#[derive(Debug, Clone)]
pub struct NetworkLease {
    pub network_name: String,
    pub network_id: String,
    pub subnet: String,
    pub reused: bool,
}

/// Client handle bound to one workload identity.
#[derive(Debug, Clone)]
pub struct BastionClient {
    address: String,
    workload_id: String,
}

impl BastionClient {
    /// Creates a client for `workload_id` against an explicit address.
    #[must_use]
    pub fn new(address: impl Into<String>, workload_id: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            workload_id: workload_id.into(),
        }
    }

    /// Creates a client using `BASTION_ADDRESS` or the default.
    #[must_use]
    pub fn from_env(workload_id: impl Into<String>) -> Self {
        let address = std::env::var(ENV_BASTION_ADDRESS)
            .unwrap_or_else(|_| DEFAULT_BASTION_CLIENT_ADDRESS.to_string());
        Self::new(address, workload_id)
    }

    /// Installs the per-workload chain for `container_ip`.
    pub async fn setup_chain(&self, chain_name: &str, container_ip: &str) -> Result<()> {
        let response = self
            .request(&BastionRequest::SetupChain {
                chain_name: chain_name.to_string(),
                container_ip: container_ip.to_string(),
                workload_id: self.workload_id.clone(),
            })
            .await?;

        match response {
            BastionResponse::SetupChain { success: true, .. } => Ok(()),
            BastionResponse::SetupChain { error, .. } => Err(bastion_error(error)),
            other => Err(unexpected(other)),
        }
    }

    /// Applies a compiled network policy to an installed chain.
    pub async fn apply_policy(&self, chain_name: &str, policy: &NetworkPolicy) -> Result<u32> {
        let response = self
            .request(&BastionRequest::ApplyRules {
                chain_name: chain_name.to_string(),
                policy: policy.clone(),
                workload_id: self.workload_id.clone(),
            })
            .await?;

        match response {
            BastionResponse::ApplyRules {
                success: true,
                rules_applied,
                ..
            } => Ok(rules_applied),
            BastionResponse::ApplyRules { error, .. } => Err(bastion_error(error)),
            other => Err(unexpected(other)),
        }
    }

    /// Tears down a chain. Safe to call when the chain never existed.
    pub async fn cleanup_chain(&self, chain_name: &str) -> Result<()> {
        let response = self
            .request(&BastionRequest::CleanupChain {
                chain_name: chain_name.to_string(),
                workload_id: self.workload_id.clone(),
            })
            .await?;

        match response {
            BastionResponse::CleanupChain { success: true, .. } => Ok(()),
            BastionResponse::CleanupChain { error, .. } => Err(bastion_error(error)),
            other => Err(unexpected(other)),
        }
    }

    /// Leases a bridge network matching the default shape (or an explicit
    /// subnet).
    pub async fn acquire_network(
        &self,
        subnet: Option<&str>,
        lease_duration_secs: Option<u64>,
    ) -> Result<NetworkLease> {
        let config_hash = compute_config_hash(subnet, DEFAULT_MIN_IPS, NETWORK_DRIVER);

        let response = self
            .request(&BastionRequest::AcquireNetwork {
                workload_id: self.workload_id.clone(),
                network_config: NetworkLeaseConfig {
                    subnet_range: subnet.map(str::to_string),
                    min_ips: Some(DEFAULT_MIN_IPS),
                    driver: Some(NETWORK_DRIVER.to_string()),
                    config_hash,
                },
                lease_duration_secs,
            })
            .await?;

        match response {
            BastionResponse::AcquireNetwork {
                success: true,
                network_name: Some(network_name),
                network_id: Some(network_id),
                subnet: Some(subnet),
                reused,
                ..
            } => Ok(NetworkLease {
                network_name,
                network_id,
                subnet,
                reused,
            }),
            BastionResponse::AcquireNetwork { error, .. } => Err(bastion_error(error)),
            other => Err(unexpected(other)),
        }
    }

    /// Returns a leased network to the pool (or destroys it when `force`).
    pub async fn release_network(&self, network_name: &str, force: bool) -> Result<bool> {
        let response = self
            .request(&BastionRequest::ReleaseNetwork {
                workload_id: self.workload_id.clone(),
                network_name: network_name.to_string(),
                force_cleanup: force,
            })
            .await?;

        match response {
            BastionResponse::ReleaseNetwork {
                success: true,
                cleaned_up,
                ..
            } => Ok(cleaned_up),
            BastionResponse::ReleaseNetwork { error, .. } => Err(bastion_error(error)),
            other => Err(unexpected(other)),
        }
    }

    /// Checks service liveness.
    pub async fn health(&self) -> Result<bool> {
        let response = self.request(&BastionRequest::Health).await?;
        match response {
            BastionResponse::Health { healthy, .. } => Ok(healthy),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, request: &BastionRequest) -> Result<BastionResponse> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| Error::timeout(format!("connect to bastion at {}", self.address), CONNECT_TIMEOUT))?
            .map_err(|e| {
                Error::Bastion(format!("failed to connect to bastion at {}: {e}", self.address))
            })?;

        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        timeout(BASTION_OP_TIMEOUT, writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::timeout("bastion request write", BASTION_OP_TIMEOUT))??;

        let mut reader = BufReader::new(reader).take(MAX_LINE_LEN as u64);
        let mut response_line = String::new();
        let read = timeout(BASTION_OP_TIMEOUT, reader.read_line(&mut response_line))
            .await
            .map_err(|_| Error::timeout("bastion response read", BASTION_OP_TIMEOUT))??;

        if read == 0 {
            return Err(Error::Bastion("bastion closed connection without response".into()));
        }

        Ok(serde_json::from_str(response_line.trim())?)
    }
}

fn bastion_error(error: Option<String>) -> Error {
    Error::Bastion(error.unwrap_or_else(|| "unknown error".to_string()))
}

fn unexpected(response: BastionResponse) -> Error {
    Error::Protocol(format!("unexpected bastion response: {response:?}"))
}
