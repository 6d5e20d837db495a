//! Container-engine client handle.
//!
//! A thin wrapper over the engine's HTTP API that the bastion and runner
//! share. The handle is cheap to clone and safe to use from many tasks; all
//! calls carry explicit timeouts.
//!
//! Network operations go through the [`NetworkBackend`] trait so the pool
//! can be exercised against an in-memory backend in tests; the real
//! implementation forwards to the engine.

use async_trait::async_trait;
use bollard::network::{
    CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions, ListNetworksOptions,
};
use bollard::Docker;
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{BASTION_OP_TIMEOUT, ENGINE_PING_TIMEOUT, NETWORK_DRIVER};
use crate::error::{Error, Result};
use crate::firewall::DEFAULT_BRIDGE_SUBNET;

/// A bridge network as the engine reports it.
#[derive(Debug, Clone)]
pub struct EngineNetwork {
    pub id: String,
    pub name: String,
    pub subnets: Vec<String>,
}

/// Backend for bridge-network mutation.
///
/// The pool owns network lifecycle exclusively; everything it does to the
/// engine goes through this seam.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Creates a bridge network with the given subnet, returning its ID.
    async fn create_network(&self, name: &str, subnet: &str) -> Result<String>;

    /// Lists all networks known to the engine.
    async fn list_networks(&self) -> Result<Vec<EngineNetwork>>;

    /// Removes a network by ID.
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Force-disconnects every endpoint still attached to a network.
    async fn disconnect_endpoints(&self, id: &str) -> Result<()>;

    /// Returns the subnets of the engine's default bridge.
    async fn bridge_subnets(&self) -> Vec<String> {
        vec![DEFAULT_BRIDGE_SUBNET.to_string()]
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Shared engine connection.
#[derive(Clone)]
pub struct Engine {
    docker: Docker,
}

impl Engine {
    /// Connects to the local engine daemon and verifies it responds.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::EngineUnavailable(format!("engine not available: {e}")))?;

        timeout(ENGINE_PING_TIMEOUT, docker.ping())
            .await
            .map_err(|_| Error::timeout("engine ping", ENGINE_PING_TIMEOUT))?
            .map_err(|e| Error::EngineUnavailable(format!("engine not available: {e}")))?;

        Ok(Self { docker })
    }

    /// Returns the raw API client for container-level calls.
    #[must_use]
    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Discovers the subnets of the engine's default bridge.
    ///
    /// Falls back to [`DEFAULT_BRIDGE_SUBNET`] when the bridge cannot be
    /// inspected, so rule compilation always has an isolation target.
    pub async fn bridge_subnets(&self) -> Vec<String> {
        let inspect = timeout(
            ENGINE_PING_TIMEOUT,
            self.docker
                .inspect_network("bridge", None::<InspectNetworkOptions<String>>),
        )
        .await;

        let subnets = match inspect {
            Ok(Ok(network)) => network
                .ipam
                .and_then(|ipam| ipam.config)
                .map(|configs| {
                    configs
                        .into_iter()
                        .filter_map(|c| c.subnet)
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        if subnets.is_empty() {
            vec![DEFAULT_BRIDGE_SUBNET.to_string()]
        } else {
            subnets
        }
    }
}

/// Classifies engine errors from network creation: subnet collisions are
/// retryable with a fresh allocation, everything else is terminal.
fn classify_create_error(err: &bollard::errors::Error) -> Error {
    let msg = err.to_string();
    let retryable = ["Pool overlaps", "overlaps with other", "already in use", "address already"]
        .iter()
        .any(|needle| msg.contains(needle));

    if retryable {
        Error::Transient(msg)
    } else {
        Error::EngineUnavailable(msg)
    }
}

#[async_trait]
impl NetworkBackend for Engine {
    async fn create_network(&self, name: &str, subnet: &str) -> Result<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: NETWORK_DRIVER.to_string(),
            ipam: bollard::models::Ipam {
                config: Some(vec![bollard::models::IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        };

        let response = timeout(BASTION_OP_TIMEOUT, self.docker.create_network(options))
            .await
            .map_err(|_| Error::timeout("network create", BASTION_OP_TIMEOUT))?
            .map_err(|e| classify_create_error(&e))?;

        debug!(network = name, subnet, "network created");
        Ok(response.id.unwrap_or_default())
    }

    async fn list_networks(&self) -> Result<Vec<EngineNetwork>> {
        let networks = timeout(
            BASTION_OP_TIMEOUT,
            self.docker
                .list_networks(None::<ListNetworksOptions<String>>),
        )
        .await
        .map_err(|_| Error::timeout("network list", BASTION_OP_TIMEOUT))?
        .map_err(|e| Error::EngineUnavailable(format!("failed to list networks: {e}")))?;

        Ok(networks
            .into_iter()
            .map(|n| EngineNetwork {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                subnets: n
                    .ipam
                    .and_then(|ipam| ipam.config)
                    .map(|configs| configs.into_iter().filter_map(|c| c.subnet).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        timeout(BASTION_OP_TIMEOUT, self.docker.remove_network(id))
            .await
            .map_err(|_| Error::timeout("network remove", BASTION_OP_TIMEOUT))?
            .map_err(|e| Error::EngineUnavailable(format!("failed to remove network: {e}")))?;
        Ok(())
    }

    async fn bridge_subnets(&self) -> Vec<String> {
        Engine::bridge_subnets(self).await
    }

    async fn disconnect_endpoints(&self, id: &str) -> Result<()> {
        let inspect = timeout(
            BASTION_OP_TIMEOUT,
            self.docker
                .inspect_network(id, None::<InspectNetworkOptions<String>>),
        )
        .await
        .map_err(|_| Error::timeout("network inspect", BASTION_OP_TIMEOUT))?;

        let Ok(network) = inspect else {
            // Nothing to disconnect when the network is already gone.
            return Ok(());
        };

        if let Some(containers) = network.containers {
            for container_id in containers.keys() {
                let _ = self
                    .docker
                    .disconnect_network(
                        id,
                        DisconnectNetworkOptions {
                            container: container_id.clone(),
                            force: true,
                        },
                    )
                    .await;
            }
        }

        Ok(())
    }
}
