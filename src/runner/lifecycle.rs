//! Workload setup, teardown, and the lifecycle tracker.
//!
//! Every resource the runner acquires (container, network lease, filter
//! chain) is registered in a [`LifecycleTracker`] the moment it exists.
//! The happy path releases resources explicitly and untracks them; any
//! other exit path (error, panic-equivalent, signal) drains whatever the
//! tracker still holds. Cleanup steps tolerate absence, so running them
//! twice is safe.

use std::sync::Mutex;

use bollard::container::{RemoveContainerOptions, StopContainerOptions};
use bollard::Docker;

use crate::bastion::BastionClient;
use crate::constants::{CHAIN_HEX_LEN, CHAIN_PREFIX, FORCE_TERMINATE_SECS};
use crate::error::{Error, Result};
use crate::policy::NetworkPolicy;
use crate::runner::events::Events;
use crate::validation;

// =============================================================================
// Chain Derivation
// =============================================================================

/// Derives the filter chain name from a workload's container ID by
/// concatenating its hex characters.
///
/// The ID must contain at least 16 hex digits; anything shorter cannot
/// produce a valid chain name and is an error rather than a truncated one.
pub fn generate_chain_name(container_id: &str) -> Result<String> {
    let hex: String = container_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .take(CHAIN_HEX_LEN)
        .collect();

    if hex.len() < CHAIN_HEX_LEN {
        return Err(Error::validation(
            "container_id",
            format!(
                "container ID contains only {} hex characters ({CHAIN_HEX_LEN} required): {container_id}",
                hex.len()
            ),
        ));
    }

    let chain = format!("{CHAIN_PREFIX}{hex}");
    validation::validate_chain_name(&chain)?;
    Ok(chain)
}

// =============================================================================
// Network Isolation
// =============================================================================

/// Validates the network config, installs the workload's chain, and applies
/// the compiled policy through the bastion. Returns the chain name.
pub async fn setup_network_isolation(
    container_id: &str,
    container_ip: &str,
    network: &mut crate::policy::NetworkConfig,
    events: &Events,
) -> Result<String> {
    // The mandatory rules are enforced before anything reaches the bastion;
    // a whitelist that touches localhost or metadata dies here.
    crate::policy::validate_network_config(network)?;
    events.info("Network security rules validated and enforced");

    let client = BastionClient::from_env(container_id);
    let chain_name = generate_chain_name(container_id)?;

    client.setup_chain(&chain_name, container_ip).await?;

    let policy: NetworkPolicy = network.to_policy();
    client.apply_policy(&chain_name, &policy).await?;

    events.network_isolation_ready(container_id, &chain_name, &network.default_policy);
    Ok(chain_name)
}

/// Tears down a chain through the bastion; failures are warnings, never
/// blockers for the rest of teardown.
pub async fn cleanup_network_isolation(container_id: &str, chain_name: &str, events: &Events) {
    events.info("Cleaning up network isolation");

    let client = BastionClient::from_env(container_id);
    match client.cleanup_chain(chain_name).await {
        Ok(()) => events.info("Network isolation cleaned up successfully"),
        Err(e) => events.warning(format!("Failed to cleanup network rules via bastion: {e}")),
    }
}

// =============================================================================
// Lifecycle Tracker
// =============================================================================

#[derive(Debug, Default, Clone)]
struct TrackedResources {
    container_id: Option<String>,
    /// Identity the network lease is held under.
    lease_holder: Option<String>,
    network_name: Option<String>,
    chain_name: Option<String>,
}

/// Authoritative record of acquired resources.
///
/// `cleanup_all` is the backstop for every abnormal exit path; the happy
/// path untracks each resource as it releases it, leaving the backstop
/// nothing to do.
pub struct LifecycleTracker {
    docker: Docker,
    events: Events,
    resources: Mutex<TrackedResources>,
}

impl LifecycleTracker {
    /// Creates an empty tracker over an engine handle.
    #[must_use]
    pub fn new(docker: Docker, events: Events) -> Self {
        Self {
            docker,
            events,
            resources: Mutex::new(TrackedResources::default()),
        }
    }

    pub fn track_container(&self, container_id: &str) {
        self.lock().container_id = Some(container_id.to_string());
    }

    pub fn track_network(&self, holder: &str, network_name: &str) {
        let mut r = self.lock();
        r.lease_holder = Some(holder.to_string());
        r.network_name = Some(network_name.to_string());
    }

    pub fn track_chain(&self, chain_name: &str) {
        self.lock().chain_name = Some(chain_name.to_string());
    }

    pub fn untrack_container(&self) {
        self.lock().container_id = None;
    }

    pub fn untrack_network(&self) {
        let mut r = self.lock();
        r.lease_holder = None;
        r.network_name = None;
    }

    pub fn untrack_chain(&self) {
        self.lock().chain_name = None;
    }

    /// Releases everything still tracked: container first (so the network
    /// has no endpoints), then the filter chain, then the network lease.
    /// Each step is independent; a failure is logged and the rest proceed.
    pub async fn cleanup_all(&self) {
        let resources = {
            let mut guard = self.lock();
            std::mem::take(&mut *guard)
        };

        if let Some(container_id) = &resources.container_id {
            self.cleanup_container(container_id).await;
        }

        if let Some(chain_name) = &resources.chain_name {
            let identity = resources
                .container_id
                .as_deref()
                .or(resources.lease_holder.as_deref())
                .unwrap_or("cleanup");
            cleanup_network_isolation(identity, chain_name, &self.events).await;
        }

        if let (Some(holder), Some(network_name)) =
            (&resources.lease_holder, &resources.network_name)
        {
            let client = BastionClient::from_env(holder.as_str());
            if let Err(e) = client.release_network(network_name, false).await {
                self.events
                    .warning(format!("Failed to release network via bastion: {e}"));
            }
        }
    }

    async fn cleanup_container(&self, container_id: &str) {
        let _ = self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: FORCE_TERMINATE_SECS as i64,
                }),
            )
            .await;

        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackedResources> {
        self.resources.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_name_from_hex_container_id() {
        let chain = generate_chain_name("4a5b6c7d8e9f0a1b2c3d4e5f").unwrap();
        assert_eq!(chain, "ISO-4a5b6c7d8e9f0a1b");
        assert!(validation::validate_chain_name(&chain).is_ok());
    }

    #[test]
    fn chain_name_skips_non_hex_characters() {
        let chain = generate_chain_name("gz12-34ab_cd56ef78-90aabb").unwrap();
        assert_eq!(chain, "ISO-1234abcd56ef7890");
    }

    #[test]
    fn chain_name_lowercases_hex() {
        let chain = generate_chain_name("4A5B6C7D8E9F0A1B2C3D").unwrap();
        assert_eq!(chain, "ISO-4a5b6c7d8e9f0a1b");
    }

    #[test]
    fn chain_name_requires_sixteen_hex_digits() {
        let err = generate_chain_name("zz-not-hex").unwrap_err();
        assert!(err.to_string().contains("hex characters"));

        assert!(generate_chain_name("abcdef0123456").is_err()); // 13 hex digits
    }

    #[test]
    fn chain_names_are_stable() {
        let id = "9f8e7d6c5b4a39281706f5e4d3c2b1a0";
        assert_eq!(
            generate_chain_name(id).unwrap(),
            generate_chain_name(id).unwrap()
        );
    }
}
