//! Privileged operation handlers.
//!
//! Every request is validated with the pure predicates before any
//! privileged action runs, and every outcome is audit-logged. The only
//! mutable state here is the chain → container-IP map, which lets
//! [`CleanupChain`](crate::bastion::protocol::BastionRequest::CleanupChain)
//! recover the FORWARD-jump argument when the caller no longer knows it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bastion::protocol::{BastionRequest, BastionResponse, NetworkLeaseConfig};
use crate::constants::{DEFAULT_MIN_IPS, NETWORK_DRIVER};
use crate::engine::NetworkBackend;
use crate::error::Result;
use crate::firewall;
use crate::netpool::NetworkPool;
use crate::validation;

/// The bastion's operation layer.
pub struct BastionService {
    version: String,
    pool: Arc<NetworkPool>,
    backend: Arc<dyn NetworkBackend>,
    chain_ips: RwLock<HashMap<String, String>>,
}

impl BastionService {
    /// Creates the service over a pool and the backend used for bridge
    /// subnet discovery (normally the same engine handle the pool uses).
    pub fn new(
        version: impl Into<String>,
        pool: Arc<NetworkPool>,
        backend: Arc<dyn NetworkBackend>,
    ) -> Self {
        Self {
            version: version.into(),
            pool,
            backend,
            chain_ips: RwLock::new(HashMap::new()),
        }
    }

    /// Dispatches one request to its handler.
    pub async fn handle(&self, request: BastionRequest) -> BastionResponse {
        match request {
            BastionRequest::SetupChain {
                chain_name,
                container_ip,
                workload_id,
            } => self.setup_chain(&chain_name, &container_ip, &workload_id).await,
            BastionRequest::ApplyRules {
                chain_name,
                policy,
                workload_id,
            } => self.apply_rules(&chain_name, policy, &workload_id).await,
            BastionRequest::CleanupChain {
                chain_name,
                workload_id,
            } => self.cleanup_chain(&chain_name, &workload_id).await,
            BastionRequest::AcquireNetwork {
                workload_id,
                network_config,
                lease_duration_secs,
            } => {
                self.acquire_network(&workload_id, network_config, lease_duration_secs)
                    .await
            }
            BastionRequest::ReleaseNetwork {
                workload_id,
                network_name,
                force_cleanup,
            } => {
                self.release_network(&workload_id, &network_name, force_cleanup)
                    .await
            }
            BastionRequest::NetworkStats => BastionResponse::NetworkStats {
                success: true,
                stats: self.pool.stats().await,
            },
            BastionRequest::Health => self.health().await,
        }
    }

    async fn setup_chain(
        &self,
        chain_name: &str,
        container_ip: &str,
        workload_id: &str,
    ) -> BastionResponse {
        let result: Result<()> = async {
            validation::validate_chain_name(chain_name)?;
            let ip = validation::validate_container_ip(container_ip)?;
            firewall::setup_chain(chain_name, ip.into()).await
        }
        .await;

        match result {
            Ok(()) => {
                self.chain_ips
                    .write()
                    .await
                    .insert(chain_name.to_string(), container_ip.to_string());
                self.audit("setup_chain", chain_name, workload_id, true);
                BastionResponse::SetupChain {
                    success: true,
                    error: None,
                }
            }
            Err(e) => {
                self.audit("setup_chain", chain_name, workload_id, false);
                BastionResponse::SetupChain {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn apply_rules(
        &self,
        chain_name: &str,
        policy: crate::policy::NetworkPolicy,
        workload_id: &str,
    ) -> BastionResponse {
        if let Err(e) = validation::validate_chain_name(chain_name) {
            self.audit("apply_rules", chain_name, workload_id, false);
            return BastionResponse::ApplyRules {
                success: false,
                error: Some(e.to_string()),
                rules_applied: 0,
            };
        }

        let bridge_subnets = self.backend.bridge_subnets().await;
        match firewall::apply_rules(chain_name, &policy, &bridge_subnets).await {
            Ok(count) => {
                self.audit("apply_rules", chain_name, workload_id, true);
                BastionResponse::ApplyRules {
                    success: true,
                    error: None,
                    rules_applied: count as u32,
                }
            }
            Err(e) => {
                self.audit("apply_rules", chain_name, workload_id, false);
                BastionResponse::ApplyRules {
                    success: false,
                    error: Some(e.to_string()),
                    rules_applied: 0,
                }
            }
        }
    }

    async fn cleanup_chain(&self, chain_name: &str, workload_id: &str) -> BastionResponse {
        if let Err(e) = validation::validate_chain_name(chain_name) {
            self.audit("cleanup_chain", chain_name, workload_id, false);
            return BastionResponse::CleanupChain {
                success: false,
                error: Some(e.to_string()),
            };
        }

        let container_ip = self.chain_ips.read().await.get(chain_name).cloned();
        firewall::cleanup_chain(chain_name, container_ip.as_deref()).await;
        self.chain_ips.write().await.remove(chain_name);

        self.audit("cleanup_chain", chain_name, workload_id, true);
        BastionResponse::CleanupChain {
            success: true,
            error: None,
        }
    }

    async fn acquire_network(
        &self,
        workload_id: &str,
        config: NetworkLeaseConfig,
        lease_duration_secs: Option<u64>,
    ) -> BastionResponse {
        let fail = |error: String| BastionResponse::AcquireNetwork {
            success: false,
            error: Some(error),
            network_name: None,
            network_id: None,
            subnet: None,
            reused: false,
        };

        if let Err(e) = validation::validate_workload_id(workload_id) {
            return fail(e.to_string());
        }

        let min_ips = config.min_ips.unwrap_or(DEFAULT_MIN_IPS);
        let driver = config.driver.as_deref().unwrap_or(NETWORK_DRIVER);

        if let Err(e) = validation::validate_config_hash(
            &config.config_hash,
            config.subnet_range.as_deref(),
            min_ips,
            driver,
        ) {
            self.audit("acquire_network", "-", workload_id, false);
            return fail(e.to_string());
        }

        match self
            .pool
            .acquire(
                workload_id,
                &config.config_hash,
                config.subnet_range.as_deref(),
                lease_duration_secs,
            )
            .await
        {
            Ok(result) => {
                self.audit("acquire_network", &result.network_name, workload_id, true);
                BastionResponse::AcquireNetwork {
                    success: true,
                    error: None,
                    network_name: Some(result.network_name),
                    network_id: Some(result.network_id),
                    subnet: Some(result.subnet),
                    reused: result.reused,
                }
            }
            Err(e) => {
                self.audit("acquire_network", "-", workload_id, false);
                fail(e.to_string())
            }
        }
    }

    async fn release_network(
        &self,
        workload_id: &str,
        network_name: &str,
        force: bool,
    ) -> BastionResponse {
        let fail = |error: String| BastionResponse::ReleaseNetwork {
            success: false,
            error: Some(error),
            cleaned_up: false,
        };

        if let Err(e) = validation::validate_workload_id(workload_id) {
            return fail(e.to_string());
        }
        if let Err(e) = validation::validate_network_name(network_name) {
            return fail(e.to_string());
        }

        match self.pool.release(workload_id, network_name, force).await {
            Ok(result) => {
                self.audit("release_network", network_name, workload_id, true);
                BastionResponse::ReleaseNetwork {
                    success: true,
                    error: None,
                    cleaned_up: result.cleaned_up,
                }
            }
            Err(e) => {
                self.audit("release_network", network_name, workload_id, false);
                fail(e.to_string())
            }
        }
    }

    async fn health(&self) -> BastionResponse {
        let iptables_available = firewall::check_iptables().await.is_ok();
        BastionResponse::Health {
            healthy: iptables_available,
            version: self.version.clone(),
            iptables_available,
        }
    }

    fn audit(&self, operation: &str, target: &str, workload_id: &str, success: bool) {
        if success {
            info!(
                operation,
                target,
                workload_id,
                "privileged operation succeeded"
            );
        } else {
            warn!(operation, target, workload_id, "privileged operation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineNetwork, NetworkBackend};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// In-memory backend: records created networks, never touches an engine.
    struct FakeBackend {
        networks: StdMutex<Vec<EngineNetwork>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                networks: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NetworkBackend for FakeBackend {
        async fn create_network(&self, name: &str, subnet: &str) -> crate::error::Result<String> {
            let id = format!("net-{name}");
            self.networks.lock().unwrap().push(EngineNetwork {
                id: id.clone(),
                name: name.to_string(),
                subnets: vec![subnet.to_string()],
            });
            Ok(id)
        }

        async fn list_networks(&self) -> crate::error::Result<Vec<EngineNetwork>> {
            Ok(self.networks.lock().unwrap().clone())
        }

        async fn remove_network(&self, id: &str) -> crate::error::Result<()> {
            let mut networks = self.networks.lock().unwrap();
            let before = networks.len();
            networks.retain(|n| n.id != id);
            if networks.len() == before {
                return Err(Error::EngineUnavailable(format!("no such network: {id}")));
            }
            Ok(())
        }

        async fn disconnect_endpoints(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }
    }

    async fn service() -> BastionService {
        let backend: Arc<dyn NetworkBackend> = Arc::new(FakeBackend::new());
        let dir = tempfile::tempdir().unwrap();
        let pool = NetworkPool::load(
            Some(dir.path().join("pool.json")),
            crate::netpool::SubnetConfig::default(),
            Arc::clone(&backend),
        )
        .await
        .unwrap();
        // Keep the directory alive for the whole test process so pool
        // persistence has somewhere to write.
        std::mem::forget(dir);
        BastionService::new("test", Arc::new(pool), backend)
    }

    #[tokio::test]
    async fn setup_chain_rejects_bad_chain_name() {
        let svc = service().await;
        let resp = svc
            .handle(BastionRequest::SetupChain {
                chain_name: "BAD".to_string(),
                container_ip: "10.0.0.2".to_string(),
                workload_id: "abc123def456".to_string(),
            })
            .await;

        match resp {
            BastionResponse::SetupChain { success, error } => {
                assert!(!success);
                assert!(error.unwrap().contains("chain name"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn setup_chain_rejects_public_ip() {
        let svc = service().await;
        let resp = svc
            .handle(BastionRequest::SetupChain {
                chain_name: "ISO-0123456789abcdef".to_string(),
                container_ip: "8.8.8.8".to_string(),
                workload_id: "abc123def456".to_string(),
            })
            .await;

        match resp {
            BastionResponse::SetupChain { success, error } => {
                assert!(!success);
                assert!(error.unwrap().contains("RFC1918"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_rejects_spoofed_config_hash() {
        let svc = service().await;
        let resp = svc
            .handle(BastionRequest::AcquireNetwork {
                workload_id: "abc123def456".to_string(),
                network_config: NetworkLeaseConfig {
                    subnet_range: None,
                    min_ips: None,
                    driver: None,
                    config_hash: "f".repeat(64),
                },
                lease_duration_secs: None,
            })
            .await;

        match resp {
            BastionResponse::AcquireNetwork { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("config hash mismatch"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn acquire_rejects_invalid_workload_id() {
        let svc = service().await;
        let resp = svc
            .handle(BastionRequest::AcquireNetwork {
                workload_id: "BAD ID".to_string(),
                network_config: NetworkLeaseConfig {
                    subnet_range: None,
                    min_ips: None,
                    driver: None,
                    config_hash: crate::netpool::default_config_hash(None),
                },
                lease_duration_secs: None,
            })
            .await;

        match resp {
            BastionResponse::AcquireNetwork { success, .. } => assert!(!success),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_rejects_foreign_network_name() {
        let svc = service().await;
        let resp = svc
            .handle(BastionRequest::ReleaseNetwork {
                workload_id: "abc123def456".to_string(),
                network_name: "docker-bridge".to_string(),
                force_cleanup: false,
            })
            .await;

        match resp {
            BastionResponse::ReleaseNetwork { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("iso-net-"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_snapshot_is_healthy_when_empty() {
        let svc = service().await;
        let resp = svc.handle(BastionRequest::NetworkStats).await;
        match resp {
            BastionResponse::NetworkStats { success, stats } => {
                assert!(success);
                assert_eq!(stats.total_networks, 0);
                assert!(stats.healthy);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
