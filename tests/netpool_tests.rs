//! Network pool integration tests.
//!
//! Exercised against an in-memory backend so no engine is required. The
//! properties here are the pool's contract: lease reuse by config hash,
//! subnet uniqueness, persistence round-trips, reconciliation against the
//! backend, and idempotent release semantics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use holopod::engine::{EngineNetwork, NetworkBackend};
use holopod::error::{Error, Result};
use holopod::netpool::{default_config_hash, NetworkPool, SubnetConfig};

/// In-memory network backend with optional transient-failure injection.
struct FakeBackend {
    networks: Mutex<Vec<EngineNetwork>>,
    fail_creates: AtomicU32,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            networks: Mutex::new(Vec::new()),
            fail_creates: AtomicU32::new(0),
        })
    }

    fn failing_first(n: u32) -> Arc<Self> {
        let backend = Self::new();
        backend.fail_creates.store(n, Ordering::SeqCst);
        backend
    }

    fn network_count(&self) -> usize {
        self.networks.lock().unwrap().len()
    }

    fn remove_by_name(&self, name: &str) {
        self.networks.lock().unwrap().retain(|n| n.name != name);
    }
}

#[async_trait]
impl NetworkBackend for FakeBackend {
    async fn create_network(&self, name: &str, subnet: &str) -> Result<String> {
        if self.fail_creates.load(Ordering::SeqCst) > 0 {
            self.fail_creates.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Transient(format!("Pool overlaps with other one on subnet {subnet}")));
        }

        let mut networks = self.networks.lock().unwrap();
        if networks.iter().any(|n| n.subnets.contains(&subnet.to_string())) {
            return Err(Error::Transient(format!("subnet {subnet} already in use")));
        }

        let id = format!("engine-{name}");
        networks.push(EngineNetwork {
            id: id.clone(),
            name: name.to_string(),
            subnets: vec![subnet.to_string()],
        });
        Ok(id)
    }

    async fn list_networks(&self) -> Result<Vec<EngineNetwork>> {
        Ok(self.networks.lock().unwrap().clone())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let mut networks = self.networks.lock().unwrap();
        let before = networks.len();
        networks.retain(|n| n.id != id);
        if networks.len() == before {
            return Err(Error::EngineUnavailable(format!("no such network: {id}")));
        }
        Ok(())
    }

    async fn disconnect_endpoints(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

fn state_path(dir: &TempDir) -> PathBuf {
    dir.path().join("network_pool.json")
}

async fn pool_with(backend: Arc<FakeBackend>, dir: &TempDir) -> NetworkPool {
    let backend: Arc<dyn NetworkBackend> = backend;
    NetworkPool::load(Some(state_path(dir)), SubnetConfig::default(), backend)
        .await
        .unwrap()
}

const WORKLOAD_A: &str = "abc123def456";
const WORKLOAD_B: &str = "def456abc123";

#[tokio::test]
async fn acquire_creates_a_fresh_network() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(Arc::clone(&backend), &dir).await;

    let hash = default_config_hash(None);
    let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    assert!(!lease.reused);
    assert!(lease.network_name.starts_with("iso-net-"));
    assert_eq!(lease.subnet, "10.20.0.0/24");
    assert_eq!(backend.network_count(), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.total_networks, 1);
    assert_eq!(stats.active_networks, 1);
    assert_eq!(stats.pooled_networks, 0);
}

#[tokio::test]
async fn released_lease_is_reused_for_matching_hash() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(backend, &dir).await;

    let hash = default_config_hash(None);
    let first = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    let released = pool
        .release(WORKLOAD_A, &first.network_name, false)
        .await
        .unwrap();
    assert!(!released.cleaned_up);

    let second = pool.acquire(WORKLOAD_B, &hash, None, None).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.network_name, first.network_name);
    assert_eq!(second.subnet, first.subnet);
}

#[tokio::test]
async fn different_hash_never_reuses_a_pooled_lease() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(backend, &dir).await;

    let hash_a = default_config_hash(None);
    let hash_b = default_config_hash(Some("10.99.0.0/24"));

    let first = pool.acquire(WORKLOAD_A, &hash_a, None, None).await.unwrap();
    pool.release(WORKLOAD_A, &first.network_name, false)
        .await
        .unwrap();

    let second = pool
        .acquire(WORKLOAD_B, &hash_b, Some("10.99.0.0/24"), None)
        .await
        .unwrap();
    assert!(!second.reused);
    assert_ne!(second.network_name, first.network_name);
}

#[tokio::test]
async fn force_release_destroys_the_network() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(Arc::clone(&backend), &dir).await;

    let hash = default_config_hash(None);
    let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    let released = pool
        .release(WORKLOAD_A, &lease.network_name, true)
        .await
        .unwrap();
    assert!(released.cleaned_up);
    assert_eq!(backend.network_count(), 0);

    // A second release of the same lease is a not-found error.
    let err = pool
        .release(WORKLOAD_A, &lease.network_name, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseNotFound(_)));
}

#[tokio::test]
async fn release_by_non_holder_is_rejected() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(backend, &dir).await;

    let hash = default_config_hash(None);
    let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    let err = pool
        .release(WORKLOAD_B, &lease.network_name, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseNotOwned { .. }));

    let err = pool
        .release(WORKLOAD_A, "iso-net-missing", false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseNotFound(_)));
}

#[tokio::test]
async fn hundred_acquisitions_allocate_distinct_subnets() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(backend, &dir).await;

    let mut subnets = std::collections::HashSet::new();
    for i in 0..100 {
        let hash = default_config_hash(Some(&format!("distinct-{i}")));
        let lease = pool
            .acquire(&format!("workload-{i:08}"), &hash, None, None)
            .await
            .unwrap();
        subnets.insert(lease.subnet);
    }

    assert_eq!(subnets.len(), 100);
}

#[tokio::test]
async fn subnet_allocator_skips_addresses_used_by_the_engine() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    // The engine already owns the first candidate subnet.
    backend
        .create_network("pre-existing", "10.20.0.0/24")
        .await
        .unwrap();

    let pool = pool_with(backend, &dir).await;
    let hash = default_config_hash(None);
    let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    assert_eq!(lease.subnet, "10.20.1.0/24");
}

#[tokio::test]
async fn transient_create_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::failing_first(2);
    let pool = pool_with(Arc::clone(&backend), &dir).await;

    let hash = default_config_hash(None);
    let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();
    assert!(!lease.reused);
    assert_eq!(backend.network_count(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_the_failure() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::failing_first(10);
    let pool = pool_with(backend, &dir).await;

    let hash = default_config_hash(None);
    let err = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap_err();
    assert!(err.to_string().contains("after 3 attempts"));
}

#[tokio::test]
async fn state_round_trips_through_persistence() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();

    let hash = default_config_hash(None);
    let (name, subnet) = {
        let pool = pool_with(Arc::clone(&backend), &dir).await;
        let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();
        pool.release(WORKLOAD_A, &lease.network_name, false)
            .await
            .unwrap();
        (lease.network_name, lease.subnet)
    };

    // A fresh pool over the same state file sees the pooled lease and
    // reuses it, which proves both the lease map and the rebuilt config
    // index survived the round trip.
    let pool = pool_with(backend, &dir).await;
    let stats = pool.stats().await;
    assert_eq!(stats.total_networks, 1);
    assert_eq!(stats.pooled_networks, 1);

    let lease = pool.acquire(WORKLOAD_B, &hash, None, None).await.unwrap();
    assert!(lease.reused);
    assert_eq!(lease.network_name, name);
    assert_eq!(lease.subnet, subnet);
}

#[tokio::test]
async fn reload_prunes_leases_whose_network_is_gone() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();

    let hash = default_config_hash(None);
    let name = {
        let pool = pool_with(Arc::clone(&backend), &dir).await;
        let lease = pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();
        pool.release(WORKLOAD_A, &lease.network_name, false)
            .await
            .unwrap();
        lease.network_name
    };

    // Someone removed the network behind the pool's back.
    backend.remove_by_name(&name);

    let pool = pool_with(backend, &dir).await;
    let stats = pool.stats().await;
    assert_eq!(stats.total_networks, 0);

    // And the stale index entry is gone too: a fresh acquire creates.
    let lease = pool.acquire(WORKLOAD_B, &hash, None, None).await.unwrap();
    assert!(!lease.reused);
}

#[tokio::test]
async fn cleanup_reclaims_expired_leases() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(Arc::clone(&backend), &dir).await;

    let hash = default_config_hash(None);
    // Zero-second lease TTL expires immediately on release.
    let lease = pool.acquire(WORKLOAD_A, &hash, None, Some(0)).await.unwrap();
    pool.release(WORKLOAD_A, &lease.network_name, false)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let removed = pool.run_cleanup().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(backend.network_count(), 0);
    assert_eq!(pool.stats().await.total_networks, 0);
}

#[tokio::test]
async fn active_leases_survive_cleanup() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(Arc::clone(&backend), &dir).await;

    let hash = default_config_hash(None);
    let _lease = pool.acquire(WORKLOAD_A, &hash, None, Some(0)).await.unwrap();

    let removed = pool.run_cleanup().await.unwrap();
    assert_eq!(removed, 0);
    assert_eq!(backend.network_count(), 1);
}

#[tokio::test]
async fn state_file_is_created_with_owner_only_permissions() {
    let dir = TempDir::new().unwrap();
    let backend = FakeBackend::new();
    let pool = pool_with(backend, &dir).await;

    let hash = default_config_hash(None);
    pool.acquire(WORKLOAD_A, &hash, None, None).await.unwrap();

    let metadata = std::fs::metadata(state_path(&dir)).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
    assert!(metadata.len() > 0);
}
