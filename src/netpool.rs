//! Bridge-network lease pool.
//!
//! Isolated workloads attach to bridge networks owned by this pool. A lease
//! is **active** while a workload holds it, **pooled** after a non-force
//! release (available for reuse by config hash until its TTL expires), and
//! **expired** once the TTL passes, at which point the cleanup sweep removes
//! the backing network.
//!
//! State is a single JSON document persisted with the write-temp-then-rename
//! pattern after every mutation; a restart reconciles the loaded state
//! against the engine's live network list and rebuilds the reuse index from
//! the surviving pooled leases.
//!
//! Acquire, release, and cleanup all serialize on one lock so persistence
//! and engine mutations stay atomic with respect to each other.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_MIN_IPS, DEFAULT_STATE_FILE, DEFAULT_SUBNET_BASE, DEFAULT_SUBNET_MASK, ENV_STATE_FILE,
    ENV_SUBNET_BASE, ENV_SUBNET_MASK, NETWORK_CREATE_BACKOFF, NETWORK_CREATE_RETRIES,
    NETWORK_DRIVER, NETWORK_NAME_PREFIX, POOL_CLEANUP_INTERVAL, POOL_LEASE_TTL,
    POOL_UTILIZATION_LIMIT, SUBNET_UTILIZATION_WARNING,
};
use crate::engine::NetworkBackend;
use crate::error::{Error, Result};

// =============================================================================
// State Types
// =============================================================================

/// One pooled bridge network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEntry {
    pub network_name: String,
    pub network_id: String,
    pub subnet: String,
    pub config_hash: String,
    pub driver: String,
    pub current_workload: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_released_at: Option<DateTime<Utc>>,
    pub cleanup_at: Option<DateTime<Utc>>,
    pub reuse_count: u32,
    /// TTL applied on release when the acquiring caller asked for one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_secs: Option<u64>,
}

/// Persisted pool document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolState {
    networks: HashMap<String, NetworkEntry>,
    config_index: HashMap<String, Vec<String>>,
    last_cleanup: Option<DateTime<Utc>>,
}

/// Subnet allocator parameters.
#[derive(Debug, Clone)]
pub struct SubnetConfig {
    pub base_ip: String,
    pub subnet_mask: u8,
    pub max_subnets: usize,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            base_ip: DEFAULT_SUBNET_BASE.to_string(),
            subnet_mask: DEFAULT_SUBNET_MASK,
            max_subnets: 1 << (24 - DEFAULT_SUBNET_MASK),
        }
    }
}

impl SubnetConfig {
    /// Builds the allocator config from the environment, falling back to
    /// the `10.20.0.0/16` default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(base) = std::env::var(ENV_SUBNET_BASE) {
            if !base.is_empty() {
                config.base_ip = base;
            }
        }

        if let Ok(mask_str) = std::env::var(ENV_SUBNET_MASK) {
            if let Ok(mask) = mask_str.parse::<u8>() {
                if (8..=24).contains(&mask) {
                    config.subnet_mask = mask;
                    config.max_subnets = 1 << (24 - mask);
                }
            }
        }

        config
    }
}

/// Result of an acquire.
#[derive(Debug, Clone)]
pub struct AcquireResult {
    pub network_name: String,
    pub network_id: String,
    pub subnet: String,
    pub reused: bool,
}

/// Result of a release.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseResult {
    pub cleaned_up: bool,
}

/// Pool utilization snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_networks: u32,
    pub active_networks: u32,
    pub pooled_networks: u32,
    pub pending_cleanup: u32,
    pub utilization: f32,
    pub subnet_utilization: f32,
    pub max_subnets: u32,
    pub healthy: bool,
}

// =============================================================================
// Pool
// =============================================================================

/// The bridge-network pool.
pub struct NetworkPool {
    state: Mutex<PoolState>,
    state_file: PathBuf,
    backend: Arc<dyn NetworkBackend>,
    subnet_config: SubnetConfig,
    shutdown: Notify,
}

impl NetworkPool {
    /// Loads (or initializes) the pool from its state file and reconciles it
    /// against the backend's live network list.
    pub async fn load(
        state_file: Option<PathBuf>,
        subnet_config: SubnetConfig,
        backend: Arc<dyn NetworkBackend>,
    ) -> Result<Self> {
        let state_file = state_file
            .or_else(|| std::env::var(ENV_STATE_FILE).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE));

        ensure_state_dir(&state_file)?;
        let mut state = load_state(&state_file)?;
        reconcile(&mut state, backend.as_ref()).await?;

        info!(
            subnet_base = %subnet_config.base_ip,
            subnet_mask = subnet_config.subnet_mask,
            max_subnets = subnet_config.max_subnets,
            leases = state.networks.len(),
            "network pool initialized"
        );

        Ok(Self {
            state: Mutex::new(state),
            state_file,
            backend,
            subnet_config,
            shutdown: Notify::new(),
        })
    }

    /// Acquires a network for `workload_id`: a pooled lease with the same
    /// config hash when one exists, a freshly created network otherwise.
    pub async fn acquire(
        &self,
        workload_id: &str,
        config_hash: &str,
        subnet_range: Option<&str>,
        lease_ttl_secs: Option<u64>,
    ) -> Result<AcquireResult> {
        let mut state = self.state.lock().await;

        if let Some(network_name) = find_pooled(&state, config_hash) {
            let entry = state
                .networks
                .get_mut(&network_name)
                .ok_or_else(|| Error::LeaseNotFound(network_name.clone()))?;
            entry.current_workload = Some(workload_id.to_string());
            entry.cleanup_at = None;
            entry.reuse_count += 1;
            if lease_ttl_secs.is_some() {
                entry.lease_ttl_secs = lease_ttl_secs;
            }

            let result = AcquireResult {
                network_name: entry.network_name.clone(),
                network_id: entry.network_id.clone(),
                subnet: entry.subnet.clone(),
                reused: true,
            };

            if let Some(names) = state.config_index.get_mut(config_hash) {
                names.retain(|n| n != &network_name);
                if names.is_empty() {
                    state.config_index.remove(config_hash);
                }
            }

            self.persist(&state)?;
            debug!(workload = workload_id, network = %result.network_name, "lease reused");
            return Ok(result);
        }

        self.create_network(&mut state, workload_id, config_hash, subnet_range, lease_ttl_secs)
            .await
    }

    /// Releases a lease held by `workload_id`.
    ///
    /// Non-force releases return the lease to the pool with a TTL; force
    /// releases disconnect remaining endpoints and remove the network now.
    pub async fn release(
        &self,
        workload_id: &str,
        network_name: &str,
        force: bool,
    ) -> Result<ReleaseResult> {
        let mut state = self.state.lock().await;

        let entry = state
            .networks
            .get_mut(network_name)
            .ok_or_else(|| Error::LeaseNotFound(network_name.to_string()))?;

        match &entry.current_workload {
            Some(holder) if holder == workload_id => {}
            _ => {
                return Err(Error::LeaseNotOwned {
                    workload: workload_id.to_string(),
                    network: network_name.to_string(),
                });
            }
        }

        let now = Utc::now();
        entry.current_workload = None;
        entry.last_released_at = Some(now);

        if force {
            let network_id = entry.network_id.clone();
            let config_hash = entry.config_hash.clone();

            self.remove_backing_network(&network_id).await?;

            state.networks.remove(network_name);
            remove_from_index(&mut state.config_index, &config_hash, network_name);
            self.persist(&state)?;

            debug!(workload = workload_id, network = network_name, "lease force-released");
            return Ok(ReleaseResult { cleaned_up: true });
        }

        let ttl = entry
            .lease_ttl_secs
            .map(|s| chrono::Duration::seconds(s as i64))
            .unwrap_or_else(|| {
                chrono::Duration::from_std(POOL_LEASE_TTL).unwrap_or(chrono::Duration::hours(1))
            });
        entry.cleanup_at = Some(now + ttl);
        let config_hash = entry.config_hash.clone();

        state
            .config_index
            .entry(config_hash)
            .or_default()
            .push(network_name.to_string());

        self.persist(&state)?;
        debug!(workload = workload_id, network = network_name, "lease pooled");
        Ok(ReleaseResult { cleaned_up: false })
    }

    /// Removes every expired, unheld lease along with its backing network.
    /// Returns the number of networks reclaimed.
    pub async fn run_cleanup(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let expired: Vec<(String, String, String)> = state
            .networks
            .values()
            .filter(|e| {
                e.current_workload.is_none()
                    && e.cleanup_at.map(|at| at < now).unwrap_or(false)
            })
            .map(|e| (e.network_name.clone(), e.network_id.clone(), e.config_hash.clone()))
            .collect();

        let mut removed = 0usize;
        for (name, id, hash) in expired {
            if let Err(e) = self.remove_backing_network(&id).await {
                warn!(network = %name, error = %e, "expired network removal failed");
                continue;
            }
            state.networks.remove(&name);
            remove_from_index(&mut state.config_index, &hash, &name);
            removed += 1;
        }

        state.last_cleanup = Some(now);
        self.persist(&state)?;

        if removed > 0 {
            info!(removed, "expired network leases reclaimed");
        }
        Ok(removed)
    }

    /// Starts the periodic cleanup sweep. The returned handle finishes after
    /// [`NetworkPool::stop`].
    pub fn start_cleanup(self: Arc<Self>) -> JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POOL_CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is skipped

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pool.run_cleanup().await {
                            warn!(error = %e, "pool cleanup sweep failed");
                        }
                    }
                    _ = pool.shutdown.notified() => return,
                }
            }
        })
    }

    /// Stops the cleanup sweep.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Returns a utilization snapshot.
    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;

        let total = state.networks.len();
        let active = state
            .networks
            .values()
            .filter(|e| e.current_workload.is_some())
            .count();
        let pending = state
            .networks
            .values()
            .filter(|e| e.cleanup_at.is_some())
            .count();

        let utilization = if total > 0 {
            active as f32 / total as f32
        } else {
            0.0
        };
        let subnet_utilization = if self.subnet_config.max_subnets > 0 {
            total as f32 / self.subnet_config.max_subnets as f32
        } else {
            0.0
        };

        PoolStats {
            total_networks: total as u32,
            active_networks: active as u32,
            pooled_networks: (total - active) as u32,
            pending_cleanup: pending as u32,
            utilization,
            subnet_utilization,
            max_subnets: self.subnet_config.max_subnets as u32,
            healthy: utilization < POOL_UTILIZATION_LIMIT
                && subnet_utilization < SUBNET_UTILIZATION_WARNING,
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn create_network(
        &self,
        state: &mut PoolState,
        workload_id: &str,
        config_hash: &str,
        subnet_range: Option<&str>,
        lease_ttl_secs: Option<u64>,
    ) -> Result<AcquireResult> {
        let network_name = format!(
            "{NETWORK_NAME_PREFIX}{}",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let auto_allocate = subnet_range.map(str::is_empty).unwrap_or(true);
        let mut last_err = None;

        for attempt in 0..NETWORK_CREATE_RETRIES {
            let subnet = match subnet_range.filter(|s| !s.is_empty()) {
                Some(s) => s.to_string(),
                None => self.allocate_subnet(state).await?,
            };

            match self.backend.create_network(&network_name, &subnet).await {
                Ok(network_id) => {
                    let entry = NetworkEntry {
                        network_name: network_name.clone(),
                        network_id: network_id.clone(),
                        subnet: subnet.clone(),
                        config_hash: config_hash.to_string(),
                        driver: NETWORK_DRIVER.to_string(),
                        current_workload: Some(workload_id.to_string()),
                        created_at: Utc::now(),
                        last_released_at: None,
                        cleanup_at: None,
                        reuse_count: 0,
                        lease_ttl_secs,
                    };
                    state.networks.insert(network_name.clone(), entry);
                    self.persist(state)?;

                    debug!(workload = workload_id, network = %network_name, subnet = %subnet, "network leased");
                    return Ok(AcquireResult {
                        network_name,
                        network_id,
                        subnet,
                        reused: false,
                    });
                }
                Err(Error::Transient(msg)) if auto_allocate && attempt < NETWORK_CREATE_RETRIES - 1 => {
                    // Another allocator raced us to the subnet; back off and
                    // pick the next free candidate.
                    let backoff = NETWORK_CREATE_BACKOFF * 2u32.pow(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "subnet collision, retrying");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(Error::Transient(msg));
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        Err(Error::EngineUnavailable(format!(
            "failed to create network after {NETWORK_CREATE_RETRIES} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Picks the lowest-index /24 not used by pool state or the engine.
    async fn allocate_subnet(&self, state: &PoolState) -> Result<String> {
        let mut used: std::collections::HashSet<String> = state
            .networks
            .values()
            .map(|e| e.subnet.clone())
            .collect();

        for network in self.backend.list_networks().await? {
            used.extend(network.subnets);
        }

        let utilization = state.networks.len() as f32 / self.subnet_config.max_subnets as f32;
        if utilization > SUBNET_UTILIZATION_WARNING {
            warn!(
                utilization = format!("{:.1}%", utilization * 100.0),
                used = state.networks.len(),
                max = self.subnet_config.max_subnets,
                "high subnet utilization"
            );
        }

        let base: Ipv4Addr = self.subnet_config.base_ip.parse().map_err(|_| {
            Error::validation(
                "subnet_base",
                format!("invalid base IP: {}", self.subnet_config.base_ip),
            )
        })?;
        let octets = base.octets();

        for i in 0..self.subnet_config.max_subnets {
            let candidate = format!(
                "{}.{}.{}.0/24",
                octets[0],
                octets[1] as usize + i / 256,
                i % 256
            );
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::ResourceExhausted(format!(
            "no available subnets (all {} checked in {}/{} range)",
            self.subnet_config.max_subnets, self.subnet_config.base_ip, self.subnet_config.subnet_mask
        )))
    }

    async fn remove_backing_network(&self, network_id: &str) -> Result<()> {
        self.backend.disconnect_endpoints(network_id).await?;
        self.backend.remove_network(network_id).await
    }

    /// Writes the state document atomically: temp sibling, fsync-free
    /// rename, `0600` throughout.
    fn persist(&self, state: &PoolState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = self.state_file.with_extension("json.tmp");

        write_private(&tmp, &data).map_err(|e| Error::PoolState {
            path: tmp.clone(),
            reason: format!("failed to write temp state file: {e}"),
        })?;

        std::fs::rename(&tmp, &self.state_file).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            Error::PoolState {
                path: self.state_file.clone(),
                reason: format!("failed to rename state file: {e}"),
            }
        })
    }
}

// =============================================================================
// State Helpers
// =============================================================================

fn find_pooled(state: &PoolState, config_hash: &str) -> Option<String> {
    state.config_index.get(config_hash).and_then(|names| {
        names
            .iter()
            .find(|name| {
                state
                    .networks
                    .get(*name)
                    .map(|e| e.current_workload.is_none())
                    .unwrap_or(false)
            })
            .cloned()
    })
}

fn remove_from_index(index: &mut HashMap<String, Vec<String>>, hash: &str, name: &str) {
    if let Some(names) = index.get_mut(hash) {
        names.retain(|n| n != name);
        if names.is_empty() {
            index.remove(hash);
        }
    }
}

fn load_state(path: &Path) -> Result<PoolState> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| Error::PoolState {
            path: path.to_path_buf(),
            reason: format!("failed to parse state: {e}"),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PoolState::default()),
        Err(e) => Err(Error::PoolState {
            path: path.to_path_buf(),
            reason: format!("failed to read state file: {e}"),
        }),
    }
}

/// Drops leases whose backing network no longer exists and rebuilds the
/// reuse index from the surviving pooled leases.
async fn reconcile(state: &mut PoolState, backend: &dyn NetworkBackend) -> Result<()> {
    let live: std::collections::HashSet<String> = backend
        .list_networks()
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect();

    let before = state.networks.len();
    state.networks.retain(|_, entry| live.contains(&entry.network_id));
    let dropped = before - state.networks.len();
    if dropped > 0 {
        info!(dropped, "stale leases pruned on load");
    }

    state.config_index.clear();
    for (name, entry) in &state.networks {
        if entry.current_workload.is_none() {
            state
                .config_index
                .entry(entry.config_hash.clone())
                .or_default()
                .push(name.clone());
        }
    }

    Ok(())
}

fn ensure_state_dir(state_file: &Path) -> Result<()> {
    if let Some(dir) = state_file.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| Error::PoolState {
                path: dir.to_path_buf(),
                reason: format!("failed to create state directory: {e}"),
            })?;
            set_mode(dir, 0o700);
        }
    }
    Ok(())
}

fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)?;
    set_mode(path, 0o600);
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

/// Computes the lease cache key for `DEFAULT_MIN_IPS` and the bridge driver.
#[must_use]
pub fn default_config_hash(subnet_range: Option<&str>) -> String {
    crate::validation::compute_config_hash(subnet_range, DEFAULT_MIN_IPS, NETWORK_DRIVER)
}
