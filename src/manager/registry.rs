//! Workload registry.
//!
//! Owns the map of live and recently-finished workloads, enforces the
//! per-manager cap, and sweeps terminal records once their cleanup
//! deadline passes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_MAX_WORKLOADS, ENV_MAX_WORKLOADS, ENV_RUNNER_PATH, REGISTRY_SWEEP_INTERVAL,
    RUNNER_SEARCH_PATHS,
};
use crate::error::{Error, Result};
use crate::manager::protocol::{WorkloadInfo, WorkloadSpec, WorkloadState};
use crate::manager::workload::ManagedWorkload;

/// The manager's workload map.
pub struct Registry {
    workloads: RwLock<HashMap<String, Arc<ManagedWorkload>>>,
    runner_path: String,
    max_workloads: usize,
    shutdown: Notify,
}

impl Registry {
    /// Locates the runner binary and builds an empty registry.
    pub fn new() -> Result<Self> {
        let runner_path = find_runner()?;

        let max_workloads = std::env::var(ENV_MAX_WORKLOADS)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_WORKLOADS);

        info!(runner = %runner_path, max_workloads, "workload registry ready");

        Ok(Self {
            workloads: RwLock::new(HashMap::new()),
            runner_path,
            max_workloads,
            shutdown: Notify::new(),
        })
    }

    /// Registers and starts a workload, generating an ID when the caller
    /// supplied none. Returns the workload ID.
    pub async fn create(&self, workload_id: Option<String>, spec: WorkloadSpec) -> Result<String> {
        // Dashes stripped so the ID is usable for chain derivation.
        let id = workload_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let workload = {
            let mut workloads = self.workloads.write().await;

            if workloads.len() >= self.max_workloads {
                return Err(Error::ResourceExhausted(format!(
                    "maximum workload limit reached ({})",
                    self.max_workloads
                )));
            }
            if workloads.contains_key(&id) {
                return Err(Error::validation(
                    "container_id",
                    format!("workload with ID {id} already exists"),
                ));
            }

            let workload = Arc::new(ManagedWorkload::new(id.clone(), spec));
            workloads.insert(id.clone(), Arc::clone(&workload));
            workload
        };

        if let Err(e) = Arc::clone(&workload).start(&self.runner_path).await {
            self.workloads.write().await.remove(&id);
            return Err(e);
        }

        debug!(workload = %id, "workload started");
        Ok(id)
    }

    /// Looks up a workload by ID.
    pub async fn get(&self, workload_id: &str) -> Result<Arc<ManagedWorkload>> {
        self.workloads
            .read()
            .await
            .get(workload_id)
            .cloned()
            .ok_or_else(|| Error::WorkloadNotFound(workload_id.to_string()))
    }

    /// Lists workloads matching `filter` (`running`, `exited`, or `all`).
    pub async fn list(&self, filter: &str) -> Vec<WorkloadInfo> {
        let workloads = self.workloads.read().await;

        workloads
            .values()
            .filter(|w| match filter {
                "running" => w.state() == WorkloadState::Running,
                "exited" => w.state().is_terminal(),
                _ => true,
            })
            .map(|w| w.info())
            .collect()
    }

    /// Terminates a workload by ID.
    pub async fn terminate(&self, workload_id: &str, force: bool, timeout_secs: u32) -> Result<()> {
        self.get(workload_id).await?.terminate(force, timeout_secs).await
    }

    /// Returns `(total, running)` counts.
    pub async fn stats(&self) -> (usize, usize) {
        let workloads = self.workloads.read().await;
        let running = workloads
            .values()
            .filter(|w| w.state() == WorkloadState::Running)
            .count();
        (workloads.len(), running)
    }

    /// Starts the periodic sweep of expired terminal records.
    pub fn start_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REGISTRY_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.sweep_expired().await,
                    _ = registry.shutdown.notified() => return,
                }
            }
        })
    }

    /// Removes workloads whose cleanup deadline has passed.
    pub async fn sweep_expired(&self) {
        let now = chrono::Utc::now().timestamp();
        let mut workloads = self.workloads.write().await;

        let expired: Vec<String> = workloads
            .iter()
            .filter(|(_, w)| w.cleanup_after().map(|at| now >= at).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(workload) = workloads.remove(&id) {
                workload.close().await;
                debug!(workload = %id, "expired workload swept");
            }
        }
    }

    /// Stops the sweeper and closes every workload.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();

        let workloads = {
            let mut map = self.workloads.write().await;
            map.drain().collect::<Vec<_>>()
        };

        for (id, workload) in workloads {
            if workload.state() == WorkloadState::Running {
                if let Err(e) = workload.terminate(true, 5).await {
                    warn!(workload = %id, error = %e, "terminate on shutdown failed");
                }
            }
            workload.close().await;
        }
    }
}

/// Finds the isolation-runner binary: env override, well-known build and
/// install paths, then `PATH`.
fn find_runner() -> Result<String> {
    if let Ok(path) = std::env::var(ENV_RUNNER_PATH) {
        if !path.is_empty() && PathBuf::from(&path).exists() {
            return Ok(path);
        }
    }

    for candidate in RUNNER_SEARCH_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            if let Ok(absolute) = path.canonicalize() {
                return Ok(absolute.to_string_lossy().into_owned());
            }
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("isolation-runner");
            if candidate.exists() {
                return Ok(candidate.to_string_lossy().into_owned());
            }
        }
    }

    Err(Error::EngineUnavailable(
        "isolation-runner not found in any search path".into(),
    ))
}
