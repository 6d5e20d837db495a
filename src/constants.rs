//! Constants for the Holopod services.
//!
//! All limits, timeouts, prefixes, and environment variable names are
//! defined here to ensure consistency and prevent magic numbers throughout
//! the codebase.

use std::time::Duration;

// =============================================================================
// Chain / Network Naming
// =============================================================================

/// Prefix for per-workload iptables chains.
pub const CHAIN_PREFIX: &str = "ISO-";

/// Number of hex digits in a chain name after the prefix.
pub const CHAIN_HEX_LEN: usize = 16;

/// Maximum iptables chain name length.
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Prefix for pooled bridge networks.
pub const NETWORK_NAME_PREFIX: &str = "iso-net-";

/// Minimum pooled network name length.
pub const MIN_NETWORK_NAME_LEN: usize = 10;

/// Maximum pooled network name length.
pub const MAX_NETWORK_NAME_LEN: usize = 64;

/// Minimum workload ID length.
pub const MIN_WORKLOAD_ID_LEN: usize = 12;

/// Maximum workload ID length.
pub const MAX_WORKLOAD_ID_LEN: usize = 64;

// =============================================================================
// Subnet Allocator
// =============================================================================

/// Default base address for allocated subnets.
pub const DEFAULT_SUBNET_BASE: &str = "10.20.0.0";

/// Default allocator mask (produces 65,536 /24 subnets).
pub const DEFAULT_SUBNET_MASK: u8 = 16;

/// Network driver used for all pooled networks.
pub const NETWORK_DRIVER: &str = "bridge";

/// Default usable-address requirement encoded into the config hash.
pub const DEFAULT_MIN_IPS: u32 = 254;

// =============================================================================
// Network Pool
// =============================================================================

/// Default path for persisted pool state.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/bastion/network_pool.json";

/// Lease time-to-live after a non-force release.
pub const POOL_LEASE_TTL: Duration = Duration::from_secs(3600);

/// Interval between pool cleanup sweeps.
pub const POOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Utilization above which the pool reports unhealthy.
pub const POOL_UTILIZATION_LIMIT: f32 = 0.9;

/// Subnet utilization above which the pool warns and reports unhealthy.
pub const SUBNET_UTILIZATION_WARNING: f32 = 0.8;

/// Network-create retry attempts on subnet overlap.
pub const NETWORK_CREATE_RETRIES: u32 = 3;

/// Base backoff for network-create retries (doubles per attempt).
pub const NETWORK_CREATE_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for privileged bastion operations (iptables, pool mutations).
pub const BASTION_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for engine liveness pings.
pub const ENGINE_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a graceful container stop.
pub const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fallback timeout for image pulls.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for writes to a container's stdin.
pub const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period before a forced runner kill (seconds).
pub const FORCE_TERMINATE_SECS: u32 = 5;

/// Grace period before a graceful runner kill (seconds).
pub const GRACEFUL_TERMINATE_SECS: u32 = 10;

// =============================================================================
// Container IP Discovery
// =============================================================================

/// Attempts made while polling for a container IP.
pub const IP_POLL_ATTEMPTS: u32 = 10;

/// Delay between container IP polls.
pub const IP_POLL_INTERVAL: Duration = Duration::from_millis(200);

// =============================================================================
// Container Manager
// =============================================================================

/// Default maximum concurrent workloads per manager.
pub const DEFAULT_MAX_WORKLOADS: usize = 1000;

/// Required client heartbeat interval on a Run stream.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Tick of the heartbeat check timer.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Delay after a terminal state before a workload record is swept.
pub const WORKLOAD_CLEANUP_DELAY_SECS: i64 = 60;

/// Interval between workload registry sweeps.
pub const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Capacity of each per-workload broadcast channel.
pub const BROADCAST_CAPACITY: usize = 100;

// =============================================================================
// Protocol Bounds
// =============================================================================

/// Maximum length of a single protocol line (bytes).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Maximum length of a runner output line before it is dropped.
pub const MAX_RUNNER_LINE_LEN: usize = 10 * 1024 * 1024;

// =============================================================================
// Workload Limits
// =============================================================================

/// Minimum container memory limit (4 MiB).
pub const MIN_MEMORY_BYTES: i64 = 4 * 1024 * 1024;

/// Maximum container memory limit (128 GiB).
pub const MAX_MEMORY_BYTES: i64 = 128 * 1024 * 1024 * 1024;

/// Minimum container CPU limit (cores).
pub const MIN_CPU_CORES: f64 = 0.01;

/// Maximum container CPU limit (cores).
pub const MAX_CPU_CORES: f64 = 256.0;

/// Maximum image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum registry hostname length.
pub const MAX_REGISTRY_LEN: usize = 253;

/// Maximum registry username length.
pub const MAX_USERNAME_LEN: usize = 255;

/// Maximum registry password length.
pub const MAX_PASSWORD_LEN: usize = 1024;

/// Maximum environment variable value size (64 KiB).
pub const MAX_ENV_VALUE_LEN: usize = 65536;

/// Tmpfs options applied to /tmp when the rootfs is read-only.
pub const READONLY_TMPFS_OPTS: &str = "rw,noexec,nosuid,size=100m";

// =============================================================================
// Container Labels
// =============================================================================

/// Label marking containers owned by the runner.
pub const LABEL_MANAGED_BY: &str = "managed-by";

/// Value of the `managed-by` label.
pub const LABEL_MANAGED_BY_VALUE: &str = "isolation-runner";

/// Label carrying the workload's container name.
pub const LABEL_CONTAINER_NAME: &str = "container-name";

/// Label carrying the creation timestamp (unix seconds).
pub const LABEL_CREATED_AT: &str = "creation-timestamp";

/// Age past which a running orphan container is reaped.
pub const ORPHAN_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

// =============================================================================
// Environment Variables
// =============================================================================

/// Path to the persisted pool state file.
pub const ENV_STATE_FILE: &str = "BASTION_STATE_FILE";

/// Subnet allocator base address override.
pub const ENV_SUBNET_BASE: &str = "BASTION_SUBNET_BASE";

/// Subnet allocator mask override (8..=24).
pub const ENV_SUBNET_MASK: &str = "BASTION_SUBNET_MASK";

/// Address the runner uses to reach the bastion.
pub const ENV_BASTION_ADDRESS: &str = "BASTION_ADDRESS";

/// Skip the bastion's root check (testing only).
pub const ENV_SKIP_ROOT_CHECK: &str = "BASTION_SKIP_ROOT_CHECK";

/// Workload cap override for the manager.
pub const ENV_MAX_WORKLOADS: &str = "MAX_CONTAINERS_PER_MANAGER";

/// Runner binary location override.
pub const ENV_RUNNER_PATH: &str = "ISOLATION_RUNNER_PATH";

/// Service bind address.
pub const ENV_LISTEN_ADDRESS: &str = "LISTEN_ADDRESS";

/// Default bastion bind address.
pub const DEFAULT_BASTION_ADDRESS: &str = "0.0.0.0:50054";

/// Default bastion address as seen from the runner.
pub const DEFAULT_BASTION_CLIENT_ADDRESS: &str = "localhost:50054";

/// Default manager bind address.
pub const DEFAULT_MANAGER_ADDRESS: &str = "0.0.0.0:50055";

/// Fallback search paths for the runner binary.
pub const RUNNER_SEARCH_PATHS: &[&str] = &[
    "./target/debug/isolation-runner",
    "./target/release/isolation-runner",
    "/usr/local/bin/isolation-runner",
];
