//! Error types for the Holopod services.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for Holopod operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the bastion, runner, and manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation / Security
    // =========================================================================
    /// Input was malformed or violated an invariant.
    #[error("{field}: {reason}")]
    Validation { field: String, reason: String },

    /// Input violated a hard security rule (mandatory block overlap,
    /// forbidden DNS server, config hash mismatch).
    #[error("security violation: {0}")]
    Security(String),

    // =========================================================================
    // Privilege / Availability
    // =========================================================================
    /// A privileged operation was attempted without root.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The container or network backend rejected a call or is unreachable.
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// `iptables`/`ip6tables` invocation failed.
    #[error("{command} {args} failed: {output}")]
    PacketFilter {
        command: &'static str,
        args: String,
        output: String,
    },

    // =========================================================================
    // Pool / Resources
    // =========================================================================
    /// Workload cap, subnet exhaustion, or limit bounds exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Retryable failure (subnet overlap during network create).
    #[error("transient: {0}")]
    Transient(String),

    /// Network lease not found in the pool.
    #[error("network {0} not found in pool")]
    LeaseNotFound(String),

    /// Lease is held by a different workload.
    #[error("workload {workload} does not own network {network}")]
    LeaseNotOwned { workload: String, network: String },

    /// Pool state could not be persisted or loaded.
    #[error("pool state at {path}: {reason}")]
    PoolState { path: PathBuf, reason: String },

    // =========================================================================
    // Workload Lifecycle
    // =========================================================================
    /// Container create/start/attach/inspect failed.
    #[error("container operation failed: {0}")]
    ContainerFailed(String),

    /// Image pull or inspect failed (message already sanitized).
    #[error("image pull failed: {0}")]
    ImagePull(String),

    /// Workload not found in the registry.
    #[error("workload not found: {0}")]
    WorkloadNotFound(String),

    // =========================================================================
    // RPC / Protocol
    // =========================================================================
    /// The bastion returned an in-band failure.
    #[error("bastion error: {0}")]
    Bastion(String),

    /// A protocol frame was malformed or out of contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    // =========================================================================
    // Timeouts / I/O
    // =========================================================================
    /// Operation exceeded its deadline.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Builds a validation error for a named field.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Builds a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

// =============================================================================
// Runner Exit Codes
// =============================================================================

/// Exit-code taxonomy for the isolation runner process.
///
/// The runner's own exit code is the workload's exit code on success;
/// setup failures map onto the reserved codes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Workload completed successfully.
    Success = 0,
    /// Input or configuration was invalid.
    Config = 1,
    /// Environment setup failed (runtime missing, chain install).
    Setup = 2,
    /// Runtime failure after setup (network isolation, bastion).
    Runtime = 3,
    /// Operation deadline exceeded.
    Timeout = 124,
    /// Container engine rejected a call.
    Engine = 125,
    /// The container itself reported failure.
    ContainerFailed = 126,
}

impl ExitCode {
    /// Maps an error to the runner exit code, preferring typed variants and
    /// falling back to message heuristics for errors from the engine layer.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Validation { .. } | Error::Security(_) | Error::Protocol(_) => Self::Config,
            Error::Timeout { .. } => Self::Timeout,
            Error::EngineUnavailable(_) | Error::ImagePull(_) => Self::Engine,
            Error::Bastion(_) | Error::PacketFilter { .. } => Self::Runtime,
            Error::PermissionDenied(_) => Self::Setup,
            other => Self::from_message(&other.to_string()),
        }
    }

    /// Heuristic mapping for untyped failure messages.
    fn from_message(msg: &str) -> Self {
        let msg = msg.to_lowercase();
        if msg.contains("timeout") || msg.contains("deadline exceeded") {
            Self::Timeout
        } else if msg.contains("docker") || msg.contains("daemon") || msg.contains("engine") {
            Self::Engine
        } else if msg.contains("iptables") || msg.contains("network") || msg.contains("bastion") {
            Self::Runtime
        } else if msg.contains("runtime") {
            Self::Setup
        } else {
            Self::Config
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}
