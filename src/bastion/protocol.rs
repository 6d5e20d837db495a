//! Wire protocol for the bastion RPC surface.
//!
//! Transport is newline-delimited JSON over TCP: one request line per
//! connection, one response line back. Every response carries a `success`
//! bit; validation failures travel in the `error` field rather than as
//! transport errors, so a misbehaving caller can always read a structured
//! answer.

use serde::{Deserialize, Serialize};

use crate::netpool::PoolStats;
use crate::policy::NetworkPolicy;

/// Requests accepted by the bastion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BastionRequest {
    /// Create the per-workload chain and the FORWARD jump.
    SetupChain {
        chain_name: String,
        container_ip: String,
        workload_id: String,
    },
    /// Compile and install a network policy into an existing chain.
    ApplyRules {
        chain_name: String,
        policy: NetworkPolicy,
        workload_id: String,
    },
    /// Tear down a chain (idempotent).
    CleanupChain {
        chain_name: String,
        workload_id: String,
    },
    /// Lease a bridge network from the pool.
    AcquireNetwork {
        workload_id: String,
        network_config: NetworkLeaseConfig,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_duration_secs: Option<u64>,
    },
    /// Return (or destroy) a leased bridge network.
    ReleaseNetwork {
        workload_id: String,
        network_name: String,
        #[serde(default)]
        force_cleanup: bool,
    },
    /// Snapshot pool utilization.
    NetworkStats,
    /// Service liveness and packet-filter availability.
    Health,
}

/// Caller-declared network shape; the hash binds the other fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLeaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub config_hash: String,
}

/// Responses produced by the bastion, one variant per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BastionResponse {
    SetupChain {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApplyRules {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        rules_applied: u32,
    },
    CleanupChain {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AcquireNetwork {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        network_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subnet: Option<String>,
        #[serde(default)]
        reused: bool,
    },
    ReleaseNetwork {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        cleaned_up: bool,
    },
    NetworkStats {
        success: bool,
        stats: PoolStats,
    },
    Health {
        healthy: bool,
        version: String,
        iptables_available: bool,
    },
    /// Returned when the request line itself could not be understood.
    Invalid {
        success: bool,
        error: String,
    },
}

impl BastionResponse {
    /// Serializes to a JSON line with trailing newline.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        let mut json = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"op":"invalid","success":false,"error":"serialization failed"}"#.to_string()
        });
        json.push('\n');
        json
    }

    /// Builds the malformed-request response.
    #[must_use]
    pub fn invalid(error: impl Into<String>) -> Self {
        Self::Invalid {
            success: false,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let req = BastionRequest::SetupChain {
            chain_name: "ISO-0123456789abcdef".to_string(),
            container_ip: "10.20.1.2".to_string(),
            workload_id: "abc123def456".to_string(),
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""op":"setup_chain""#));

        let back: BastionRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, BastionRequest::SetupChain { .. }));
    }

    #[test]
    fn acquire_request_parses_without_optionals() {
        let json = r#"{"op":"acquire_network","workload_id":"abc123def456","network_config":{"config_hash":"deadbeef"}}"#;
        let req: BastionRequest = serde_json::from_str(json).unwrap();
        match req {
            BastionRequest::AcquireNetwork {
                network_config,
                lease_duration_secs,
                ..
            } => {
                assert_eq!(network_config.config_hash, "deadbeef");
                assert!(network_config.subnet_range.is_none());
                assert!(lease_duration_secs.is_none());
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn error_response_is_in_band() {
        let resp = BastionResponse::SetupChain {
            success: false,
            error: Some("chain_name: too long".to_string()),
        };
        let line = resp.to_json_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""success":false"#));
        assert!(line.contains("too long"));
    }
}
