//! The privileged broker for packet-filter and bridge-network mutation.
//!
//! The bastion is the only component allowed to invoke `iptables` or create
//! bridge networks. Runners reach it over a line-JSON RPC; every operation
//! is validated before anything privileged runs and audit-logged on both
//! success and failure.

pub mod client;
pub mod protocol;
pub mod server;
pub mod service;

pub use client::{BastionClient, NetworkLease};
pub use protocol::{BastionRequest, BastionResponse, NetworkLeaseConfig};
pub use service::BastionService;
