//! # holopod
//!
//! **Sandboxed container workloads with broker-enforced network isolation**
//!
//! Holopod runs short-lived, untrusted workloads as sandboxed containers on
//! a Linux host. Defense in depth comes from three cooperating services:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  client                                                             │
//! │    │  Run stream (NDJSON over TCP, heartbeat every 30 s)            │
//! │    ▼                                                                │
//! │  ┌─────────────────────┐   spawns one per workload                  │
//! │  │  container-manager  │──────────────────────────────┐             │
//! │  │  registry, streams  │                              ▼             │
//! │  └─────────────────────┘                   ┌────────────────────┐   │
//! │                                            │  isolation-runner  │   │
//! │   spec on stdin, events on stdout ────────▶│  per-workload      │   │
//! │                                            │  orchestrator      │   │
//! │                                            └─────────┬──────────┘   │
//! │                 lease networks, install chains       │              │
//! │                                                      ▼              │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │  bastion (root)                                               │  │
//! │  │  iptables/ip6tables  │  bridge-network pool  │  audit log     │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Privilege Boundary
//!
//! Only the bastion runs as root and only the bastion may touch the packet
//! filter or create bridge networks. The runner and manager are unprivileged
//! and reach the bastion over a validated, audit-logged RPC; a runner is
//! forbidden from invoking `iptables` directly.
//!
//! # Key Security Properties
//!
//! - **Mandatory blocks**: localhost, cloud metadata, link-local,
//!   multicast, reserved, and broadcast ranges are always dropped and can
//!   never be whitelisted (see [`policy`]).
//! - **Private ranges**: RFC1918 space is blocked unless a whitelist entry
//!   overlaps it, and then only the overlapped range is open.
//! - **Validated privilege**: every bastion input passes the pure
//!   predicates in [`validation`] before anything privileged runs.
//! - **Guaranteed reclamation**: each runner registers every acquired
//!   resource with a [`runner::LifecycleTracker`]; crash, signal, or broken
//!   pipe still releases containers, chains, and leases.
//! - **Liveness contracts**: a `Run` stream requires a heartbeat every
//!   30 seconds, and losing the stream terminates the workload.
//!
//! # Lifecycle
//!
//! ```text
//!   Init ─▶ Planning ─▶ ImageReady ─▶ ContainerCreated ─▶ Running
//!                                                           │
//!                      ┌────────────────────────────────────┤
//!                      ▼                                    ▼
//!               NetworkScoped ─▶ Supervising ─▶ Draining ─▶ Terminated
//! ```
//!
//! Teardown reverses acquisition order: filter chain, container, network
//! lease. A lease released without force returns to the pool and is reused
//! by the next workload with the same config hash.

pub mod constants;
pub mod error;

pub mod policy;
pub mod validation;

pub mod engine;
pub mod firewall;
pub mod netpool;

pub mod bastion;
pub mod manager;
pub mod runner;

pub use error::{Error, ExitCode, Result};
