//! The container manager: front-door service for workload streams.
//!
//! Accepts workload-creation streams, spawns one isolation runner per
//! workload, multiplexes stdio over the stream, enforces the heartbeat
//! contract, and guarantees that losing the client stream terminates the
//! workload.

pub mod protocol;
pub mod registry;
pub mod service;
pub mod workload;

pub use protocol::{ClientFrame, ServerFrame, StatusCode, WorkloadSpec, WorkloadState};
pub use registry::Registry;
pub use workload::ManagedWorkload;
