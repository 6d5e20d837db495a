//! The per-workload isolation runner.
//!
//! A runner process owns exactly one workload: it reads a spec from its
//! standard input, pulls the image, creates and starts the container on a
//! leased bridge network, scopes its traffic through the bastion, pumps
//! stdio as line-JSON events, and reclaims every resource on the way out.

pub mod events;
pub mod lifecycle;
pub mod spec;
pub mod workload;

pub use events::Events;
pub use lifecycle::{generate_chain_name, LifecycleTracker};
pub use spec::{ImageAuth, ImageSpec, WorkloadConfig, WorkloadInput};
pub use workload::{IpOutcome, Workload};
