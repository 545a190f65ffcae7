//! Controller Manager
//!
//! Hosts the long-running control loop of a controller process:
//! - [`Manager`] owns the managed cluster client, the watch scope and the
//!   registered controllers, and runs them until shutdown
//! - [`leader_election`] makes sure only one replica runs controllers, using a
//!   `Lease` lock or the legacy `ConfigMap` lock
//! - [`probes`] serves `healthz` / `readyz` over HTTP
//! - [`Scheme`] is the explicit registry of kinds controllers may watch

pub mod error;
pub mod leader_election;
pub mod manager;
pub mod probes;
pub mod resource_lock;
pub mod scheme;

pub use error::*;
pub use leader_election::{LeaderElectionConfig, LeaderElector};
pub use manager::{Manager, ManagerOptions, Runnable};
pub use probes::{Checker, HealthProbes, Ping};
pub use resource_lock::{LeaderRecord, LockKind, ResourceLock};
pub use scheme::Scheme;
