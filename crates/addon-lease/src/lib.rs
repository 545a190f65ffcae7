//! Addon Lease
//!
//! Reports the health of the addon to the hub cluster. The addon manager on
//! the hub watches a `Lease` per managed cluster and marks the addon
//! unavailable when it stops being renewed.
//!
//! - [`LeaseHeartbeat`] ticks on a fixed interval, ANDs every
//!   [`HealthPredicate`] and renews the lease only while all of them pass
//! - [`AddonPodCheck`] is the standard predicate: a running, ready pod matching
//!   a label selector
//! - [`ManagedLeaseStore`] and [`HubLeaseStore`] write the lease with
//!   server-side apply, on the managed cluster and on the hub
//! - [`ConfigChecker`] fails `healthz` once the hub kubeconfig changes on disk
//!
//! # Testing
//!
//! Enable the `test-util` feature for [`mock`] stores and predicates.

pub mod config_checker;
pub mod error;
pub mod heartbeat;
pub mod predicate;
pub mod store;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use config_checker::ConfigChecker;
pub use error::*;
pub use heartbeat::{HeartbeatHandle, HeartbeatState, LeaseHeartbeat};
pub use predicate::{AddonPodCheck, HealthPredicate};
pub use store::{ClusterLeaseStore, HubLeaseStore, LeaseRecord, LeaseStore, ManagedLeaseStore};
