//! Policy CRD Definitions
//!
//! Open Cluster Management `Policy` custom resource, as replicated to the hub
//! cluster namespace and to the managed cluster.

pub mod policy;

pub use policy::*;
