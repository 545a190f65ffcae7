//! Lease persistence on the hub and managed clusters.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cluster_connection::{ClusterClient, ClusterRole, Hub, Managed};
use controller_manager::resource_lock::micro_time;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Patch, PatchParams};
use serde_json::{Value, json};

use crate::error::HeartbeatError;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "policy-status-sync";

/// The lease as written on one heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    pub name: String,
    pub namespace: String,
    pub holder_identity: String,
    pub lease_duration: Duration,
    pub renew_time: DateTime<Utc>,
}

impl LeaseRecord {
    /// `namespace/name`, for logs.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Apply body for this record.
    pub fn to_apply_patch(&self) -> Value {
        json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.holder_identity,
                "leaseDurationSeconds": i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
                "renewTime": micro_time(self.renew_time),
            },
        })
    }
}

/// Writes lease records. One call creates or renews the lease atomically.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn upsert(&self, record: &LeaseRecord) -> Result<(), HeartbeatError>;
}

/// [`LeaseStore`] backed by one cluster.
pub struct ClusterLeaseStore<R> {
    client: ClusterClient<R>,
}

/// Writes the lease the addon manager on the hub watches
pub type HubLeaseStore = ClusterLeaseStore<Hub>;
/// Writes the lease in the operator namespace on the managed cluster
pub type ManagedLeaseStore = ClusterLeaseStore<Managed>;

impl<R: ClusterRole> ClusterLeaseStore<R> {
    pub fn new(client: ClusterClient<R>) -> Self {
        Self { client }
    }
}

impl<R> Clone for ClusterLeaseStore<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<R: ClusterRole> std::fmt::Debug for ClusterLeaseStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLeaseStore").field("client", &self.client).finish()
    }
}

#[async_trait]
impl<R: ClusterRole> LeaseStore for ClusterLeaseStore<R> {
    async fn upsert(&self, record: &LeaseRecord) -> Result<(), HeartbeatError> {
        let api = self.client.namespaced::<Lease>(&record.namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&record.name, &params, &Patch::Apply(record.to_apply_patch()))
            .await
            .map_err(|e| HeartbeatError::Publish {
                lease: format!("{} ({})", record.key(), R::NAME),
                source: Box::new(e),
            })?;
        Ok(())
    }
}
