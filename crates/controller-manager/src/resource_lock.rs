//! Leader election resource locks.
//!
//! Two lock kinds persist the same [`LeaderRecord`]:
//! - [`LeaseLock`] stores it in the spec of a `coordination.k8s.io/v1 Lease`
//! - [`ConfigMapLock`] stores it as JSON in the
//!   `control-plane.alpha.kubernetes.io/leader` annotation of a `ConfigMap`,
//!   for clusters without the Lease API
//!
//! # Atomicity
//!
//! Updates carry the `resourceVersion` that was read, so a concurrent writer
//! makes the update fail with 409 Conflict instead of silently overwriting it.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use kube::api::PostParams;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::LockError;

/// Annotation holding the leader record on a `ConfigMap` lock
pub const LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// Which object type backs the leader election lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockKind {
    #[default]
    Lease,
    /// Legacy lock for clusters without the Lease API
    ConfigMap,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lease => f.write_str("leases"),
            Self::ConfigMap => f.write_str("configmaps"),
        }
    }
}

/// Leader election state shared by every lock kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    pub lease_duration_seconds: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    pub leader_transitions: i32,
}

impl LeaderRecord {
    /// Holder identity, treating an empty string as no holder.
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    /// The record has not been renewed within its lease duration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.renew_time {
            Some(renewed) => now > renewed + chrono::Duration::seconds(i64::from(self.lease_duration_seconds)),
            None => true,
        }
    }
}

/// A record together with the resource version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedRecord {
    pub record: LeaderRecord,
    pub resource_version: String,
}

/// Storage for the leader record.
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// `kind/namespace/name` of the backing object, for logs.
    fn describe(&self) -> String;

    /// Current record, or `None` when the lock object does not exist yet.
    async fn get(&self) -> Result<Option<LockedRecord>, LockError>;

    /// Creates the lock object. Fails with a conflict if it already exists.
    async fn create(&self, record: &LeaderRecord) -> Result<(), LockError>;

    /// Replaces the record if the object is still at `resource_version`.
    async fn update(&self, record: &LeaderRecord, resource_version: &str) -> Result<(), LockError>;
}

/// Lease-backed lock.
pub struct LeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl LeaseLock {
    pub fn new(api: Api<Lease>, namespace: &str, name: &str) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaderRecord, resource_version: Option<&str>) -> Result<Lease, LockError> {
        let mut metadata = json!({ "name": self.name, "namespace": self.namespace });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": lease_spec(record),
        }))?;
        Ok(lease)
    }
}

#[async_trait]
impl ResourceLock for LeaseLock {
    fn describe(&self) -> String {
        format!("leases/{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<LockedRecord>, LockError> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let record = record_from_lease(&lease)?;
        Ok(Some(LockedRecord {
            record,
            resource_version: lease.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LockError> {
        let lease = self.to_lease(record, None)?;
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| LockError::from_write(&self.describe(), e))?;
        Ok(())
    }

    async fn update(&self, record: &LeaderRecord, resource_version: &str) -> Result<(), LockError> {
        let lease = self.to_lease(record, Some(resource_version))?;
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(|e| LockError::from_write(&self.describe(), e))?;
        Ok(())
    }
}

/// ConfigMap-backed lock.
pub struct ConfigMapLock {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapLock {
    pub fn new(api: Api<ConfigMap>, namespace: &str, name: &str) -> Self {
        Self {
            api,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_config_map(&self, record: &LeaderRecord, resource_version: Option<String>) -> Result<ConfigMap, LockError> {
        let mut config_map = ConfigMap::default();
        config_map.metadata.name = Some(self.name.clone());
        config_map.metadata.namespace = Some(self.namespace.clone());
        config_map.metadata.resource_version = resource_version;
        config_map.metadata.annotations = Some(BTreeMap::from([(
            LEADER_ANNOTATION.to_string(),
            serde_json::to_string(record)?,
        )]));
        Ok(config_map)
    }
}

#[async_trait]
impl ResourceLock for ConfigMapLock {
    fn describe(&self) -> String {
        format!("configmaps/{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<LockedRecord>, LockError> {
        let Some(config_map) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let record = record_from_config_map(&config_map)?;
        Ok(Some(LockedRecord {
            record,
            resource_version: config_map.metadata.resource_version.unwrap_or_default(),
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LockError> {
        let config_map = self.to_config_map(record, None)?;
        self.api
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| LockError::from_write(&self.describe(), e))?;
        Ok(())
    }

    async fn update(&self, record: &LeaderRecord, resource_version: &str) -> Result<(), LockError> {
        let config_map = self.to_config_map(record, Some(resource_version.to_string()))?;
        self.api
            .replace(&self.name, &PostParams::default(), &config_map)
            .await
            .map_err(|e| LockError::from_write(&self.describe(), e))?;
        Ok(())
    }
}

/// Lease timestamps are `MicroTime`: RFC 3339 with microsecond precision.
pub fn micro_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn lease_spec(record: &LeaderRecord) -> Value {
    json!({
        "holderIdentity": record.holder_identity,
        "leaseDurationSeconds": record.lease_duration_seconds,
        "acquireTime": record.acquire_time.map(micro_time),
        "renewTime": record.renew_time.map(micro_time),
        "leaseTransitions": record.leader_transitions,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LeaseSpecFields {
    holder_identity: Option<String>,
    lease_duration_seconds: Option<i32>,
    acquire_time: Option<DateTime<Utc>>,
    renew_time: Option<DateTime<Utc>>,
    lease_transitions: Option<i32>,
}

fn record_from_lease(lease: &Lease) -> Result<LeaderRecord, serde_json::Error> {
    let fields: LeaseSpecFields = match &lease.spec {
        Some(spec) => serde_json::from_value(serde_json::to_value(spec)?)?,
        None => LeaseSpecFields::default(),
    };
    Ok(LeaderRecord {
        holder_identity: fields.holder_identity,
        lease_duration_seconds: fields.lease_duration_seconds.unwrap_or_default(),
        acquire_time: fields.acquire_time,
        renew_time: fields.renew_time,
        leader_transitions: fields.lease_transitions.unwrap_or_default(),
    })
}

fn record_from_config_map(config_map: &ConfigMap) -> Result<LeaderRecord, serde_json::Error> {
    match config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(LEADER_ANNOTATION))
    {
        Some(raw) => serde_json::from_str(raw),
        None => Ok(LeaderRecord::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(holder: &str, renewed: DateTime<Utc>) -> LeaderRecord {
        LeaderRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: 15,
            acquire_time: Some(renewed),
            renew_time: Some(renewed),
            leader_transitions: 3,
        }
    }

    #[test]
    fn test_record_expiry() {
        let renewed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = record("pod-a", renewed);
        assert!(!record.is_expired(renewed + chrono::Duration::seconds(15)));
        assert!(record.is_expired(renewed + chrono::Duration::seconds(16)));
        assert!(LeaderRecord::default().is_expired(renewed), "Never renewed means expired");
    }

    #[test]
    fn test_empty_holder_is_no_holder() {
        let mut record = LeaderRecord::default();
        assert_eq!(record.holder(), None);
        record.holder_identity = Some(String::new());
        assert_eq!(record.holder(), None);
        record.holder_identity = Some("pod-a".to_string());
        assert_eq!(record.holder(), Some("pod-a"));
    }

    #[test]
    fn test_config_map_annotation_round_trip() {
        let api_less = |record: &LeaderRecord| {
            let mut config_map = ConfigMap::default();
            config_map.metadata.annotations = Some(BTreeMap::from([(
                LEADER_ANNOTATION.to_string(),
                serde_json::to_string(record).unwrap(),
            )]));
            config_map
        };

        let renewed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let original = record("pod-a", renewed);
        let parsed = record_from_config_map(&api_less(&original)).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_config_map_annotation_uses_client_go_field_names() {
        let renewed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let value = serde_json::to_value(record("pod-a", renewed)).unwrap();
        assert_eq!(value["holderIdentity"], "pod-a");
        assert_eq!(value["leaseDurationSeconds"], 15);
        assert_eq!(value["leaderTransitions"], 3);
        assert!(value.get("renewTime").is_some());
    }

    #[test]
    fn test_config_map_without_annotation_is_unheld() {
        let parsed = record_from_config_map(&ConfigMap::default()).unwrap();
        assert_eq!(parsed.holder(), None);
    }

    #[test]
    fn test_lease_spec_round_trip() {
        let renewed = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let original = record("pod-a", renewed);
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": "lock", "namespace": "ns" },
            "spec": lease_spec(&original),
        }))
        .unwrap();

        assert_eq!(record_from_lease(&lease).unwrap(), original);
    }

    #[test]
    fn test_micro_time_format() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(micro_time(time), "2024-05-01T12:00:00.000000Z");
    }

    #[test]
    fn test_lock_kind_display() {
        assert_eq!(LockKind::Lease.to_string(), "leases");
        assert_eq!(LockKind::ConfigMap.to_string(), "configmaps");
        assert_eq!(LockKind::default(), LockKind::Lease);
    }
}
