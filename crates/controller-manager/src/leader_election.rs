//! Leader election
//!
//! Only the replica holding the lock runs controllers. The elector:
//! 1. Retries every `retry_period` until it holds the lock (or shutdown)
//! 2. Renews the lock every `retry_period` while controllers run
//! 3. Reports leadership lost if no renewal succeeds within `renew_deadline`
//! 4. Releases the lock on graceful shutdown so a successor takes over at once

use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_connection::ManagedClient;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{LockError, ManagerError};
use crate::resource_lock::{ConfigMapLock, LeaderRecord, LeaseLock, LockKind, ResourceLock};

/// How long a non-leader waits before taking over an unrenewed lock
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
/// How long the leader keeps retrying renewal before giving up
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Interval between acquire and renew attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Leader election settings, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Name of the lock object
    pub id: String,
    /// Namespace of the lock object on the managed cluster
    pub namespace: String,
    /// Holder identity written into the lock
    pub identity: String,
    pub lock: LockKind,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(id: &str, namespace: &str, lock: LockKind) -> Self {
        Self {
            id: id.to_string(),
            namespace: namespace.to_string(),
            identity: default_identity(),
            lock,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    /// Builds the lock object this config describes on the managed cluster.
    pub fn resource_lock(&self, client: &ManagedClient) -> Box<dyn ResourceLock> {
        match self.lock {
            LockKind::Lease => Box::new(LeaseLock::new(
                client.namespaced::<Lease>(&self.namespace),
                &self.namespace,
                &self.id,
            )),
            LockKind::ConfigMap => Box::new(ConfigMapLock::new(
                client.namespaced::<ConfigMap>(&self.namespace),
                &self.namespace,
                &self.id,
            )),
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}

/// `<hostname>_<uuid>`, unique per process even when pods share a hostname.
fn default_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{}_{}", host, uuid::Uuid::new_v4())
}

/// What a candidate should do with the record it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDecision {
    /// We hold the lock; refresh the renew time
    Renew,
    /// The lock is free or expired; take it
    Acquire,
    /// Someone else holds an unexpired lock
    Wait,
}

pub fn decide(current: &LeaderRecord, identity: &str, now: DateTime<Utc>) -> LockDecision {
    match current.holder() {
        Some(holder) if holder == identity => LockDecision::Renew,
        Some(_) if !current.is_expired(now) => LockDecision::Wait,
        _ => LockDecision::Acquire,
    }
}

pub struct LeaderElector {
    lock: Box<dyn ResourceLock>,
    config: LeaderElectionConfig,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lock", &self.lock.describe())
            .field("identity", &self.config.identity)
            .finish()
    }
}

impl LeaderElector {
    pub fn new(lock: Box<dyn ResourceLock>, config: LeaderElectionConfig) -> Self {
        Self { lock, config }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// One acquire-or-renew attempt. `Ok(false)` means another candidate
    /// holds the lock or won a concurrent write.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LockError> {
        let now = Utc::now();
        let identity = self.identity();

        let Some(locked) = self.lock.get().await? else {
            let record = LeaderRecord {
                holder_identity: Some(identity.to_string()),
                lease_duration_seconds: self.config.lease_duration_seconds(),
                acquire_time: Some(now),
                renew_time: Some(now),
                leader_transitions: 0,
            };
            return conflict_as_false(self.lock.create(&record).await);
        };

        let mut record = locked.record.clone();
        match decide(&locked.record, identity, now) {
            LockDecision::Wait => return Ok(false),
            LockDecision::Renew => {
                record.renew_time = Some(now);
                record.lease_duration_seconds = self.config.lease_duration_seconds();
            }
            LockDecision::Acquire => {
                if let Some(previous) = locked.record.holder() {
                    info!("Lock {} held by {} expired, taking over", self.lock.describe(), previous);
                }
                record.holder_identity = Some(identity.to_string());
                record.lease_duration_seconds = self.config.lease_duration_seconds();
                record.acquire_time = Some(now);
                record.renew_time = Some(now);
                record.leader_transitions += 1;
            }
        }

        conflict_as_false(self.lock.update(&record, &locked.resource_version).await)
    }

    /// Blocks until the lock is held. Returns `false` if shutdown came first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        info!("Attempting to acquire leader lease {}...", self.lock.describe());
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Successfully acquired lease {} as {}", self.lock.describe(), self.identity());
                    return true;
                }
                Ok(false) => debug!("Lease {} is held by another candidate", self.lock.describe()),
                Err(e) => error!("Error retrieving resource lock {}: {}", self.lock.describe(), e),
            }

            tokio::select! {
                () = shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keeps renewing the lock until shutdown.
    ///
    /// Returns `Ok(())` on shutdown and [`ManagerError::LeadershipLost`] when
    /// no renewal succeeded within the renew deadline.
    pub async fn hold(&self, shutdown: &CancellationToken) -> Result<(), ManagerError> {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.retry_period) => {}
            }

            let failure = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    debug!("Renewed lease {}", self.lock.describe());
                    last_renewed = tokio::time::Instant::now();
                    continue;
                }
                Ok(false) => "lock is held by another candidate".to_string(),
                Err(e) => e.to_string(),
            };

            warn!("Failed to renew lease {}: {}", self.lock.describe(), failure);
            if last_renewed.elapsed() >= self.config.renew_deadline {
                return Err(ManagerError::LeadershipLost(format!(
                    "failed to renew lease {} within {:?}: {}",
                    self.lock.describe(),
                    self.config.renew_deadline,
                    failure
                )));
            }
        }
    }

    /// Gives up the lock if we still hold it.
    pub async fn release(&self) -> Result<(), LockError> {
        let Some(locked) = self.lock.get().await? else {
            return Ok(());
        };
        if locked.record.holder() != Some(self.identity()) {
            return Ok(());
        }

        let now = Utc::now();
        let record = LeaderRecord {
            holder_identity: None,
            lease_duration_seconds: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: locked.record.leader_transitions,
        };
        self.lock.update(&record, &locked.resource_version).await?;
        info!("Released leader lease {}", self.lock.describe());
        Ok(())
    }
}

fn conflict_as_false(result: Result<(), LockError>) -> Result<bool, LockError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_lock::LockedRecord;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// In-memory lock with resourceVersion compare-and-swap.
    #[derive(Default, Clone)]
    struct MemoryLock {
        state: Arc<Mutex<Option<(LeaderRecord, u64)>>>,
        fail_reads: Arc<Mutex<bool>>,
    }

    impl MemoryLock {
        fn record(&self) -> Option<LeaderRecord> {
            self.state.lock().unwrap().as_ref().map(|(r, _)| r.clone())
        }

        fn set(&self, record: LeaderRecord) {
            let mut state = self.state.lock().unwrap();
            let version = state.as_ref().map_or(1, |(_, v)| v + 1);
            *state = Some((record, version));
        }

        fn fail_reads(&self, fail: bool) {
            *self.fail_reads.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl ResourceLock for MemoryLock {
        fn describe(&self) -> String {
            "leases/test/lock".to_string()
        }

        async fn get(&self) -> Result<Option<LockedRecord>, LockError> {
            if *self.fail_reads.lock().unwrap() {
                return Err(LockError::Serialization(
                    serde_json::from_str::<LeaderRecord>("not json").unwrap_err(),
                ));
            }
            Ok(self.state.lock().unwrap().as_ref().map(|(record, version)| LockedRecord {
                record: record.clone(),
                resource_version: version.to_string(),
            }))
        }

        async fn create(&self, record: &LeaderRecord) -> Result<(), LockError> {
            let mut state = self.state.lock().unwrap();
            if state.is_some() {
                return Err(LockError::Conflict(self.describe()));
            }
            *state = Some((record.clone(), 1));
            Ok(())
        }

        async fn update(&self, record: &LeaderRecord, resource_version: &str) -> Result<(), LockError> {
            let mut state = self.state.lock().unwrap();
            match state.as_mut() {
                Some((current, version)) if version.to_string() == resource_version => {
                    *current = record.clone();
                    *version += 1;
                    Ok(())
                }
                _ => Err(LockError::Conflict(self.describe())),
            }
        }
    }

    fn config(identity: &str) -> LeaderElectionConfig {
        let mut config = LeaderElectionConfig::new("lock", "test", LockKind::Lease);
        config.identity = identity.to_string();
        config
    }

    fn elector(lock: &MemoryLock, identity: &str) -> LeaderElector {
        LeaderElector::new(Box::new(lock.clone()), config(identity))
    }

    fn held_by(holder: &str, renewed: DateTime<Utc>) -> LeaderRecord {
        LeaderRecord {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: 15,
            acquire_time: Some(renewed),
            renew_time: Some(renewed),
            leader_transitions: 0,
        }
    }

    #[test]
    fn test_decide() {
        let now = Utc::now();
        assert_eq!(decide(&LeaderRecord::default(), "a", now), LockDecision::Acquire);
        assert_eq!(decide(&held_by("a", now), "a", now), LockDecision::Renew);
        assert_eq!(decide(&held_by("b", now), "a", now), LockDecision::Wait);
        assert_eq!(
            decide(&held_by("b", now - chrono::Duration::seconds(30)), "a", now),
            LockDecision::Acquire,
            "Expired foreign lock should be taken over"
        );
    }

    #[test]
    fn test_default_identity_is_unique() {
        let a = LeaderElectionConfig::new("lock", "ns", LockKind::Lease);
        let b = LeaderElectionConfig::new("lock", "ns", LockKind::Lease);
        assert_ne!(a.identity, b.identity);
        assert_eq!(a.lease_duration, DEFAULT_LEASE_DURATION);
        assert_eq!(a.renew_deadline, DEFAULT_RENEW_DEADLINE);
        assert_eq!(a.retry_period, DEFAULT_RETRY_PERIOD);
    }

    #[tokio::test]
    async fn test_acquire_free_lock() {
        let lock = MemoryLock::default();
        let elector = elector(&lock, "pod-a");

        assert!(elector.try_acquire_or_renew().await.unwrap());
        let record = lock.record().unwrap();
        assert_eq!(record.holder(), Some("pod-a"));
        assert_eq!(record.lease_duration_seconds, 15);
    }

    #[tokio::test]
    async fn test_renew_own_lock_keeps_acquire_time() {
        let lock = MemoryLock::default();
        let acquired = Utc::now() - chrono::Duration::seconds(5);
        lock.set(held_by("pod-a", acquired));

        assert!(elector(&lock, "pod-a").try_acquire_or_renew().await.unwrap());
        let record = lock.record().unwrap();
        assert_eq!(record.acquire_time, Some(acquired));
        assert!(record.renew_time.unwrap() > acquired);
        assert_eq!(record.leader_transitions, 0);
    }

    #[tokio::test]
    async fn test_respects_unexpired_foreign_lock() {
        let lock = MemoryLock::default();
        lock.set(held_by("pod-b", Utc::now()));

        assert!(!elector(&lock, "pod-a").try_acquire_or_renew().await.unwrap());
        assert_eq!(lock.record().unwrap().holder(), Some("pod-b"));
    }

    #[tokio::test]
    async fn test_takes_over_expired_lock() {
        let lock = MemoryLock::default();
        lock.set(held_by("pod-b", Utc::now() - chrono::Duration::seconds(60)));

        assert!(elector(&lock, "pod-a").try_acquire_or_renew().await.unwrap());
        let record = lock.record().unwrap();
        assert_eq!(record.holder(), Some("pod-a"));
        assert_eq!(record.leader_transitions, 1);
    }

    #[tokio::test]
    async fn test_only_one_candidate_wins_free_lock() {
        let lock = MemoryLock::default();
        let a = elector(&lock, "pod-a");
        let b = elector(&lock, "pod-b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert_eq!(lock.record().unwrap().holder(), Some("pod-a"));
    }

    #[tokio::test]
    async fn test_release_clears_holder() {
        let lock = MemoryLock::default();
        let elector = elector(&lock, "pod-a");
        assert!(elector.try_acquire_or_renew().await.unwrap());

        elector.release().await.unwrap();
        let record = lock.record().unwrap();
        assert_eq!(record.holder(), None);
        assert_eq!(record.lease_duration_seconds, 1);

        // A successor does not have to wait for the old lease to expire.
        assert!(self::elector(&lock, "pod-b").try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_leaves_foreign_lock_alone() {
        let lock = MemoryLock::default();
        lock.set(held_by("pod-b", Utc::now()));

        elector(&lock, "pod-a").release().await.unwrap();
        assert_eq!(lock.record().unwrap().holder(), Some("pod-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_stops_on_shutdown() {
        let lock = MemoryLock::default();
        lock.set(held_by("pod-b", Utc::now() + chrono::Duration::hours(1)));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        assert!(!elector(&lock, "pod-a").acquire(&token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_returns_ok_on_shutdown() {
        let lock = MemoryLock::default();
        let elector = elector(&lock, "pod-a");
        let token = CancellationToken::new();
        assert!(elector.acquire(&token).await);

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel.cancel();
        });

        elector.hold(&token).await.unwrap();
        assert_eq!(lock.record().unwrap().holder(), Some("pod-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_reports_lost_leadership_after_renew_deadline() {
        let lock = MemoryLock::default();
        let elector = elector(&lock, "pod-a");
        let token = CancellationToken::new();
        assert!(elector.acquire(&token).await);

        lock.fail_reads(true);
        let started = tokio::time::Instant::now();
        let err = elector.hold(&token).await.unwrap_err();

        assert!(matches!(err, ManagerError::LeadershipLost(_)));
        assert!(started.elapsed() >= DEFAULT_RENEW_DEADLINE);
    }
}
