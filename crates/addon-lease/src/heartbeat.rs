//! The lease heartbeat loop.
//!
//! ```text
//! Idle -> Evaluating -> Publishing -> Sleeping -> Idle -> ...
//!   \________\______________________________\_________> Stopped
//! ```
//!
//! The first tick fires at once, later ticks every `interval`. A tick never
//! overlaps the previous one, so at most one upsert is in flight. Each healthy
//! tick renews the lease in every target, in the order they were added.
//! Cancellation stops the loop from any state, but an upsert that already
//! started is allowed to finish.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::predicate::HealthPredicate;
use crate::store::{LeaseRecord, LeaseStore};

/// Lease the addon manager watches for this addon
pub const DEFAULT_LEASE_NAME: &str = "policy-controller";
/// The lease is considered stale after this long without renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
/// A quarter of the lease duration, so a single missed tick is tolerated
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Evaluating,
    Publishing,
    Sleeping,
    Stopped,
}

/// Buffered transitions per subscriber before the oldest are dropped
const TRANSITION_BUFFER: usize = 64;

/// A namespace and the store its lease is written through.
struct LeaseTarget {
    namespace: String,
    store: Box<dyn LeaseStore>,
}

pub struct LeaseHeartbeat {
    lease_name: String,
    holder_identity: String,
    lease_duration: Duration,
    interval: Duration,
    predicates: Vec<Box<dyn HealthPredicate>>,
    targets: Vec<LeaseTarget>,
    state: watch::Sender<HeartbeatState>,
    transitions: broadcast::Sender<HeartbeatState>,
}

impl std::fmt::Debug for LeaseHeartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHeartbeat")
            .field("leases", &self.lease_keys())
            .field("interval", &self.interval)
            .field("predicates", &self.predicate_names())
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl LeaseHeartbeat {
    /// Heartbeat renewing [`DEFAULT_LEASE_NAME`] in `namespace` through `store`.
    pub fn new(namespace: &str, store: impl LeaseStore + 'static) -> Self {
        let (state, _) = watch::channel(HeartbeatState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            holder_identity: DEFAULT_LEASE_NAME.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            interval: DEFAULT_INTERVAL,
            predicates: Vec::new(),
            targets: Vec::new(),
            state,
            transitions,
        }
        .with_store(namespace, store)
    }

    /// Also renews the lease in `namespace` through `store`, after the
    /// targets already added.
    #[must_use]
    pub fn with_store(mut self, namespace: &str, store: impl LeaseStore + 'static) -> Self {
        self.targets.push(LeaseTarget {
            namespace: namespace.to_string(),
            store: Box::new(store),
        });
        self
    }

    #[must_use]
    pub fn with_lease_name(mut self, name: &str) -> Self {
        self.lease_name = name.to_string();
        self
    }

    #[must_use]
    pub fn with_holder_identity(mut self, identity: &str) -> Self {
        self.holder_identity = identity.to_string();
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Adds a predicate. Predicates run in the order they were added.
    #[must_use]
    pub fn with_predicate(mut self, predicate: impl HealthPredicate + 'static) -> Self {
        self.predicates.push(Box::new(predicate));
        self
    }

    pub fn predicate_names(&self) -> Vec<&str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    /// `namespace/name` of every lease renewed, in write order.
    pub fn lease_keys(&self) -> Vec<String> {
        self.targets
            .iter()
            .map(|target| format!("{}/{}", target.namespace, self.lease_name))
            .collect()
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state.borrow()
    }

    /// Receives every state transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatState> {
        self.transitions.subscribe()
    }

    /// The record a renewal in `namespace` at `now` writes.
    pub fn record(&self, namespace: &str, now: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            name: self.lease_name.clone(),
            namespace: namespace.to_string(),
            holder_identity: self.holder_identity.clone(),
            lease_duration: self.lease_duration,
            renew_time: now,
        }
    }

    /// Runs every predicate and ANDs the results.
    ///
    /// Every predicate runs even after one fails, so each failure is logged.
    pub async fn evaluate_all(&self) -> bool {
        let mut healthy = true;
        for predicate in &self.predicates {
            match predicate.evaluate().await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Health check {} is failing", predicate.name());
                    healthy = false;
                }
                Err(e) => {
                    warn!("{}", e);
                    healthy = false;
                }
            }
        }
        healthy
    }

    /// Renews every lease when `healthy`, otherwise lets them go stale.
    ///
    /// A failed write is logged and does not stop the remaining targets.
    async fn publish(&self, healthy: bool) {
        if !healthy {
            warn!("Addon is unhealthy, not renewing leases {:?}", self.lease_keys());
            return;
        }

        let now = Utc::now();
        for target in &self.targets {
            let record = self.record(&target.namespace, now);
            match target.store.upsert(&record).await {
                Ok(()) => debug!("Renewed lease {}", record.key()),
                Err(e) => error!("{}", e),
            }
        }
    }

    fn transition(&self, next: HeartbeatState) {
        self.state.send_replace(next);
        // Err only means nobody is subscribed
        let _ = self.transitions.send(next);
    }

    /// Runs until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting lease heartbeat for {:?} every {:?}",
            self.lease_keys(),
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.transition(HeartbeatState::Idle);
            self.transition(HeartbeatState::Evaluating);
            let healthy = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                healthy = self.evaluate_all() => healthy,
            };

            // Not raced against shutdown: a started upsert always completes.
            self.transition(HeartbeatState::Publishing);
            self.publish(healthy).await;

            self.transition(HeartbeatState::Sleeping);
        }

        self.transition(HeartbeatState::Stopped);
        info!("Lease heartbeat for {:?} stopped", self.lease_keys());
    }

    /// Runs the heartbeat on its own task.
    ///
    /// The task stops when `parent` is cancelled or the handle is shut down.
    pub fn spawn(self, parent: &CancellationToken) -> HeartbeatHandle {
        let token = parent.child_token();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(token.clone()));
        HeartbeatHandle { token, task, state }
    }
}

/// Owner of a spawned heartbeat.
#[derive(Debug)]
pub struct HeartbeatHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<HeartbeatState>,
}

impl HeartbeatHandle {
    pub fn state(&self) -> HeartbeatState {
        *self.state.borrow()
    }

    /// Stops the heartbeat and waits for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        self.join().await;
    }

    /// Waits for the heartbeat to exit on its own (parent token cancelled).
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("Lease heartbeat task failed: {}", e);
        }
    }
}
