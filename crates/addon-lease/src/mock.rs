//! Mock stores and predicates for unit testing
//!
//! Lets heartbeat behavior be tested without a hub or managed cluster. All
//! mocks are cheap to clone and clones share state, so a test keeps one clone
//! to inspect while the heartbeat owns the other.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::HeartbeatError;
use crate::predicate::HealthPredicate;
use crate::store::{LeaseRecord, LeaseStore};

/// In-memory [`LeaseStore`] that records every successful upsert.
#[derive(Debug, Clone, Default)]
pub struct MockLeaseStore {
    upserts: Arc<Mutex<Vec<LeaseRecord>>>,
    attempts: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    delay: Option<Duration>,
}

impl MockLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert takes `delay` before it completes.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes upserts fail until switched off again.
    pub fn fail_upserts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Completed, successful upserts in order.
    pub fn upserts(&self) -> Vec<LeaseRecord> {
        self.upserts.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts().len()
    }

    /// Upserts started, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of upserts that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for MockLeaseStore {
    async fn upsert(&self, record: &LeaseRecord) -> Result<(), HeartbeatError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(HeartbeatError::Publish {
                lease: record.key(),
                source: "mock upsert failure".into(),
            });
        }
        if let Ok(mut upserts) = self.upserts.lock() {
            upserts.push(record.clone());
        }
        Ok(())
    }
}

/// Predicate with a switchable verdict that counts its evaluations.
#[derive(Debug, Clone)]
pub struct StaticPredicate {
    name: String,
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl StaticPredicate {
    pub fn new(name: &str, healthy: bool) -> Self {
        Self {
            name: name.to_string(),
            healthy: Arc::new(AtomicBool::new(healthy)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthPredicate for StaticPredicate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> Result<bool, HeartbeatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

/// Predicate that can never be evaluated.
#[derive(Debug, Clone)]
pub struct FailingPredicate {
    name: String,
}

impl FailingPredicate {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }
}

#[async_trait]
impl HealthPredicate for FailingPredicate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> Result<bool, HeartbeatError> {
        Err(HeartbeatError::Evaluation {
            name: self.name.clone(),
            source: "pods is forbidden".into(),
        })
    }
}
