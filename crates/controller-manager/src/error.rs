//! Manager errors.
//!
//! Construction and registration errors are fatal at startup; `ManagerError`
//! ends the run loop.

use cluster_connection::ScopeError;
use thiserror::Error;

/// Errors building the manager or registering probes.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Watch scope names an invalid namespace
    #[error("invalid watch scope: {0}")]
    Scope(#[from] ScopeError),

    /// Probe bind address could not be parsed
    #[error("invalid health probe bind address {0:?}")]
    ProbeAddress(String),

    /// Only the disabled sentinel is accepted for the metrics address
    #[error("metrics endpoint is disabled; bind address must be \"0\", got {0:?}")]
    MetricsUnsupported(String),

    /// A probe with this name is already registered
    #[error("{kind} check {name:?} is already registered")]
    DuplicateCheck { kind: &'static str, name: String },

    /// Leader election is enabled but no namespace could be determined
    #[error("unable to find leader election namespace: {0}")]
    LeaderElectionNamespace(String),
}

/// Errors attaching a controller to the manager.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// The controller watches a kind missing from the scheme
    #[error("controller {controller:?} watches {kind}, which is not registered in the scheme")]
    UnknownKind { controller: String, kind: String },

    #[error("a controller named {0:?} is already registered")]
    DuplicateController(String),
}

/// Errors raised while the manager runs.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("health probe server failed: {0}")]
    ProbeServer(#[source] std::io::Error),

    #[error("leader election lost: {0}")]
    LeadershipLost(String),

    #[error("controller {name} failed: {source}")]
    Runnable {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("controller task panicked: {0}")]
    Panicked(String),
}

/// A failed health or readiness check.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from reading or writing a leader election lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another candidate wrote the lock first (HTTP 409)
    #[error("lock {0} was modified concurrently")]
    Conflict(String),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LockError {
    /// Maps a 409 Conflict to [`LockError::Conflict`], anything else to
    /// [`LockError::Kube`].
    pub fn from_write(lock: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(e) if e.code == 409 => Self::Conflict(lock.to_string()),
            other => Self::Kube(other),
        }
    }

    /// True for an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
