//! Heartbeat errors.
//!
//! None of these stop the heartbeat: a failed evaluation counts as unhealthy
//! and a failed publish is retried on the next tick.

use std::path::PathBuf;

use thiserror::Error;

/// Boxed cause, so predicates are free to fail with any error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    /// A health predicate could not be evaluated
    #[error("health check {name} could not be evaluated: {source}")]
    Evaluation {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The lease could not be written to the hub
    #[error("failed to update lease {lease}: {source}")]
    Publish {
        lease: String,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigCheckError {
    #[error("failed to read kubeconfig {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
