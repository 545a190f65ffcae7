//! Cluster connection errors

use std::path::PathBuf;

use kube::config::{InferConfigError, KubeconfigError};
use thiserror::Error;

use crate::resolver::HUB_CONFIG_ENV;

/// Errors raised while resolving or building a cluster connection.
///
/// All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No explicit path and no environment variable for the hub kubeconfig
    #[error("no hub kubeconfig: pass --hub-cluster-configfile or set {HUB_CONFIG_ENV}")]
    MissingHubConfig,

    /// A kubeconfig file could not be read or parsed
    #[error("failed to load kubeconfig {path}: {source}", path = .path.display())]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: KubeconfigError,
    },

    /// `KUBECONFIG` was set but named no files
    #[error("KUBECONFIG is set but lists no files")]
    EmptyKubeconfigList,

    /// The blocking kubeconfig read did not complete
    #[error("kubeconfig read task failed: {0}")]
    ReadTask(#[from] tokio::task::JoinError),

    /// Ambient (in-cluster or default kubeconfig) discovery failed
    #[error("failed to infer cluster config: {0}")]
    Infer(#[from] InferConfigError),

    /// The client could not be built from a parsed config
    #[error("failed to build {role} cluster client: {source}")]
    Client {
        role: &'static str,
        #[source]
        source: kube::Error,
    },
}

/// A watch namespace specification names something that is not a namespace.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid namespace {name:?} in watch scope: {reason}")]
    InvalidNamespace { name: String, reason: &'static str },
}

/// Errors from looking up the namespace the operator runs in.
#[derive(Debug, Error)]
pub enum OperatorNamespaceError {
    /// `OSDK_FORCE_RUN_MODE=local` is set
    #[error("operator run mode forced to local")]
    RunLocal,

    /// The service account namespace file does not exist
    #[error("namespace not found for current environment")]
    NoNamespace,

    #[error("failed to read operator namespace: {0}")]
    Io(#[from] std::io::Error),
}

impl OperatorNamespaceError {
    /// True when the error only means the process is not running inside a cluster.
    pub fn is_not_in_cluster(&self) -> bool {
        matches!(self, Self::RunLocal | Self::NoNamespace)
    }
}
