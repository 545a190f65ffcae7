//! Controller-specific error types.
//!
//! Every variant is fatal: `main` returns it and the process exits non-zero.

use addon_lease::ConfigCheckError;
use cluster_connection::{ConnectionError, OperatorNamespaceError};
use controller_manager::{BootstrapError, ManagerError, RegistrationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubeconfig resolution or client construction failed
    #[error("Cluster connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Unable to start manager: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Unable to create controller: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Problem running manager: {0}")]
    Manager(#[from] ManagerError),

    #[error("Failed to get operator namespace: {0}")]
    OperatorNamespace(#[from] OperatorNamespaceError),

    #[error("Failed to set up health check: {0}")]
    ConfigCheck(#[from] ConfigCheckError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}
