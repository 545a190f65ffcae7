//! Operator namespace lookup.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::OperatorNamespaceError;
use crate::resolver::{EnvSource, ProcessEnv};

/// File the kubelet mounts with the pod's namespace
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Setting this to `local` forces the operator to behave as if it runs outside a cluster
pub const FORCE_RUN_MODE_ENV: &str = "OSDK_FORCE_RUN_MODE";

/// Returns the namespace the operator pod runs in.
pub async fn operator_namespace() -> Result<String, OperatorNamespaceError> {
    operator_namespace_from(&ProcessEnv, Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH)).await
}

/// [`operator_namespace`] with an explicit environment and namespace file.
pub async fn operator_namespace_from(
    env: &impl EnvSource,
    namespace_file: &Path,
) -> Result<String, OperatorNamespaceError> {
    if env.var(FORCE_RUN_MODE_ENV).as_deref() == Some("local") {
        return Err(OperatorNamespaceError::RunLocal);
    }

    match tokio::fs::read_to_string(namespace_file).await {
        Ok(namespace) => Ok(namespace.trim().to_string()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(OperatorNamespaceError::NoNamespace),
        Err(e) => Err(e.into()),
    }
}
