//! Cluster namespace provisioning on the managed cluster.

use std::collections::BTreeMap;

use cluster_connection::{ManagedClient, NamespaceScope};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::PostParams;
use tracing::{debug, info};

/// Marks a namespace as holding the policies replicated for this cluster
pub const CLUSTER_NAMESPACE_LABEL: &str = "policy.open-cluster-management.io/isClusterNamespace";

/// Creates every namespace in `scope` that does not exist yet.
///
/// A no-op when watching all namespaces.
pub async fn ensure_namespaces(client: &ManagedClient, scope: &NamespaceScope) -> Result<(), kube::Error> {
    let api = client.all::<Namespace>();
    for name in scope.namespaces() {
        match api.create(&PostParams::default(), &cluster_namespace(name)).await {
            Ok(_) => info!("Created cluster namespace {}", name),
            Err(kube::Error::Api(e)) if e.code == 409 => debug!("Namespace {} already exists", name),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn cluster_namespace(name: &str) -> Namespace {
    let mut namespace = Namespace::default();
    namespace.metadata.name = Some(name.to_string());
    namespace.metadata.labels = Some(BTreeMap::from([(
        CLUSTER_NAMESPACE_LABEL.to_string(),
        "true".to_string(),
    )]));
    namespace
}
