//! Health predicates evaluated on every heartbeat tick.

use async_trait::async_trait;
use cluster_connection::ManagedClient;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::error::HeartbeatError;

/// A named, side-effect free health check.
#[async_trait]
pub trait HealthPredicate: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(true)` when healthy. Errors count as unhealthy.
    async fn evaluate(&self) -> Result<bool, HeartbeatError>;
}

/// Healthy while at least one pod matching `selector` in `namespace` is
/// running and ready.
pub struct AddonPodCheck {
    name: String,
    api: Api<Pod>,
    selector: String,
}

impl AddonPodCheck {
    pub fn new(client: &ManagedClient, namespace: &str, selector: &str) -> Self {
        Self {
            name: format!("{}/{}", namespace, selector),
            api: client.namespaced(namespace),
            selector: selector.to_string(),
        }
    }
}

impl std::fmt::Debug for AddonPodCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonPodCheck").field("name", &self.name).finish()
    }
}

#[async_trait]
impl HealthPredicate for AddonPodCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self) -> Result<bool, HeartbeatError> {
        let pods = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await
            .map_err(|e| HeartbeatError::Evaluation {
                name: self.name.clone(),
                source: Box::new(e),
            })?;

        let ready = pods_ready(&pods.items);
        debug!("{} pods match {}, ready: {}", pods.items.len(), self.name, ready);
        Ok(ready)
    }
}

/// At least one pod is running and ready.
pub fn pods_ready(pods: &[Pod]) -> bool {
    pods.iter().any(pod_ready)
}

/// Phase `Running` with condition `Ready=True`.
pub fn pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .as_ref()
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}
