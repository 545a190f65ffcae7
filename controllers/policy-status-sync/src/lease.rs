//! Addon lease heartbeat startup.

use std::future::Future;

use addon_lease::{
    AddonPodCheck, HeartbeatHandle, HubLeaseStore, LeaseHeartbeat, LeaseStore, ManagedLeaseStore,
};
use cluster_connection::{HubClient, ManagedClient, NamespaceScope, OperatorNamespaceError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BootstrapOptions;

/// Addon pods whose health the lease reports
pub const ADDON_POD_SELECTORS: [&str; 2] = ["app=policy-framework", "app=policy-config-policy"];

/// Where the heartbeat reads health from and writes the leases to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPlan {
    /// Namespace of the addon pods and of the managed cluster lease
    pub operator_namespace: String,
    /// Cluster namespace on the hub holding the hub copy of the lease
    pub hub_namespace: Option<String>,
}

impl HeartbeatPlan {
    /// The heartbeat with one pod check per addon selector.
    ///
    /// The managed lease is written first, then the hub lease if there is a
    /// hub namespace.
    pub fn heartbeat(
        &self,
        managed: &ManagedClient,
        managed_store: impl LeaseStore + 'static,
        hub_store: impl LeaseStore + 'static,
    ) -> LeaseHeartbeat {
        let mut heartbeat = LeaseHeartbeat::new(&self.operator_namespace, managed_store);
        if let Some(hub_namespace) = &self.hub_namespace {
            heartbeat = heartbeat.with_store(hub_namespace, hub_store);
        }
        ADDON_POD_SELECTORS.iter().fold(heartbeat, |heartbeat, selector| {
            heartbeat.with_predicate(AddonPodCheck::new(managed, &self.operator_namespace, selector))
        })
    }
}

/// Decides whether the heartbeat runs and where it writes.
///
/// Returns `None` when leases are disabled or the process runs outside a
/// cluster. A scope that does not name exactly one cluster namespace leaves
/// only the managed cluster lease. `operator_namespace` is only awaited when
/// leases are enabled.
pub async fn plan_heartbeat(
    enabled: bool,
    scope: &NamespaceScope,
    operator_namespace: impl Future<Output = Result<String, OperatorNamespaceError>>,
) -> Result<Option<HeartbeatPlan>, OperatorNamespaceError> {
    if !enabled {
        return Ok(None);
    }

    let operator_namespace = match operator_namespace.await {
        Ok(namespace) => namespace,
        Err(e) if e.is_not_in_cluster() => {
            info!("Skipping lease; not running in a cluster.");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let hub_namespace = scope.single().map(str::to_string);
    if hub_namespace.is_none() {
        warn!(
            "Not writing the hub lease; it needs a single cluster namespace but the watch scope is {}",
            scope
        );
    }

    Ok(Some(HeartbeatPlan {
        operator_namespace,
        hub_namespace,
    }))
}

/// Starts the heartbeat if enabled. It stops when `shutdown` is cancelled.
pub async fn start_lease_heartbeat(
    options: &BootstrapOptions,
    hub: &HubClient,
    managed: &ManagedClient,
    scope: &NamespaceScope,
    shutdown: &CancellationToken,
) -> Result<Option<HeartbeatHandle>, OperatorNamespaceError> {
    let plan = plan_heartbeat(options.enable_lease, scope, cluster_connection::operator_namespace()).await?;
    Ok(plan.map(|plan| {
        plan.heartbeat(
            managed,
            ManagedLeaseStore::new(managed.clone()),
            HubLeaseStore::new(hub.clone()),
        )
        .spawn(shutdown)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_lease::mock::MockLeaseStore;
    use std::future::ready;

    fn in_cluster() -> std::future::Ready<Result<String, OperatorNamespaceError>> {
        ready(Ok("open-cluster-management-agent-addon".to_string()))
    }

    fn managed() -> ManagedClient {
        let mut config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        config.accept_invalid_certs = true;
        ManagedClient::from_client(kube::Client::try_from(config).unwrap())
    }

    #[tokio::test]
    async fn test_disabled_lease_never_starts() {
        let plan = plan_heartbeat(false, &NamespaceScope::parse("cluster1"), in_cluster())
            .await
            .unwrap();
        assert_eq!(plan, None);
    }

    #[tokio::test]
    async fn test_not_in_cluster_skips_without_error() {
        let scope = NamespaceScope::parse("cluster1");
        let plan = plan_heartbeat(true, &scope, ready(Err(OperatorNamespaceError::NoNamespace)))
            .await
            .unwrap();
        assert_eq!(plan, None);

        let plan = plan_heartbeat(true, &scope, ready(Err(OperatorNamespaceError::RunLocal)))
            .await
            .unwrap();
        assert_eq!(plan, None);
    }

    #[tokio::test]
    async fn test_namespace_read_error_is_fatal() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let result = plan_heartbeat(
            true,
            &NamespaceScope::parse("cluster1"),
            ready(Err(OperatorNamespaceError::Io(err))),
        )
        .await;
        assert!(matches!(result, Err(OperatorNamespaceError::Io(_))));
    }

    #[tokio::test]
    async fn test_non_single_scope_keeps_managed_lease() {
        for scope in [NamespaceScope::parse("ns1,ns2"), NamespaceScope::all()] {
            let plan = plan_heartbeat(true, &scope, in_cluster()).await.unwrap().unwrap();
            assert_eq!(plan.operator_namespace, "open-cluster-management-agent-addon");
            assert_eq!(plan.hub_namespace, None, "scope {scope}");

            let heartbeat = plan.heartbeat(&managed(), MockLeaseStore::new(), MockLeaseStore::new());
            assert_eq!(
                heartbeat.lease_keys(),
                vec!["open-cluster-management-agent-addon/policy-controller"]
            );
        }
    }

    #[tokio::test]
    async fn test_plan_builds_heartbeat_with_addon_checks() {
        let plan = plan_heartbeat(true, &NamespaceScope::parse("cluster1"), in_cluster())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.hub_namespace.as_deref(), Some("cluster1"));
        assert_eq!(plan.operator_namespace, "open-cluster-management-agent-addon");

        let heartbeat = plan.heartbeat(&managed(), MockLeaseStore::new(), MockLeaseStore::new());
        assert_eq!(
            heartbeat.lease_keys(),
            vec![
                "open-cluster-management-agent-addon/policy-controller",
                "cluster1/policy-controller",
            ]
        );
        assert_eq!(
            heartbeat.predicate_names(),
            vec![
                "open-cluster-management-agent-addon/app=policy-framework",
                "open-cluster-management-agent-addon/app=policy-config-policy",
            ]
        );
    }
}
