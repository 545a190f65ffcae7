//! Manager bootstrap and controller registration.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use addon_lease::ConfigChecker;
use cluster_connection::{HubConnection, ManagedConnection, NamespaceScope, OperatorNamespaceError};
use controller_manager::manager::{METRICS_DISABLED, event_recorder};
use controller_manager::{
    BootstrapError, LeaderElectionConfig, LockKind, Manager, ManagerOptions, Ping, RegistrationError, Scheme,
};
use crds::Policy;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::api::events::v1::Event;
use tracing::info;

use crate::config::BootstrapOptions;
use crate::error::ControllerError;
use crate::reconciler::PolicyStatusReconciler;

/// Name of the leader election lock
pub const LEADER_ELECTION_ID: &str = "policy-status-sync.open-cluster-management.io";
/// Controller name, also the event reporting component
pub const CONTROLLER_NAME: &str = "policy-status-sync";

/// Every kind this process reads or writes.
pub fn build_scheme() -> Scheme {
    Scheme::new()
        .with::<Policy>()
        .with::<Lease>()
        .with::<ConfigMap>()
        .with::<Pod>()
        .with::<Namespace>()
        .with::<Event>()
}

/// Leader election settings, or `None` when disabled.
///
/// `operator_namespace` is only awaited when no lock namespace was configured.
pub async fn leader_election_config(
    options: &BootstrapOptions,
    operator_namespace: impl Future<Output = Result<String, OperatorNamespaceError>>,
) -> Result<Option<LeaderElectionConfig>, BootstrapError> {
    if !options.leader_election {
        return Ok(None);
    }

    let namespace = match &options.leader_election_namespace {
        Some(namespace) => namespace.clone(),
        None => operator_namespace
            .await
            .map_err(|e| BootstrapError::LeaderElectionNamespace(e.to_string()))?,
    };
    let lock = if options.legacy_leader_election {
        LockKind::ConfigMap
    } else {
        LockKind::Lease
    };

    Ok(Some(LeaderElectionConfig::new(LEADER_ELECTION_ID, &namespace, lock)))
}

pub fn manager_options(
    options: &BootstrapOptions,
    scope: NamespaceScope,
    scheme: Arc<Scheme>,
    leader_election: Option<LeaderElectionConfig>,
) -> ManagerOptions {
    ManagerOptions {
        scope,
        scheme,
        leader_election,
        health_probe_bind_address: options.probe_addr.clone(),
        metrics_bind_address: METRICS_DISABLED.to_string(),
    }
}

/// Builds the manager on the managed cluster with its probes registered.
///
/// `healthz` fails once the hub kubeconfig changes; `readyz` always passes.
pub async fn bootstrap_manager(
    options: &BootstrapOptions,
    scope: NamespaceScope,
    scheme: Arc<Scheme>,
    managed: &ManagedConnection,
    hub: &HubConnection,
) -> Result<Manager, ControllerError> {
    let leader_election = leader_election_config(options, cluster_connection::operator_namespace()).await?;
    let mut manager = Manager::new(
        managed.client().clone(),
        manager_options(options, scope, scheme, leader_election),
    )?;

    let checker = ConfigChecker::new(CONTROLLER_NAME, hub.kubeconfig_path().map(Path::to_path_buf)).await?;
    manager.add_healthz_check("healthz", checker)?;
    manager.add_readyz_check("readyz", Ping)?;

    Ok(manager)
}

/// Attaches the policy status reconciler to `manager`.
pub fn register_reconciler(manager: &mut Manager, hub: &HubConnection) -> Result<(), RegistrationError> {
    let hub_client = hub.client().clone();
    let reconciler = PolicyStatusReconciler::new(
        event_recorder(&hub_client, CONTROLLER_NAME),
        hub_client,
        manager.client().clone(),
        manager.event_recorder_for(CONTROLLER_NAME),
        Arc::clone(manager.scheme()),
    );
    reconciler.setup_with_manager(manager)?;
    info!("Registered controller {}", CONTROLLER_NAME);
    Ok(())
}
