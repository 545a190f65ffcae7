//! Policy status reconciler.
//!
//! Watches replicated `Policy` objects on the managed cluster and copies their
//! status onto the same-named `Policy` in the cluster namespace on the hub.
//! Compliance is never computed here, only copied.

use std::sync::Arc;

use async_trait::async_trait;
use cluster_connection::{HubClient, ManagedClient, NamespaceScope};
use controller_manager::scheme::{describe, gvk_of};
use controller_manager::{Manager, RegistrationError, Runnable, Scheme};
use crds::{Policy, PolicyStatus};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::api::events::v1::Event;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event as RecordedEvent, EventType, Recorder};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootstrap::CONTROLLER_NAME;

/// Event reason for status updates
pub const REASON_STATUS_SYNC: &str = "PolicyStatusSync";

/// Result of one reconcile.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The hub status was replaced; carries the hub policy for events
    Updated(ObjectReference),
    /// Hub status already matches
    Unchanged,
    /// The managed policy has no status yet
    NoStatus,
    /// No policy of that name on the hub; it may not be replicated yet
    HubPolicyMissing,
}

/// Whether the hub needs the managed status.
pub fn status_differs(hub: Option<&PolicyStatus>, managed: Option<&PolicyStatus>) -> bool {
    hub != managed
}

/// Merge patch replacing the hub status with `status`.
pub fn status_patch(status: &PolicyStatus) -> Value {
    json!({ "status": status })
}

pub struct PolicyStatusReconciler {
    hub: HubClient,
    hub_recorder: Recorder,
    managed: ManagedClient,
    managed_recorder: Recorder,
    scheme: Arc<Scheme>,
}

impl std::fmt::Debug for PolicyStatusReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStatusReconciler")
            .field("hub", &self.hub)
            .field("managed", &self.managed)
            .finish_non_exhaustive()
    }
}

impl PolicyStatusReconciler {
    pub fn new(
        hub_recorder: Recorder,
        hub: HubClient,
        managed: ManagedClient,
        managed_recorder: Recorder,
        scheme: Arc<Scheme>,
    ) -> Self {
        Self {
            hub,
            hub_recorder,
            managed,
            managed_recorder,
            scheme,
        }
    }

    /// Registers the reconciler with `manager`, watching the manager's scope.
    pub fn setup_with_manager(self, manager: &mut Manager) -> Result<(), RegistrationError> {
        // Events are written on both clusters.
        if !self.scheme.recognizes::<Event>() {
            return Err(RegistrationError::UnknownKind {
                controller: CONTROLLER_NAME.to_string(),
                kind: describe(&gvk_of::<Event>()),
            });
        }

        let scope = manager.scope().clone();
        manager.add_controller::<Policy>(
            CONTROLLER_NAME,
            PolicyStatusController {
                reconciler: self,
                scope,
            },
        )
    }

    /// Copies the status of `policy` to the hub if it differs.
    pub async fn reconcile(&self, policy: &Policy) -> Result<SyncOutcome, kube::Error> {
        let Some(status) = &policy.status else {
            return Ok(SyncOutcome::NoStatus);
        };
        let name = policy.name_any();
        let Some(namespace) = policy.namespace() else {
            return Ok(SyncOutcome::HubPolicyMissing);
        };

        let hub_api: Api<Policy> = self.hub.namespaced(&namespace);
        let Some(hub_policy) = hub_api.get_opt(&name).await? else {
            return Ok(SyncOutcome::HubPolicyMissing);
        };
        if !status_differs(hub_policy.status.as_ref(), Some(status)) {
            return Ok(SyncOutcome::Unchanged);
        }

        let updated = hub_api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(status_patch(status)))
            .await?;
        Ok(SyncOutcome::Updated(updated.object_ref(&())))
    }

    /// Reconciles `policy` and records the result as events.
    async fn handle(&self, policy: &Policy) {
        let key = format!("{}/{}", policy.namespace().unwrap_or_default(), policy.name_any());
        match self.reconcile(policy).await {
            Ok(SyncOutcome::Updated(hub_ref)) => {
                info!("Updated status of policy {} on the hub", key);
                let event = RecordedEvent {
                    type_: EventType::Normal,
                    reason: REASON_STATUS_SYNC.to_string(),
                    note: Some(format!("Policy {} status was updated in the cluster namespace", key)),
                    action: "StatusSync".to_string(),
                    secondary: None,
                };
                if let Err(e) = self.hub_recorder.publish(&event, &hub_ref).await {
                    warn!("Failed to publish event for policy {} on the hub: {}", key, e);
                }
            }
            Ok(SyncOutcome::Unchanged) => debug!("Policy {} status is up to date on the hub", key),
            Ok(SyncOutcome::NoStatus) => debug!("Policy {} has no status yet", key),
            Ok(SyncOutcome::HubPolicyMissing) => debug!("Policy {} not found on the hub, skipping", key),
            Err(e) => {
                error!("Failed to sync status of policy {} to the hub: {}", key, e);
                let event = RecordedEvent {
                    type_: EventType::Warning,
                    reason: REASON_STATUS_SYNC.to_string(),
                    note: Some(format!("Failed to update policy status on the hub: {}", e)),
                    action: "StatusSync".to_string(),
                    secondary: None,
                };
                if let Err(e) = self.managed_recorder.publish(&event, &policy.object_ref(&())).await {
                    warn!("Failed to publish event for policy {}: {}", key, e);
                }
            }
        }
    }
}

/// The watch loop registered with the manager.
struct PolicyStatusController {
    reconciler: PolicyStatusReconciler,
    scope: NamespaceScope,
}

#[async_trait]
impl Runnable for PolicyStatusController {
    async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let apis: Vec<Api<Policy>> = self.scope.apis(&self.reconciler.managed);
        info!("Starting Policy watcher on {} ({} stream(s))", self.scope, apis.len());

        let streams = apis
            .into_iter()
            .map(|api| watcher(api, watcher::Config::default()).default_backoff().boxed());
        let mut events = futures::stream::select_all(streams);

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = events.next() => next,
            };

            match next {
                None => anyhow::bail!("Policy watch streams ended"),
                Some(Err(e)) => warn!("Policy watch error: {}", e),
                Some(Ok(watcher::Event::Apply(policy) | watcher::Event::InitApply(policy))) => {
                    self.reconciler.handle(&policy).await;
                }
                Some(Ok(watcher::Event::Delete(policy))) => {
                    debug!("Policy deleted: {}", policy.name_any());
                }
                Some(Ok(watcher::Event::Init)) => debug!("Policy watcher initializing"),
                Some(Ok(watcher::Event::InitDone)) => info!("Policy watcher initialization complete"),
            }
        }

        info!("Policy watcher stopped");
        Ok(())
    }
}
