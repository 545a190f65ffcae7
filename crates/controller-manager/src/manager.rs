//! The controller manager.
//!
//! A [`Manager`] is built once from [`ManagerOptions`], collects probes and
//! controllers, then [`Manager::start`] consumes it and runs everything until
//! the shutdown token is cancelled. Because `start` takes `self`, no
//! controller can be registered once the run loop is going.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use cluster_connection::{ClusterClient, ClusterRole, ManagedClient, NamespaceScope};
use kube::Resource;
use kube::runtime::events::{Recorder, Reporter};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BootstrapError, ManagerError, RegistrationError};
use crate::leader_election::{LeaderElectionConfig, LeaderElector};
use crate::probes::{self, Checker, HealthProbes};
use crate::scheme::{self, Scheme};

/// The only accepted metrics bind address: metrics are not served.
pub const METRICS_DISABLED: &str = "0";

/// Everything needed to build a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub scope: NamespaceScope,
    pub scheme: Arc<Scheme>,
    /// `None` runs controllers without leader election
    pub leader_election: Option<LeaderElectionConfig>,
    /// `"0"` disables the probe server
    pub health_probe_bind_address: String,
    pub metrics_bind_address: String,
}

/// A long-running task started by the manager once it leads.
///
/// Implementations return when `shutdown` is cancelled. Returning an error
/// before that stops the whole manager.
#[async_trait]
pub trait Runnable: Send + 'static {
    async fn start(self: Box<Self>, shutdown: CancellationToken) -> anyhow::Result<()>;
}

struct Registered {
    name: String,
    runnable: Box<dyn Runnable>,
}

pub struct Manager {
    client: ManagedClient,
    scope: NamespaceScope,
    scheme: Arc<Scheme>,
    leader_election: Option<LeaderElectionConfig>,
    probe_address: Option<SocketAddr>,
    probes: HealthProbes,
    runnables: Vec<Registered>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("scope", &self.scope)
            .field("leader_election", &self.leader_election)
            .field("probe_address", &self.probe_address)
            .field("probes", &self.probes)
            .field("controllers", &self.controller_names())
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Validates the options and builds a manager on the managed cluster.
    ///
    /// No request is sent to the cluster here.
    pub fn new(client: ManagedClient, options: ManagerOptions) -> Result<Self, BootstrapError> {
        options.scope.validate()?;

        if options.metrics_bind_address != METRICS_DISABLED {
            return Err(BootstrapError::MetricsUnsupported(options.metrics_bind_address));
        }
        let probe_address = probes::parse_bind_address(&options.health_probe_bind_address)?;

        if let Some(config) = &options.leader_election {
            if config.namespace.is_empty() {
                return Err(BootstrapError::LeaderElectionNamespace(format!(
                    "no namespace set for lock {}",
                    config.id
                )));
            }
            info!(
                "Leader election enabled using {} lock {}/{}",
                config.lock, config.namespace, config.id
            );
        } else {
            info!("Leader election disabled");
        }

        if options.scope.is_all_namespaces() {
            info!("Watching all namespaces");
        } else {
            info!("Watching namespaces: {}", options.scope);
        }
        info!("Metrics endpoint disabled");

        Ok(Self {
            client,
            scope: options.scope,
            scheme: options.scheme,
            leader_election: options.leader_election,
            probe_address,
            probes: HealthProbes::new(),
            runnables: Vec::new(),
        })
    }

    pub fn client(&self) -> &ManagedClient {
        &self.client
    }

    pub fn scope(&self) -> &NamespaceScope {
        &self.scope
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    /// Event recorder on the managed cluster reporting as `name`.
    pub fn event_recorder_for(&self, name: &str) -> Recorder {
        event_recorder(&self.client, name)
    }

    pub fn add_healthz_check(&mut self, name: &str, checker: impl Checker + 'static) -> Result<(), BootstrapError> {
        self.probes.add_healthz(name, checker)
    }

    pub fn add_readyz_check(&mut self, name: &str, checker: impl Checker + 'static) -> Result<(), BootstrapError> {
        self.probes.add_readyz(name, checker)
    }

    /// Registers a controller whose primary watched kind is `K`.
    ///
    /// `K` must be in the scheme and `name` must be unique.
    pub fn add_controller<K>(&mut self, name: &str, runnable: impl Runnable) -> Result<(), RegistrationError>
    where
        K: Resource<DynamicType = ()>,
    {
        if !self.scheme.recognizes::<K>() {
            return Err(RegistrationError::UnknownKind {
                controller: name.to_string(),
                kind: scheme::describe(&scheme::gvk_of::<K>()),
            });
        }
        if self.runnables.iter().any(|r| r.name == name) {
            return Err(RegistrationError::DuplicateController(name.to_string()));
        }

        debug!("Registered controller {}", name);
        self.runnables.push(Registered {
            name: name.to_string(),
            runnable: Box::new(runnable),
        });
        Ok(())
    }

    pub fn controller_names(&self) -> Vec<&str> {
        self.runnables.iter().map(|r| r.name.as_str()).collect()
    }

    /// Runs the manager until `shutdown` is cancelled or something fails.
    ///
    /// 1. Starts the probe server
    /// 2. Waits for leadership, if enabled
    /// 3. Starts every controller
    /// 4. On shutdown, leadership loss or a controller error, stops the
    ///    controllers, waits for them and releases the lock
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), ManagerError> {
        let Self {
            client,
            leader_election,
            probe_address,
            probes: health_probes,
            runnables,
            ..
        } = self;

        let stop = shutdown.child_token();
        let mut tasks: JoinSet<Result<(), ManagerError>> = JoinSet::new();

        match probe_address {
            Some(addr) => {
                let listener = probes::bind(addr).await.map_err(ManagerError::ProbeServer)?;
                tasks.spawn(probes::serve(listener, Arc::new(health_probes), stop.clone()));
            }
            None => info!("Health probe server disabled"),
        }

        let elector = leader_election.map(|config| {
            let lock = config.resource_lock(&client);
            LeaderElector::new(lock, config)
        });

        if let Some(elector) = &elector {
            if !elector.acquire(&shutdown).await {
                info!("Shutdown requested before leadership was acquired");
                stop.cancel();
                drain(&mut tasks).await;
                return Ok(());
            }
        }

        for Registered { name, runnable } in runnables {
            info!("Starting controller {}", name);
            let token = stop.clone();
            tasks.spawn(async move {
                runnable
                    .start(token)
                    .await
                    .map_err(|source| ManagerError::Runnable { name, source })
            });
        }

        let outcome = {
            let leadership = async {
                match &elector {
                    Some(elector) => elector.hold(&shutdown).await,
                    None => {
                        shutdown.cancelled().await;
                        Ok(())
                    }
                }
            };
            tokio::pin!(leadership);

            loop {
                tokio::select! {
                    result = &mut leadership => break result,
                    Some(joined) = tasks.join_next() => {
                        if let Err(e) = flatten(joined) {
                            break Err(e);
                        }
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => info!("Stopping controllers"),
            Err(e) => error!("Stopping controllers: {}", e),
        }
        stop.cancel();
        drain(&mut tasks).await;

        if let Some(elector) = &elector {
            if let Err(e) = elector.release().await {
                warn!("Failed to release leader lease: {}", e);
            }
        }

        outcome
    }
}

/// Event recorder on `client`'s cluster reporting as `name`.
pub fn event_recorder<R: ClusterRole>(client: &ClusterClient<R>, name: &str) -> Recorder {
    let reporter = Reporter {
        controller: name.to_string(),
        instance: std::env::var("POD_NAME").ok(),
    };
    Recorder::new(client.raw().clone(), reporter)
}

fn flatten(joined: Result<Result<(), ManagerError>, JoinError>) -> Result<(), ManagerError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(ManagerError::Panicked(e.to_string())),
    }
}

async fn drain(tasks: &mut JoinSet<Result<(), ManagerError>>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = flatten(joined) {
            warn!("Error while stopping: {}", e);
        }
    }
}
