//! Role-tagged cluster connections.
//!
//! The hub and managed clusters are both reached through a `kube::Client`,
//! which makes it easy to write to the wrong one. Every handle here carries a
//! zero-sized role marker so that mix-ups fail to compile.

use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Config, Resource};

use crate::error::ConnectionError;

/// Marker trait for the two cluster roles.
pub trait ClusterRole: Send + Sync + 'static {
    /// Human readable role name used in logs and errors
    const NAME: &'static str;
}

/// The central hub cluster.
#[derive(Debug, Clone, Copy)]
pub enum Hub {}

/// The managed (spoke) cluster this controller runs on.
#[derive(Debug, Clone, Copy)]
pub enum Managed {}

impl ClusterRole for Hub {
    const NAME: &'static str = "hub";
}

impl ClusterRole for Managed {
    const NAME: &'static str = "managed";
}

/// Where a cluster config was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Path passed on the command line
    Explicit(PathBuf),
    /// Path taken from an environment variable
    Environment { var: &'static str, path: PathBuf },
    /// In-cluster service account or the default local kubeconfig
    Ambient,
}

impl ConfigSource {
    /// The kubeconfig file backing this source, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(path) | Self::Environment { path, .. } => Some(path),
            Self::Ambient => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(path) => write!(f, "{}", path.display()),
            Self::Environment { var, path } => write!(f, "{} (from {})", path.display(), var),
            Self::Ambient => f.write_str("ambient cluster config"),
        }
    }
}

/// A `kube::Client` bound to one cluster role.
///
/// Cloning is cheap; clones share the underlying connection pool.
pub struct ClusterClient<R> {
    client: Client,
    role: PhantomData<fn() -> R>,
}

/// Client for the hub cluster
pub type HubClient = ClusterClient<Hub>;
/// Client for the managed cluster
pub type ManagedClient = ClusterClient<Managed>;

impl<R: ClusterRole> ClusterClient<R> {
    /// Tags an existing client with this role.
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            role: PhantomData,
        }
    }

    /// Role name of this client ("hub" or "managed").
    pub fn role(&self) -> &'static str {
        R::NAME
    }

    /// Namespaced API handle for `K` on this cluster.
    pub fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Cluster-wide API handle for `K` on this cluster.
    pub fn all<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }

    /// The untagged client, for APIs that take a plain `kube::Client`.
    pub fn raw(&self) -> &Client {
        &self.client
    }
}

impl<R> Clone for ClusterClient<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            role: PhantomData,
        }
    }
}

impl<R: ClusterRole> fmt::Debug for ClusterClient<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("role", &R::NAME)
            .finish_non_exhaustive()
    }
}

/// A resolved connection to one cluster: where the config came from, the
/// parsed config and a client built from it.
///
/// Built once at startup and never mutated.
pub struct ClusterConnection<R> {
    source: ConfigSource,
    config: Config,
    client: ClusterClient<R>,
}

/// Connection to the hub cluster
pub type HubConnection = ClusterConnection<Hub>;
/// Connection to the managed cluster
pub type ManagedConnection = ClusterConnection<Managed>;

impl<R: ClusterRole> ClusterConnection<R> {
    /// Builds the client for a parsed config.
    ///
    /// No request is sent; the client connects on first use.
    pub fn from_config(source: ConfigSource, config: Config) -> Result<Self, ConnectionError> {
        let client = Client::try_from(config.clone()).map_err(|source| ConnectionError::Client {
            role: R::NAME,
            source,
        })?;
        Ok(Self {
            source,
            config,
            client: ClusterClient::from_client(client),
        })
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &ClusterClient<R> {
        &self.client
    }

    /// Kubeconfig file backing this connection, if it did not come from
    /// ambient discovery.
    pub fn kubeconfig_path(&self) -> Option<&Path> {
        self.source.path()
    }
}

impl<R: ClusterRole> fmt::Debug for ClusterConnection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("role", &R::NAME)
            .field("source", &self.source)
            .field("cluster_url", &self.config.cluster_url)
            .finish_non_exhaustive()
    }
}
