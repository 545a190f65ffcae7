//! Cluster Connections
//!
//! Connection plumbing for a controller that talks to two Kubernetes clusters
//! at once: the central hub cluster and the managed (spoke) cluster it runs on.
//!
//! - [`ConnectionResolver`] resolves both kubeconfigs from explicit paths,
//!   environment variables or ambient discovery
//! - [`ClusterClient`] is a role-tagged client, so a [`HubClient`] can never be
//!   handed to code that expects a [`ManagedClient`]
//! - [`NamespaceScope`] turns a `WATCH_NAMESPACE` style string into a single or
//!   multi-namespace watch scope
//! - [`operator_namespace`] finds the namespace the controller pod runs in

pub mod connection;
pub mod error;
pub mod operator;
pub mod resolver;
pub mod scope;

pub use connection::*;
pub use error::*;
pub use operator::*;
pub use resolver::*;
pub use scope::*;

/// Installs the `ring` rustls crypto provider as the process default.
///
/// Must run before the first client is built. Calling it again is harmless.
pub fn install_default_crypto_provider() {
    // Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}
