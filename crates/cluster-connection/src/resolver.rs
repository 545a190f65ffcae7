//! Kubeconfig resolution for the hub and managed clusters.
//!
//! Resolution order for each cluster:
//! 1. explicit path argument
//! 2. environment variable (`HUB_CONFIG` / `MANAGED_CONFIG`)
//! 3. managed cluster only: ambient discovery (in-cluster service account or
//!    the default local kubeconfig)
//!
//! Configs are parsed eagerly so a broken kubeconfig fails startup, but no
//! request is sent to either API server here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kube::Config;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::connection::{ClusterConnection, ClusterRole, ConfigSource, HubConnection, ManagedConnection};
use crate::error::ConnectionError;

/// Environment variable holding the hub kubeconfig path
pub const HUB_CONFIG_ENV: &str = "HUB_CONFIG";
/// Environment variable holding the managed kubeconfig path
pub const MANAGED_CONFIG_ENV: &str = "MANAGED_CONFIG";
/// Standard kubeconfig path list consulted by ambient discovery
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// Source of environment variables.
///
/// Lets tests drive resolution without touching the process environment.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Picks the config source for one cluster.
///
/// Empty strings count as unset. Returns `None` only when nothing is
/// configured and ambient discovery is not allowed.
pub fn select_source(
    explicit: Option<&Path>,
    env_var: &'static str,
    env: &impl EnvSource,
    allow_ambient: bool,
) -> Option<ConfigSource> {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return Some(ConfigSource::Explicit(path.to_path_buf()));
    }

    if let Some(value) = env.var(env_var).filter(|v| !v.is_empty()) {
        info!("Found ENV {}, initializing using {}", env_var, value);
        return Some(ConfigSource::Environment {
            var: env_var,
            path: PathBuf::from(value),
        });
    }

    allow_ambient.then_some(ConfigSource::Ambient)
}

/// Loads and parses the config for a source.
///
/// Ambient discovery honours `KUBECONFIG` from `env` (a path list, merged in
/// order) and otherwise falls back to in-cluster or default config inference.
pub async fn load_config(source: &ConfigSource, env: &impl EnvSource) -> Result<Config, ConnectionError> {
    let (path, kubeconfig) = match source.path() {
        Some(path) => (path.to_path_buf(), read_kubeconfig(path).await?),
        None => match env.var(KUBECONFIG_ENV).filter(|v| !v.is_empty()) {
            Some(paths) => merge_kubeconfigs(&paths).await?,
            None => return Ok(Config::infer().await?),
        },
    };
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|source| ConnectionError::Kubeconfig { path, source })
}

/// Reads one kubeconfig file off the runtime threads.
///
/// `Kubeconfig::read_from` also rewrites relative certificate paths against
/// the file's directory, which the hub kubeconfig secret relies on.
async fn read_kubeconfig(path: &Path) -> Result<Kubeconfig, ConnectionError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || Kubeconfig::read_from(owned))
        .await?
        .map_err(|source| ConnectionError::Kubeconfig {
            path: path.to_path_buf(),
            source,
        })
}

/// Reads every file in a `KUBECONFIG` path list and merges them in order.
async fn merge_kubeconfigs(paths: &str) -> Result<(PathBuf, Kubeconfig), ConnectionError> {
    let mut merged: Option<(PathBuf, Kubeconfig)> = None;
    for path in std::env::split_paths(paths).filter(|p| !p.as_os_str().is_empty()) {
        let next = read_kubeconfig(&path).await?;
        merged = Some(match merged {
            None => (path, next),
            Some((first, current)) => {
                let combined = current
                    .merge(next)
                    .map_err(|source| ConnectionError::Kubeconfig { path, source })?;
                (first, combined)
            }
        });
    }
    merged.ok_or(ConnectionError::EmptyKubeconfigList)
}

/// Resolves the hub and managed cluster connections.
#[derive(Debug, Clone)]
pub struct ConnectionResolver<E = ProcessEnv> {
    hub_config: Option<PathBuf>,
    managed_config: Option<PathBuf>,
    env: E,
}

impl ConnectionResolver<ProcessEnv> {
    /// Creates a resolver reading fallbacks from the process environment.
    pub fn new(hub_config: Option<PathBuf>, managed_config: Option<PathBuf>) -> Self {
        Self {
            hub_config,
            managed_config,
            env: ProcessEnv,
        }
    }
}

impl<E: EnvSource> ConnectionResolver<E> {
    /// Replaces the environment lookup.
    pub fn with_env<F: EnvSource>(self, env: F) -> ConnectionResolver<F> {
        ConnectionResolver {
            hub_config: self.hub_config,
            managed_config: self.managed_config,
            env,
        }
    }

    /// Config source for the hub. The hub has no ambient fallback.
    pub fn hub_source(&self) -> Result<ConfigSource, ConnectionError> {
        select_source(self.hub_config.as_deref(), HUB_CONFIG_ENV, &self.env, false)
            .ok_or(ConnectionError::MissingHubConfig)
    }

    /// Config source for the managed cluster, falling back to ambient discovery.
    pub fn managed_source(&self) -> ConfigSource {
        select_source(self.managed_config.as_deref(), MANAGED_CONFIG_ENV, &self.env, true)
            .unwrap_or(ConfigSource::Ambient)
    }

    /// Resolves both connections. Either failing is fatal.
    pub async fn resolve(&self) -> Result<(HubConnection, ManagedConnection), ConnectionError> {
        let hub = connect(self.hub_source()?, &self.env).await?;
        let managed = connect(self.managed_source(), &self.env).await?;
        Ok((hub, managed))
    }
}

async fn connect<R: ClusterRole>(
    source: ConfigSource,
    env: &impl EnvSource,
) -> Result<ClusterConnection<R>, ConnectionError> {
    let config = load_config(&source, env).await?;
    info!("Using {} cluster at {} ({})", R::NAME, config.cluster_url, source);
    ClusterConnection::from_config(source, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: hub
  cluster:
    server: https://hub.example.com:6443
    insecure-skip-tls-verify: true
contexts:
- name: hub
  context:
    cluster: hub
    user: status-sync
current-context: hub
users:
- name: status-sync
  user:
    token: not-a-real-token
"#;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn write_temp(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("kubeconfig-{}", uuid::Uuid::new_v4()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_explicit_path_wins_over_env() {
        let vars = env(&[(HUB_CONFIG_ENV, "/from/env")]);
        let source = select_source(Some(Path::new("/from/flag")), HUB_CONFIG_ENV, &vars, false);
        assert_eq!(source, Some(ConfigSource::Explicit(PathBuf::from("/from/flag"))));
    }

    #[test]
    fn test_env_used_when_no_explicit_path() {
        let vars = env(&[(MANAGED_CONFIG_ENV, "/from/env")]);
        let source = select_source(None, MANAGED_CONFIG_ENV, &vars, true);
        assert_eq!(
            source,
            Some(ConfigSource::Environment {
                var: MANAGED_CONFIG_ENV,
                path: PathBuf::from("/from/env"),
            })
        );
    }

    #[test]
    fn test_empty_values_count_as_unset() {
        let vars = env(&[(MANAGED_CONFIG_ENV, "")]);
        let source = select_source(Some(Path::new("")), MANAGED_CONFIG_ENV, &vars, true);
        assert_eq!(source, Some(ConfigSource::Ambient));
    }

    #[test]
    fn test_hub_has_no_ambient_fallback() {
        let resolver = ConnectionResolver::new(None, None).with_env(env(&[]));
        assert!(matches!(resolver.hub_source(), Err(ConnectionError::MissingHubConfig)));
    }

    #[test]
    fn test_managed_falls_back_to_ambient() {
        let resolver =
            ConnectionResolver::new(Some(PathBuf::from("/etc/hub/kubeconfig")), None).with_env(env(&[]));
        assert_eq!(
            resolver.hub_source().unwrap(),
            ConfigSource::Explicit(PathBuf::from("/etc/hub/kubeconfig"))
        );
        assert_eq!(resolver.managed_source(), ConfigSource::Ambient);
    }

    #[test]
    fn test_explicit_managed_path_is_honoured() {
        let resolver = ConnectionResolver::new(
            Some(PathBuf::from("/etc/hub/kubeconfig")),
            Some(PathBuf::from("/etc/managed/kubeconfig")),
        )
        .with_env(env(&[(MANAGED_CONFIG_ENV, "/ignored")]));
        assert_eq!(
            resolver.managed_source(),
            ConfigSource::Explicit(PathBuf::from("/etc/managed/kubeconfig"))
        );
    }

    #[tokio::test]
    async fn test_load_config_from_kubeconfig_file() {
        let path = write_temp(KUBECONFIG);
        let config = load_config(&ConfigSource::Explicit(path.clone()), &env(&[])).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("hub.example.com"));
        fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_malformed_kubeconfig_is_an_error() {
        let path = write_temp("clusters: [this is not: a kubeconfig");
        let result = load_config(&ConfigSource::Explicit(path.clone()), &env(&[])).await;
        assert!(matches!(result, Err(ConnectionError::Kubeconfig { .. })));
        fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_is_an_error() {
        let path = std::env::temp_dir().join(format!("missing-{}", uuid::Uuid::new_v4()));
        let result = load_config(&ConfigSource::Explicit(path), &env(&[])).await;
        assert!(matches!(result, Err(ConnectionError::Kubeconfig { .. })));
    }

    #[tokio::test]
    async fn test_resolve_both_from_files() {
        crate::install_default_crypto_provider();
        let hub_path = write_temp(KUBECONFIG);
        let managed_path = write_temp(&KUBECONFIG.replace("hub.example.com", "managed.example.com"));

        let resolver = ConnectionResolver::new(None, None).with_env(env(&[
            (HUB_CONFIG_ENV, hub_path.to_str().unwrap()),
            (MANAGED_CONFIG_ENV, managed_path.to_str().unwrap()),
        ]));
        let (hub, managed) = resolver.resolve().await.unwrap();

        assert_eq!(hub.config().cluster_url.host(), Some("hub.example.com"));
        assert_eq!(managed.config().cluster_url.host(), Some("managed.example.com"));
        assert_eq!(hub.kubeconfig_path(), Some(hub_path.as_path()));
        assert_eq!(hub.client().role(), "hub");
        assert_eq!(managed.client().role(), "managed");

        fs::remove_file(hub_path).unwrap();
        fs::remove_file(managed_path).unwrap();
    }

    #[tokio::test]
    async fn test_resolve_managed_from_ambient_kubeconfig() {
        crate::install_default_crypto_provider();
        let hub_path = write_temp(KUBECONFIG);
        let managed_path = write_temp(&KUBECONFIG.replace("hub.example.com", "managed.example.com"));

        let resolver = ConnectionResolver::new(Some(hub_path.clone()), None).with_env(env(&[
            (MANAGED_CONFIG_ENV, ""),
            (KUBECONFIG_ENV, managed_path.to_str().unwrap()),
        ]));
        let (hub, managed) = resolver.resolve().await.unwrap();

        assert_eq!(hub.config().cluster_url.host(), Some("hub.example.com"));
        assert_eq!(managed.source(), &ConfigSource::Ambient);
        assert_eq!(managed.config().cluster_url.host(), Some("managed.example.com"));
        assert_eq!(managed.kubeconfig_path(), None);

        fs::remove_file(hub_path).unwrap();
        fs::remove_file(managed_path).unwrap();
    }

    #[tokio::test]
    async fn test_ambient_kubeconfig_list_uses_first_context() {
        let first = write_temp(&KUBECONFIG.replace("hub.example.com", "managed.example.com"));
        let second = write_temp(
            &KUBECONFIG
                .replace("name: hub", "name: other")
                .replace("cluster: hub", "cluster: other")
                .replace("current-context: hub", "current-context: other"),
        );
        let list = std::env::join_paths([&first, &second]).unwrap();

        let vars = env(&[(KUBECONFIG_ENV, list.to_str().unwrap())]);
        let config = load_config(&ConfigSource::Ambient, &vars).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("managed.example.com"));

        fs::remove_file(first).unwrap();
        fs::remove_file(second).unwrap();
    }
}
