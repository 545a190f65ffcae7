//! Command line and environment configuration.

use std::path::PathBuf;

use clap::Parser;

/// Synchronizes policy status from a managed cluster to the hub cluster.
#[derive(Debug, Clone, Parser)]
#[command(name = "policy-status-sync", version, about)]
pub struct Options {
    /// Kubeconfig for the hub cluster. Falls back to HUB_CONFIG.
    #[arg(long = "hub-cluster-configfile")]
    pub hub_config: Option<PathBuf>,

    /// Kubeconfig for the managed cluster. Falls back to MANAGED_CONFIG, then
    /// to the in-cluster config.
    #[arg(long = "managed-cluster-configfile")]
    pub managed_config: Option<PathBuf>,

    /// Namespace(s) to watch, comma separated. Empty watches all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: String,

    /// Address the health probe endpoints bind to. "0" disables them.
    #[arg(long = "health-probe-bind-address", default_value = ":8081")]
    pub probe_addr: String,

    /// Ensure there is only one active controller manager.
    #[arg(
        long = "leader-elect",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    pub enable_leader_election: bool,

    /// Use a ConfigMap lock for leader election instead of a Lease.
    #[arg(long = "legacy-leader-elect", default_value_t = false)]
    pub legacy_leader_election: bool,

    /// Namespace of the leader election lock. Defaults to the pod's namespace.
    #[arg(long)]
    pub leader_election_namespace: Option<String>,

    /// Report addon health to the hub through a lease.
    #[arg(long = "enable-lease", default_value_t = false)]
    pub enable_lease: bool,

    /// Log filter, e.g. "info" or "policy_status_sync=debug".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,
}

/// The subset of [`Options`] that shapes the manager and the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    pub leader_election: bool,
    pub legacy_leader_election: bool,
    pub leader_election_namespace: Option<String>,
    pub probe_addr: String,
    pub enable_lease: bool,
}

impl Options {
    pub fn bootstrap(&self) -> BootstrapOptions {
        BootstrapOptions {
            leader_election: self.enable_leader_election,
            legacy_leader_election: self.legacy_leader_election,
            leader_election_namespace: self.leader_election_namespace.clone().filter(|ns| !ns.is_empty()),
            probe_addr: self.probe_addr.clone(),
            enable_lease: self.enable_lease,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("policy-status-sync").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = parse(&["--watch-namespace", "cluster1"]);
        assert_eq!(options.watch_namespace, "cluster1");
        assert_eq!(options.hub_config, None);

        let bootstrap = options.bootstrap();
        assert!(bootstrap.leader_election);
        assert!(!bootstrap.legacy_leader_election);
        assert!(!bootstrap.enable_lease);
        assert_eq!(bootstrap.probe_addr, ":8081");
        assert_eq!(bootstrap.leader_election_namespace, None);
    }

    #[test]
    fn test_flags() {
        let options = parse(&[
            "--watch-namespace",
            "ns1,ns2",
            "--hub-cluster-configfile",
            "/var/run/klusterlet/kubeconfig",
            "--leader-elect=false",
            "--legacy-leader-elect",
            "--enable-lease",
            "--health-probe-bind-address",
            "0",
            "--leader-election-namespace",
            "",
        ]);

        assert_eq!(options.hub_config, Some(PathBuf::from("/var/run/klusterlet/kubeconfig")));
        let bootstrap = options.bootstrap();
        assert!(!bootstrap.leader_election);
        assert!(bootstrap.legacy_leader_election);
        assert!(bootstrap.enable_lease);
        assert_eq!(bootstrap.probe_addr, "0");
        assert_eq!(bootstrap.leader_election_namespace, None, "Empty namespace means unset");
    }

    #[test]
    fn test_bare_leader_elect_flag() {
        assert!(parse(&["--watch-namespace", "", "--leader-elect"]).enable_leader_election);
    }
}
