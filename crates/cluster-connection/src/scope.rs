//! Watch namespace scope.
//!
//! A `WATCH_NAMESPACE` value is either a single namespace (the empty string
//! meaning all namespaces) or a comma-separated list. A list gets one watch per
//! namespace, so memory use and API server load grow with its length.

use std::collections::BTreeSet;
use std::fmt;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Resource};
use tracing::warn;

use crate::connection::{ClusterClient, ClusterRole};
use crate::error::ScopeError;

/// Separator between namespaces in a multi-namespace specification
pub const NAMESPACE_SEPARATOR: char = ',';

const MAX_NAMESPACE_LEN: usize = 63;

/// The set of namespaces the controller watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    /// One namespace, or every namespace when empty
    Single(String),
    /// Several namespaces, each with its own watch. Never empty and never
    /// contains an empty name.
    Multi(BTreeSet<String>),
}

impl NamespaceScope {
    /// Parses a raw watch namespace specification.
    ///
    /// Never fails: a list made only of separators falls back to all
    /// namespaces. Use [`NamespaceScope::validate`] to reject malformed names.
    pub fn parse(raw: &str) -> Self {
        if !raw.contains(NAMESPACE_SEPARATOR) {
            return Self::Single(raw.to_string());
        }

        let namespaces: BTreeSet<String> = raw
            .split(NAMESPACE_SEPARATOR)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();

        if namespaces.is_empty() {
            warn!("Watch namespace {:?} lists no namespaces, watching all namespaces", raw);
            return Self::all();
        }

        warn!(
            "Watching {} namespaces with a multi-namespace cache; memory and API load grow with each namespace",
            namespaces.len()
        );
        Self::Multi(namespaces)
    }

    /// Scope covering every namespace.
    pub fn all() -> Self {
        Self::Single(String::new())
    }

    pub fn is_all_namespaces(&self) -> bool {
        matches!(self, Self::Single(ns) if ns.is_empty())
    }

    /// The namespace of a single, non-empty scope.
    pub fn single(&self) -> Option<&str> {
        match self {
            Self::Single(ns) if !ns.is_empty() => Some(ns),
            _ => None,
        }
    }

    /// Concrete namespaces named by this scope; empty for all namespaces.
    pub fn namespaces(&self) -> Vec<&str> {
        match self {
            Self::Single(ns) if ns.is_empty() => Vec::new(),
            Self::Single(ns) => vec![ns.as_str()],
            Self::Multi(set) => set.iter().map(String::as_str).collect(),
        }
    }

    /// Checks every named namespace is a valid RFC 1123 label.
    pub fn validate(&self) -> Result<(), ScopeError> {
        self.namespaces().into_iter().try_for_each(validate_namespace)
    }

    /// One API handle per watched namespace, or a single cluster-wide handle
    /// for the all-namespaces scope.
    pub fn apis<K, R>(&self, client: &ClusterClient<R>) -> Vec<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
        R: ClusterRole,
    {
        if self.is_all_namespaces() {
            return vec![client.all()];
        }
        self.namespaces()
            .into_iter()
            .map(|ns| client.namespaced(ns))
            .collect()
    }
}

impl Default for NamespaceScope {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(ns) if ns.is_empty() => f.write_str("all namespaces"),
            Self::Single(ns) => f.write_str(ns),
            Self::Multi(set) => {
                let joined: Vec<&str> = set.iter().map(String::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

fn validate_namespace(name: &str) -> Result<(), ScopeError> {
    let invalid = |reason| ScopeError::InvalidNamespace {
        name: name.to_string(),
        reason,
    };

    if name.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("must be no more than 63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("must consist of lower case alphanumeric characters or '-'"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric character"));
    }
    Ok(())
}
