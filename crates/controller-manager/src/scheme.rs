//! Explicit registry of the kinds a process works with.
//!
//! Built once in `main` and handed to the manager and to controllers. A
//! controller asking to watch a kind that was never registered is rejected at
//! registration time instead of failing later at watch time.

use std::collections::HashSet;

use kube::Resource;
use kube::core::GroupVersionKind;

#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: HashSet<GroupVersionKind>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `K` and returns the scheme, for chaining.
    #[must_use]
    pub fn with<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        self.register::<K>();
        self
    }

    /// Registers `K`. Registering twice is a no-op.
    pub fn register<K>(&mut self) -> &mut Self
    where
        K: Resource<DynamicType = ()>,
    {
        self.kinds.insert(gvk_of::<K>());
        self
    }

    /// Whether `K` has been registered.
    pub fn recognizes<K>(&self) -> bool
    where
        K: Resource<DynamicType = ()>,
    {
        self.contains(&gvk_of::<K>())
    }

    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(gvk)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Group, version and kind of a statically typed resource.
pub fn gvk_of<K>() -> GroupVersionKind
where
    K: Resource<DynamicType = ()>,
{
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// `group/version, Kind=kind` rendering used in error messages.
pub fn describe(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}
