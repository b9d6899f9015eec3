//! Mirror core types: the ConfigMirror resource, label selectors and ownership markers.

#![forbid(unsafe_code)]

use std::fmt;

use kube::ResourceExt;
use serde::{Deserialize, Serialize};

pub mod crd;
pub mod selector;

pub use crd::{
    ConfigMirror, ConfigMirrorSpec, ConfigMirrorStatus, DatabaseConfig, DatabaseStatus,
    ReplicatedConfigMap, SecretReference,
};
pub use selector::{Op, Requirement, Selector, SelectorError};

/// API group served by the ConfigMirror CRD.
pub const API_GROUP: &str = "mirror.skelops.io";
/// Finalizer token guarding cleanup of derived objects and persisted rows.
pub const FINALIZER: &str = "mirror.skelops.io/finalizer";
/// Ownership marker on derived objects: `<owner-namespace>.<owner-name>`.
pub const OWNER_LABEL: &str = "mirror.skelops.io/owner";
pub const SOURCE_NAMESPACE_LABEL: &str = "mirror.skelops.io/source-namespace";
pub const SOURCE_NAME_LABEL: &str = "mirror.skelops.io/source-name";

/// Identity of a namespaced object (the unit of work for the dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key of a namespaced resource; `None` for cluster-scoped objects.
    pub fn of<K: ResourceExt>(obj: &K) -> Option<Self> {
        let namespace = obj.namespace()?;
        Some(Self { namespace, name: obj.name_any() })
    }

    /// Value written under [`OWNER_LABEL`] on every object this owner derives.
    pub fn owner_value(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Inverse of [`ObjectKey::owner_value`]. Namespaces are DNS labels and cannot
    /// contain dots, so the first dot separates namespace from name.
    pub fn from_owner_value(value: &str) -> Option<Self> {
        let (ns, name) = value.split_once('.')?;
        if ns.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub mod prelude {
    pub use super::{
        ConfigMirror, ConfigMirrorSpec, ConfigMirrorStatus, ObjectKey, Selector, SelectorError,
        FINALIZER, OWNER_LABEL,
    };
}
