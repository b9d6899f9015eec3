//! Derived-object writes: create or update a copy, and ownership-checked removal.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use mirror_core::{ObjectKey, OWNER_LABEL, SOURCE_NAMESPACE_LABEL, SOURCE_NAME_LABEL};
use mirror_kubehub::{ObjectStore, StoreError};
use mirror_persist::Snapshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Created,
    Updated,
    Unchanged,
}

impl CopyOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            CopyOutcome::Created => "created",
            CopyOutcome::Updated => "updated",
            CopyOutcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Deleted,
    Absent,
    /// An object with that name exists but carries no (or another) owner marker.
    NotOwned,
}

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("{namespace}/{name} exists and is not owned by {owner} (owner label: {found:?})")]
    NotOwned {
        namespace: String,
        name: String,
        owner: String,
        found: Option<String>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The copy of `source` that `owner` maintains in `target_ns`.
pub fn desired_copy(source: &ConfigMap, target_ns: &str, owner: &ObjectKey) -> ConfigMap {
    let labels = BTreeMap::from([
        (OWNER_LABEL.to_string(), owner.owner_value()),
        (SOURCE_NAMESPACE_LABEL.to_string(), source.namespace().unwrap_or_default()),
        (SOURCE_NAME_LABEL.to_string(), source.name_any()),
    ]);
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(source.name_any()),
            namespace: Some(target_ns.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        data: source.data.clone(),
        binary_data: source.binary_data.clone(),
        ..ConfigMap::default()
    }
}

fn owned_by(cm: &ConfigMap, owner: &str) -> bool {
    cm.labels().get(OWNER_LABEL).map(String::as_str) == Some(owner)
}

/// Make the copy in `target_ns` match `source`. Existing objects are only touched when
/// they already carry this owner's marker.
pub async fn apply_copy(
    store: &dyn ObjectStore,
    source: &ConfigMap,
    target_ns: &str,
    owner: &ObjectKey,
) -> Result<CopyOutcome, CopyError> {
    let want = desired_copy(source, target_ns, owner);
    let name = want.name_any();
    let owner_value = owner.owner_value();

    let Some(mut existing) = store.get_config_map(target_ns, &name).await? else {
        store.create_config_map(&want).await?;
        debug!(namespace = %target_ns, configmap = %name, "copy created");
        return Ok(CopyOutcome::Created);
    };
    if !owned_by(&existing, &owner_value) {
        return Err(CopyError::NotOwned {
            namespace: target_ns.to_string(),
            name,
            owner: owner_value,
            found: existing.labels().get(OWNER_LABEL).cloned(),
        });
    }

    let labels_current = want.labels().iter().all(|(k, v)| existing.labels().get(k) == Some(v));
    if existing.data == want.data && existing.binary_data == want.binary_data && labels_current {
        return Ok(CopyOutcome::Unchanged);
    }
    existing.data = want.data;
    existing.binary_data = want.binary_data;
    existing.labels_mut().extend(want.metadata.labels.unwrap_or_default());
    store.replace_config_map(&existing).await?;
    debug!(namespace = %target_ns, configmap = %name, "copy updated");
    Ok(CopyOutcome::Updated)
}

/// Delete `namespace/name` if it carries `owner`'s marker. Anything else is left alone.
pub async fn remove_copy(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    owner: &ObjectKey,
) -> Result<RemoveOutcome, StoreError> {
    let Some(existing) = store.get_config_map(namespace, name).await? else {
        return Ok(RemoveOutcome::Absent);
    };
    if !owned_by(&existing, &owner.owner_value()) {
        return Ok(RemoveOutcome::NotOwned);
    }
    match store.delete_config_map(namespace, name).await {
        Ok(()) => Ok(RemoveOutcome::Deleted),
        Err(e) if e.is_not_found() => Ok(RemoveOutcome::Absent),
        Err(e) => Err(e),
    }
}

/// Row payload for a matched source object.
pub fn snapshot(source: &ConfigMap) -> Snapshot {
    Snapshot {
        name: source.name_any(),
        namespace: source.namespace().unwrap_or_default(),
        data: source.data.clone().unwrap_or_default(),
        labels: source.metadata.labels.clone(),
        annotations: source.metadata.annotations.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_kubehub::MemoryStore;

    fn source() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("app-config".into()),
                namespace: Some("app-source".into()),
                labels: Some(BTreeMap::from([("app".to_string(), "myapp".to_string())])),
                annotations: Some(BTreeMap::from([("note".to_string(), "kept".to_string())])),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([("key".to_string(), "v1".to_string())])),
            ..ConfigMap::default()
        }
    }

    fn owner() -> ObjectKey {
        ObjectKey::new("app-source", "app-config-mirror")
    }

    #[test]
    fn desired_copy_carries_payload_and_only_marker_labels() {
        let copy = desired_copy(&source(), "dev", &owner());
        assert_eq!(copy.metadata.namespace.as_deref(), Some("dev"));
        assert_eq!(copy.name_any(), "app-config");
        assert_eq!(copy.data, source().data);
        let labels = copy.labels();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[OWNER_LABEL], "app-source.app-config-mirror");
        assert_eq!(labels[SOURCE_NAMESPACE_LABEL], "app-source");
        assert_eq!(labels[SOURCE_NAME_LABEL], "app-config");
        assert!(copy.metadata.annotations.is_none());
    }

    #[tokio::test]
    async fn apply_copy_creates_then_skips_then_updates() {
        let store = MemoryStore::new();
        let mut src = source();
        assert_eq!(apply_copy(&store, &src, "dev", &owner()).await.unwrap(), CopyOutcome::Created);
        assert_eq!(apply_copy(&store, &src, "dev", &owner()).await.unwrap(), CopyOutcome::Unchanged);
        assert_eq!(store.config_map_writes(), 1);

        src.data = Some(BTreeMap::from([("key".to_string(), "v2".to_string())]));
        assert_eq!(apply_copy(&store, &src, "dev", &owner()).await.unwrap(), CopyOutcome::Updated);
        assert_eq!(store.config_map("dev", "app-config").unwrap().data, src.data);
    }

    #[tokio::test]
    async fn foreign_objects_are_neither_overwritten_nor_removed() {
        let store = MemoryStore::new();
        let mut foreign = source();
        foreign.metadata.namespace = Some("dev".into());
        foreign.metadata.labels = None;
        store.put_config_map(foreign.clone());

        let err = apply_copy(&store, &source(), "dev", &owner()).await.unwrap_err();
        assert!(matches!(err, CopyError::NotOwned { found: None, .. }));
        assert_eq!(remove_copy(&store, "dev", "app-config", &owner()).await.unwrap(), RemoveOutcome::NotOwned);
        assert_eq!(store.config_map("dev", "app-config").unwrap().data, foreign.data);
        assert_eq!(store.config_map_writes(), 0);

        assert_eq!(remove_copy(&store, "prod", "app-config", &owner()).await.unwrap(), RemoveOutcome::Absent);
    }
}
