//! Mirror kubehub: object store access and watcher wiring.
//!
//! The engine only talks to the cluster through [`ObjectStore`]. [`KubeStore`] is the
//! kube-rs implementation; `MemoryStore` (feature `memory`) is an in-process stand-in.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use mirror_core::{ConfigMirror, ConfigMirrorStatus, ObjectKey, Selector};
use tracing::debug;

pub mod watch;
#[cfg(any(test, feature = "memory"))]
pub mod memory;

#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryStore;
pub use watch::{start_watcher, Change, ChangeKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
            kube::Error::Api(ae) => StoreError::Api { code: ae.code, message: ae.message },
            other => StoreError::Transport(other.to_string()),
        }
    }
}

/// Object store operations the replication engine depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_mirror(&self, key: &ObjectKey) -> Result<Option<ConfigMirror>, StoreError>;

    /// All ConfigMirrors visible to this process (routing filters by source namespace).
    async fn list_mirrors(&self) -> Result<Vec<ConfigMirror>, StoreError>;

    /// Full object replace, guarded by `metadata.resourceVersion`. Used for finalizer edits.
    async fn replace_mirror(&self, mirror: &ConfigMirror) -> Result<ConfigMirror, StoreError>;

    /// Status subresource write, guarded by `metadata.resourceVersion` of `mirror`.
    async fn write_status(
        &self,
        mirror: &ConfigMirror,
        status: &ConfigMirrorStatus,
    ) -> Result<ConfigMirror, StoreError>;

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError>;

    /// ConfigMaps in `namespace` whose labels satisfy `selector`.
    async fn list_config_maps(&self, namespace: &str, selector: &Selector) -> Result<Vec<ConfigMap>, StoreError>;

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError>;

    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// `Err(StoreError::NotFound)` when the object is already gone.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// kube-rs backed store.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Restrict ConfigMirror listing to one namespace.
    mirror_namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, mirror_namespace: Option<String>) -> Self {
        Self { client, mirror_namespace }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn mirrors(&self, namespace: &str) -> Api<ConfigMirror> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn placement<K: ResourceExt>(obj: &K) -> Result<(String, String), StoreError> {
    let ns = obj
        .namespace()
        .ok_or_else(|| StoreError::Invalid(format!("{} has no namespace", obj.name_any())))?;
    Ok((ns, obj.name_any()))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_mirror(&self, key: &ObjectKey) -> Result<Option<ConfigMirror>, StoreError> {
        Ok(self.mirrors(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list_mirrors(&self) -> Result<Vec<ConfigMirror>, StoreError> {
        let api: Api<ConfigMirror> = match self.mirror_namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_mirror(&self, mirror: &ConfigMirror) -> Result<ConfigMirror, StoreError> {
        let (ns, name) = placement(mirror)?;
        Ok(self.mirrors(&ns).replace(&name, &PostParams::default(), mirror).await?)
    }

    async fn write_status(
        &self,
        mirror: &ConfigMirror,
        status: &ConfigMirrorStatus,
    ) -> Result<ConfigMirror, StoreError> {
        let (ns, name) = placement(mirror)?;
        // resourceVersion in a merge patch acts as a precondition; stale writes get 409
        let mut patch = serde_json::json!({ "status": status });
        if let Some(rv) = mirror.resource_version() {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }
        let started = std::time::Instant::now();
        let out = self
            .mirrors(&ns)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        histogram!("kube_status_patch_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self.config_maps(namespace).get_opt(name).await?)
    }

    async fn list_config_maps(&self, namespace: &str, selector: &Selector) -> Result<Vec<ConfigMap>, StoreError> {
        let mut lp = ListParams::default();
        if !selector.is_everything() {
            lp = lp.labels(&selector.to_query());
        }
        let started = std::time::Instant::now();
        let items = self.config_maps(namespace).list(&lp).await?.items;
        histogram!("kube_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(ns = %namespace, selector = %selector, count = items.len(), "listed configmaps");
        Ok(items
            .into_iter()
            .filter(|cm| selector.matches_opt(cm.metadata.labels.as_ref()))
            .collect())
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (ns, _) = placement(cm)?;
        counter!("kube_writes_total", 1u64, "op" => "create");
        Ok(self.config_maps(&ns).create(&PostParams::default(), cm).await?)
    }

    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (ns, name) = placement(cm)?;
        counter!("kube_writes_total", 1u64, "op" => "replace");
        Ok(self.config_maps(&ns).replace(&name, &PostParams::default(), cm).await?)
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        counter!("kube_writes_total", 1u64, "op" => "delete");
        self.config_maps(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("code {}", code),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn kube_errors_map_to_store_errors() {
        assert!(StoreError::from(api_err(404)).is_not_found());
        assert!(StoreError::from(api_err(409)).is_conflict());
        match StoreError::from(api_err(500)) {
            StoreError::Api { code, .. } => assert_eq!(code, 500),
            other => panic!("unexpected {:?}", other),
        }
    }
}
