//! In-memory [`ObjectStore`] with API-server-like semantics: resource versions with
//! optimistic concurrency, finalizer-gated deletion, and injectable faults.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use mirror_core::{ConfigMirror, ConfigMirrorStatus, ObjectKey, Selector};

use crate::{ObjectStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    mirrors: BTreeMap<ObjectKey, ConfigMirror>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    next_rv: u64,
    config_map_writes: u64,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    writes: HashSet<String>,
    lists: HashSet<String>,
    status_conflicts: u32,
    mirror_list: bool,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn check_write(&self, namespace: &str) -> Result<(), StoreError> {
        if self.faults.writes.contains(namespace) {
            return Err(StoreError::Injected(format!("writes to {} disabled", namespace)));
        }
        Ok(())
    }
}

fn check_rv(current: Option<&String>, given: Option<&String>) -> Result<(), StoreError> {
    match (current, given) {
        (Some(c), Some(g)) if c != g => Err(StoreError::Conflict(format!("resourceVersion {} is stale (current {})", g, c))),
        _ => Ok(()),
    }
}

fn key_of<K: ResourceExt>(obj: &K) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::Invalid(format!("{} has no namespace", obj.name_any())))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert or overwrite a ConfigMirror as a user would (`kubectl apply`).
    /// Spec changes bump `metadata.generation`.
    pub fn put_mirror(&self, mut mirror: ConfigMirror) -> ConfigMirror {
        let mut g = self.lock();
        let key = ObjectKey::of(&mirror).unwrap_or_else(|| ObjectKey::new("default", mirror.name_any()));
        mirror.metadata.namespace = Some(key.namespace.clone());
        let prev = g.mirrors.get(&key).cloned();
        let generation = match &prev {
            Some(p) if p.spec == mirror.spec => p.metadata.generation.unwrap_or(1),
            Some(p) => p.metadata.generation.unwrap_or(1) + 1,
            None => 1,
        };
        mirror.metadata.generation = Some(generation);
        if let Some(p) = prev {
            if mirror.status.is_none() {
                mirror.status = p.status;
            }
            if mirror.metadata.finalizers.is_none() {
                mirror.metadata.finalizers = p.metadata.finalizers;
            }
        }
        mirror.metadata.resource_version = Some(g.bump());
        g.mirrors.insert(key, mirror.clone());
        mirror
    }

    pub fn mirror(&self, key: &ObjectKey) -> Option<ConfigMirror> {
        self.lock().mirrors.get(key).cloned()
    }

    /// Deletion request: objects holding finalizers only get a deletion timestamp.
    pub fn delete_mirror(&self, key: &ObjectKey) {
        let mut g = self.lock();
        let rv = g.bump();
        let remove = match g.mirrors.get_mut(key) {
            Some(m) if !m.finalizers().is_empty() => {
                if m.metadata.deletion_timestamp.is_none() {
                    m.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    m.metadata.resource_version = Some(rv);
                }
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            g.mirrors.remove(key);
        }
    }

    /// Insert or overwrite a ConfigMap as a user would.
    pub fn put_config_map(&self, mut cm: ConfigMap) -> ConfigMap {
        let mut g = self.lock();
        let key = ObjectKey::of(&cm).unwrap_or_else(|| ObjectKey::new("default", cm.name_any()));
        cm.metadata.namespace = Some(key.namespace.clone());
        cm.metadata.resource_version = Some(g.bump());
        g.config_maps.insert(key, cm.clone());
        cm
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&ObjectKey::new(namespace, name)).cloned()
    }

    pub fn config_maps_in(&self, namespace: &str) -> Vec<ConfigMap> {
        self.lock()
            .config_maps
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, cm)| cm.clone())
            .collect()
    }

    pub fn remove_config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.remove(&ObjectKey::new(namespace, name))
    }

    /// Number of create/replace/delete calls served through the [`ObjectStore`] trait.
    pub fn config_map_writes(&self) -> u64 {
        self.lock().config_map_writes
    }

    pub fn fail_writes_in(&self, namespace: &str) {
        self.lock().faults.writes.insert(namespace.to_string());
    }

    pub fn fail_lists_in(&self, namespace: &str) {
        self.lock().faults.lists.insert(namespace.to_string());
    }

    pub fn fail_mirror_list(&self) {
        self.lock().faults.mirror_list = true;
    }

    /// The next `n` status writes fail with a conflict after bumping the resource version,
    /// as if another writer got in first.
    pub fn conflict_next_status_writes(&self, n: u32) {
        self.lock().faults.status_conflicts = n;
    }

    pub fn heal(&self) {
        self.lock().faults = Faults::default();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_mirror(&self, key: &ObjectKey) -> Result<Option<ConfigMirror>, StoreError> {
        Ok(self.lock().mirrors.get(key).cloned())
    }

    async fn list_mirrors(&self) -> Result<Vec<ConfigMirror>, StoreError> {
        let g = self.lock();
        if g.faults.mirror_list {
            return Err(StoreError::Injected("mirror list disabled".into()));
        }
        Ok(g.mirrors.values().cloned().collect())
    }

    async fn replace_mirror(&self, mirror: &ConfigMirror) -> Result<ConfigMirror, StoreError> {
        let key = key_of(mirror)?;
        let mut g = self.lock();
        let rv = g.bump();
        let cur = g.mirrors.get_mut(&key).ok_or(StoreError::NotFound)?;
        check_rv(cur.metadata.resource_version.as_ref(), mirror.metadata.resource_version.as_ref())?;
        let spec_changed = cur.spec != mirror.spec;
        let status = cur.status.take();
        let generation = cur.metadata.generation.unwrap_or(1) + i64::from(spec_changed);
        let deletion = cur.metadata.deletion_timestamp.clone();
        *cur = mirror.clone();
        cur.status = status;
        cur.metadata.generation = Some(generation);
        cur.metadata.deletion_timestamp = deletion;
        cur.metadata.resource_version = Some(rv);
        let out = cur.clone();
        if out.metadata.deletion_timestamp.is_some() && out.finalizers().is_empty() {
            g.mirrors.remove(&key);
        }
        Ok(out)
    }

    async fn write_status(
        &self,
        mirror: &ConfigMirror,
        status: &ConfigMirrorStatus,
    ) -> Result<ConfigMirror, StoreError> {
        let key = key_of(mirror)?;
        let mut g = self.lock();
        if g.faults.status_conflicts > 0 {
            g.faults.status_conflicts -= 1;
            let rv = g.bump();
            if let Some(cur) = g.mirrors.get_mut(&key) {
                cur.metadata.resource_version = Some(rv);
            }
            return Err(StoreError::Conflict("injected concurrent status write".into()));
        }
        let rv = g.bump();
        let cur = g.mirrors.get_mut(&key).ok_or(StoreError::NotFound)?;
        check_rv(cur.metadata.resource_version.as_ref(), mirror.metadata.resource_version.as_ref())?;
        cur.status = Some(status.clone());
        cur.metadata.resource_version = Some(rv);
        Ok(cur.clone())
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self.config_map(namespace, name))
    }

    async fn list_config_maps(&self, namespace: &str, selector: &Selector) -> Result<Vec<ConfigMap>, StoreError> {
        let g = self.lock();
        if g.faults.lists.contains(namespace) {
            return Err(StoreError::Injected(format!("list in {} disabled", namespace)));
        }
        Ok(g.config_maps
            .iter()
            .filter(|(k, cm)| k.namespace == namespace && selector.matches_opt(cm.metadata.labels.as_ref()))
            .map(|(_, cm)| cm.clone())
            .collect())
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let key = key_of(cm)?;
        let mut g = self.lock();
        g.check_write(&key.namespace)?;
        if g.config_maps.contains_key(&key) {
            return Err(StoreError::Conflict(format!("configmap {} already exists", key)));
        }
        let mut stored = cm.clone();
        stored.metadata.resource_version = Some(g.bump());
        g.config_map_writes += 1;
        g.config_maps.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let key = key_of(cm)?;
        let mut g = self.lock();
        g.check_write(&key.namespace)?;
        let rv = g.bump();
        g.config_map_writes += 1;
        let cur = g.config_maps.get_mut(&key).ok_or(StoreError::NotFound)?;
        check_rv(cur.metadata.resource_version.as_ref(), cm.metadata.resource_version.as_ref())?;
        *cur = cm.clone();
        cur.metadata.resource_version = Some(rv);
        Ok(cur.clone())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.check_write(namespace)?;
        g.config_map_writes += 1;
        g.config_maps
            .remove(&ObjectKey::new(namespace, name))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
