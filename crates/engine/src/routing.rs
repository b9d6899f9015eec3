//! Map watch events to the ConfigMirror keys that need a pass.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use mirror_core::{ConfigMirror, ObjectKey, Selector, OWNER_LABEL};
use mirror_kubehub::{ChangeKind, ObjectStore};
use tracing::{debug, warn};

/// Routing view of the ConfigMirrors seen on the watch, so ConfigMap events are
/// matched in memory instead of listing mirrors from the API server.
#[derive(Debug, Default)]
pub struct MirrorIndex {
    entries: BTreeMap<ObjectKey, Entry>,
}

#[derive(Debug)]
struct Entry {
    source_namespace: String,
    // None when the selector does not compile; the mirror is then routed by tracked name only
    selector: Option<Selector>,
    tracked: HashSet<String>,
}

impl MirrorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a ConfigMirror watch event.
    pub fn apply(&mut self, kind: ChangeKind, mirror: &ConfigMirror) {
        let Some(key) = mirror.key() else { return };
        if kind == ChangeKind::Deleted {
            self.entries.remove(&key);
            return;
        }
        let selector = match Selector::compile(&mirror.spec.selector) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(mirror = %key, error = %e, "indexing mirror with invalid selector");
                None
            }
        };
        let entry = Entry {
            source_namespace: mirror.spec.source_namespace.clone(),
            selector,
            tracked: mirror.tracked().iter().map(|r| r.name.clone()).collect(),
        };
        self.entries.insert(key, entry);
    }

    /// Keys of every ConfigMirror affected by a change to `cm`, deduplicated.
    ///
    /// A mirror is affected when it reads from the object's namespace and either its
    /// selector matches the object's labels or its status already tracks the object by
    /// name. A derived copy also routes to the owner named in its marker.
    pub fn route(&self, cm: &ConfigMap) -> Vec<ObjectKey> {
        let mut keys = BTreeSet::new();
        if let Some(owner) = cm.labels().get(OWNER_LABEL).and_then(|v| ObjectKey::from_owner_value(v)) {
            keys.insert(owner);
        }
        let Some(namespace) = cm.namespace() else {
            return keys.into_iter().collect();
        };
        let name = cm.name_any();
        for (key, entry) in self.entries.iter().filter(|(_, e)| e.source_namespace == namespace) {
            let selected = entry.selector.as_ref().is_some_and(|s| s.matches(cm.labels()));
            if selected || entry.tracked.contains(&name) {
                keys.insert(key.clone());
            }
        }
        keys.into_iter().collect()
    }
}

/// [`MirrorIndex::route`] against a fresh listing of every mirror. Listing failures
/// leave only the owner-marker route; the periodic resync covers the rest.
pub async fn route_config_map(store: &dyn ObjectStore, cm: &ConfigMap) -> Vec<ObjectKey> {
    let mut index = MirrorIndex::new();
    match store.list_mirrors().await {
        Ok(list) => list.iter().for_each(|m| index.apply(ChangeKind::Applied, m)),
        Err(e) => warn!(error = %e, "listing mirrors for routing failed; relying on resync"),
    }
    index.route(cm)
}

/// Drops ConfigMirror events that carry no new work (status-only writes, resyncs of an
/// unchanged object) so a pass's own status update does not trigger another pass.
#[derive(Debug, Default)]
pub struct GenerationFilter {
    seen: HashMap<ObjectKey, Seen>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    generation: Option<i64>,
    terminating: bool,
}

impl GenerationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the key to enqueue, if this event warrants a pass.
    pub fn observe(&mut self, kind: ChangeKind, mirror: &ConfigMirror) -> Option<ObjectKey> {
        let key = mirror.key()?;
        if kind == ChangeKind::Deleted {
            self.seen.remove(&key);
            return None;
        }
        let now = Seen { generation: mirror.metadata.generation, terminating: mirror.is_terminating() };
        match self.seen.insert(key.clone(), now) {
            Some(prev) if prev == now => None,
            _ => Some(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
    use mirror_core::ConfigMirrorSpec;

    fn mirror(generation: i64) -> ConfigMirror {
        let mut m = ConfigMirror::new(
            "m",
            ConfigMirrorSpec {
                source_namespace: "src".into(),
                target_namespaces: vec!["dev".into()],
                selector: LabelSelector::default(),
                database: None,
            },
        );
        m.metadata.namespace = Some("src".into());
        m.metadata.generation = Some(generation);
        m
    }

    fn source(name: &str, app: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("src".into());
        cm.metadata.labels = Some([("app".to_string(), app.to_string())].into_iter().collect());
        cm
    }

    fn selecting(app: &str) -> ConfigMirror {
        let mut m = mirror(1);
        m.spec.selector.match_labels = Some([("app".to_string(), app.to_string())].into_iter().collect());
        m
    }

    #[test]
    fn index_follows_mirror_events() {
        let mut index = MirrorIndex::new();
        let key = ObjectKey::new("src", "m");
        let cm = source("app-config", "myapp");
        assert!(index.route(&cm).is_empty());

        index.apply(ChangeKind::Applied, &selecting("myapp"));
        assert_eq!(index.route(&cm), vec![key.clone()]);

        // selector edited away from the object
        index.apply(ChangeKind::Applied, &selecting("other"));
        assert!(index.route(&cm).is_empty());

        let mut tracking = selecting("other");
        tracking.status = Some(mirror_core::ConfigMirrorStatus {
            replicated_config_maps: vec![mirror_core::ReplicatedConfigMap {
                name: "app-config".into(),
                source_namespace: "src".into(),
                targets: vec!["dev".into()],
                last_sync_time: None,
            }],
            ..Default::default()
        });
        index.apply(ChangeKind::Applied, &tracking);
        assert_eq!(index.route(&cm), vec![key]);
        assert_eq!(index.len(), 1);

        index.apply(ChangeKind::Deleted, &tracking);
        assert!(index.is_empty());
        assert!(index.route(&cm).is_empty());
    }

    #[test]
    fn filter_passes_spec_changes_and_deletion_requests_only() {
        let mut f = GenerationFilter::new();
        let key = ObjectKey::new("src", "m");
        assert_eq!(f.observe(ChangeKind::Applied, &mirror(1)), Some(key.clone()));
        // status write: same generation
        assert_eq!(f.observe(ChangeKind::Applied, &mirror(1)), None);
        assert_eq!(f.observe(ChangeKind::Applied, &mirror(2)), Some(key.clone()));

        let mut deleting = mirror(2);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(f.observe(ChangeKind::Applied, &deleting), Some(key.clone()));
        assert_eq!(f.observe(ChangeKind::Deleted, &deleting), None);
        // recreated under the same name
        assert_eq!(f.observe(ChangeKind::Applied, &mirror(1)), Some(key));
    }
}
