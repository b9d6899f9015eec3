//! ConfigMirror custom resource.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ObjectKey, FINALIZER};

pub const READY: &str = "Ready";

/// Reason tokens used on the Ready condition.
pub mod reasons {
    pub const RECONCILE_SUCCESS: &str = "ReconcileSuccess";
    pub const INVALID_SELECTOR: &str = "InvalidSelector";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const LIST_FAILED: &str = "ListFailed";
}

/// Replicates ConfigMaps selected in `sourceNamespace` into every target namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "mirror.skelops.io", version = "v1alpha1", kind = "ConfigMirror", namespaced)]
#[kube(status = "ConfigMirrorStatus", shortname = "cmir")]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#)]
#[kube(printcolumn = r#"{"name":"DB","type":"boolean","jsonPath":".status.databaseStatus.connected"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMirrorSpec {
    /// Namespace whose ConfigMaps are selected.
    pub source_namespace: String,
    /// Namespaces receiving copies. Duplicates are processed once.
    pub target_namespaces: Vec<String>,
    pub selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Secret holding connection details (host, port, dbname, username, password).
    pub secret_ref: SecretReference,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the ConfigMirror namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

// Status fields always serialize (empty list / null) so a merge patch clears stale values.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMirrorStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub replicated_config_maps: Vec<ReplicatedConfigMap>,
    #[serde(default)]
    pub database_status: Option<DatabaseStatus>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedConfigMap {
    pub name: String,
    pub source_namespace: String,
    /// Target namespaces the last pass wrote, plus any whose removal is still pending.
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ConfigMirror {
    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::of(self)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn database_enabled(&self) -> bool {
        self.spec.database.as_ref().map_or(false, |d| d.enabled)
    }

    pub fn tracked(&self) -> &[ReplicatedConfigMap] {
        self.status.as_ref().map(|s| s.replicated_config_maps.as_slice()).unwrap_or(&[])
    }
}

impl ConfigMirrorSpec {
    /// Target namespaces in first-occurrence order, without duplicates.
    pub fn distinct_targets(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.target_namespaces
            .iter()
            .map(String::as_str)
            .filter(|ns| seen.insert(*ns))
            .collect()
    }
}

impl ConfigMirrorStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Upsert a condition by type. The transition time only moves when the status flips.
    pub fn set_condition(&mut self, next: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == next.type_) {
            Some(cur) => {
                if cur.status != next.status {
                    cur.status = next.status;
                    cur.last_transition_time = next.last_transition_time;
                }
                cur.reason = next.reason;
                cur.message = next.message;
                cur.observed_generation = next.observed_generation;
            }
            None => self.conditions.push(next),
        }
    }
}

pub fn ready_condition(
    ready: bool,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    Condition {
        type_: READY.to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation: generation,
        last_transition_time: Time(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(targets: &[&str]) -> ConfigMirrorSpec {
        ConfigMirrorSpec {
            source_namespace: "src".into(),
            target_namespaces: targets.iter().map(|s| s.to_string()).collect(),
            selector: LabelSelector::default(),
            database: None,
        }
    }

    #[test]
    fn distinct_targets_keeps_first_occurrence_order() {
        let s = spec(&["prod", "dev", "prod", "staging", "dev"]);
        assert_eq!(s.distinct_targets(), vec!["prod", "dev", "staging"]);
    }

    #[test]
    fn set_condition_replaces_by_type_and_keeps_transition_time() {
        let t0 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t1 = Utc.timestamp_opt(2_000, 0).unwrap();
        let t2 = Utc.timestamp_opt(3_000, 0).unwrap();
        let mut st = ConfigMirrorStatus::default();

        st.set_condition(ready_condition(true, reasons::RECONCILE_SUCCESS, "ok", Some(1), t0));
        st.set_condition(ready_condition(true, reasons::RECONCILE_SUCCESS, "still ok", Some(2), t1));
        assert_eq!(st.conditions.len(), 1);
        let c = st.condition(READY).unwrap();
        assert_eq!(c.message, "still ok");
        assert_eq!(c.observed_generation, Some(2));
        assert_eq!(c.last_transition_time, Time(t0));

        st.set_condition(ready_condition(false, reasons::LIST_FAILED, "boom", Some(2), t2));
        let c = st.condition(READY).unwrap();
        assert_eq!(c.status, "False");
        assert_eq!(c.reason, reasons::LIST_FAILED);
        assert_eq!(c.last_transition_time, Time(t2));
    }

    #[test]
    fn spec_uses_camel_case_and_defaults_database_enabled() {
        let raw = serde_json::json!({
            "sourceNamespace": "app-source",
            "targetNamespaces": ["dev"],
            "selector": { "matchLabels": { "app": "myapp" } },
            "database": { "secretRef": { "name": "pg" } }
        });
        let s: ConfigMirrorSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(s.source_namespace, "app-source");
        let db = s.database.unwrap();
        assert!(db.enabled);
        assert_eq!(db.secret_ref.namespace, None);
    }

    #[test]
    fn empty_status_serializes_clearing_fields() {
        let v = serde_json::to_value(ConfigMirrorStatus::default()).unwrap();
        assert_eq!(v["replicatedConfigMaps"], serde_json::json!([]));
        assert!(v["databaseStatus"].is_null());
    }
}
