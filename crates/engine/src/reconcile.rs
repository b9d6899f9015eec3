use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use metrics::{counter, histogram};
use mirror_core::crd::{reasons, ready_condition};
use mirror_core::{
    ConfigMirror, ConfigMirrorSpec, DatabaseStatus, ObjectKey, ReplicatedConfigMap, Selector, FINALIZER, OWNER_LABEL,
};
use mirror_kubehub::StoreError;
use mirror_persist::{Owner, RecordStore};
use tracing::{debug, info, instrument, warn};

use crate::replicate::{self, RemoveOutcome};
use crate::{status, Action, Context, Error};

/// One reconciliation pass for the ConfigMirror at `key`.
#[instrument(skip_all, fields(mirror = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let started = Instant::now();
    counter!("mirror_reconcile_total", 1u64);
    let res = run_pass(key, ctx).await;
    histogram!("mirror_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
    match &res {
        Ok(action) => debug!(?action, "pass finished"),
        Err(e) => {
            counter!("mirror_reconcile_errors_total", 1u64, "reason" => e.reason());
        }
    }
    res
}

async fn run_pass(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let Some(mut mirror) = ctx.store.get_mirror(key).await? else {
        debug!("mirror not found; nothing to do");
        return Ok(Action::AwaitChange);
    };

    if mirror.is_terminating() {
        if mirror.has_finalizer() {
            finalize(key, mirror, ctx).await?;
        }
        return Ok(Action::AwaitChange);
    }

    if !mirror.has_finalizer() {
        mirror.metadata.finalizers.get_or_insert_with(Vec::new).push(FINALIZER.to_string());
        mirror = ctx.store.replace_mirror(&mirror).await?;
        info!("finalizer added");
    }

    sync(key, mirror, ctx).await
}

// Label values are capped at 63 characters.
const MAX_OWNER_VALUE: usize = 63;

fn validate(key: &ObjectKey, spec: &ConfigMirrorSpec) -> Result<(), Error> {
    if spec.source_namespace.trim().is_empty() {
        return Err(Error::InvalidSpec("sourceNamespace must not be empty".into()));
    }
    if spec.target_namespaces.iter().all(|ns| ns.trim().is_empty()) {
        return Err(Error::InvalidSpec("targetNamespaces must name at least one namespace".into()));
    }
    let owner = key.owner_value();
    if owner.len() > MAX_OWNER_VALUE {
        return Err(Error::InvalidSpec(format!(
            "owner label value {:?} is {} characters; at most {} allowed",
            owner,
            owner.len(),
            MAX_OWNER_VALUE
        )));
    }
    Ok(())
}

async fn sync(key: &ObjectKey, mirror: ConfigMirror, ctx: &Context) -> Result<Action, Error> {
    if let Err(e) = validate(key, &mirror.spec) {
        warn!(error = %e, "rejecting spec");
        status::mark_failed(ctx, key, &mirror, reasons::INVALID_SPEC, &e.to_string()).await;
        return Err(e);
    }
    let selector = match Selector::compile(&mirror.spec.selector) {
        Ok(s) => s,
        Err(e) => {
            let e = Error::from(e);
            warn!(error = %e, "rejecting selector");
            status::mark_failed(ctx, key, &mirror, reasons::INVALID_SELECTOR, &e.to_string()).await;
            return Err(e);
        }
    };

    let source_ns = mirror.spec.source_namespace.clone();
    let sources = match ctx.store.list_config_maps(&source_ns, &selector).await {
        Ok(list) => list,
        Err(e) => {
            let msg = format!("listing ConfigMaps in {} failed: {}", source_ns, e);
            status::mark_failed(ctx, key, &mirror, reasons::LIST_FAILED, &msg).await;
            return Err(e.into());
        }
    };
    debug!(matched = sources.len(), selector = %selector, "sources listed");

    let targets: Vec<&str> = mirror.spec.distinct_targets().into_iter().filter(|ns| !ns.trim().is_empty()).collect();
    let previous: HashMap<&str, &ReplicatedConfigMap> =
        mirror.tracked().iter().map(|r| (r.name.as_str(), r)).collect();
    let records = ctx.records_for(&mirror);
    let record_owner = Owner::new(&key.name, &key.namespace);
    let now = Utc::now();

    let mut replicated = Vec::with_capacity(sources.len());
    for src in &sources {
        let name = src.name_any();
        let mut written = Vec::with_capacity(targets.len());
        for target in &targets {
            match replicate::apply_copy(ctx.store.as_ref(), src, target, key).await {
                Ok(outcome) => {
                    counter!("mirror_replicate_total", 1u64, "outcome" => outcome.as_str());
                    written.push(target.to_string());
                }
                Err(e) => {
                    counter!("mirror_replicate_errors_total", 1u64);
                    warn!(configmap = %name, target = %target, error = %e, "replication failed");
                }
            }
        }

        // namespaces dropped from the target list since the last pass; failed removals stay recorded
        if let Some(prev) = previous.get(name.as_str()) {
            for stale in prev.targets.iter().filter(|ns| !targets.contains(&ns.as_str())) {
                if remove_logged(ctx, stale, &name, key).await.is_none() {
                    written.push(stale.clone());
                }
            }
        }

        if let Some(db) = records {
            if let Err(e) = db.upsert(&record_owner, &replicate::snapshot(src)) {
                warn!(configmap = %name, error = %e, "persisting snapshot failed");
            }
        }

        replicated.push(ReplicatedConfigMap {
            name,
            source_namespace: source_ns.clone(),
            targets: written,
            last_sync_time: Some(Time(now)),
        });
    }

    let current: HashSet<&str> = replicated.iter().map(|r| r.name.as_str()).collect();
    let mut pending = Vec::new();
    for orphan in mirror.tracked().iter().filter(|r| !current.contains(r.name.as_str())) {
        info!(configmap = %orphan.name, "source no longer matched; removing copies");
        let namespaces: BTreeSet<&str> =
            targets.iter().copied().chain(orphan.targets.iter().map(String::as_str)).collect();
        let mut failed = Vec::new();
        for ns in namespaces {
            match remove_logged(ctx, ns, &orphan.name, key).await {
                Some(RemoveOutcome::Deleted) => {
                    counter!("mirror_orphans_deleted_total", 1u64);
                }
                Some(_) => {}
                None => failed.push(ns.to_string()),
            }
        }
        if !failed.is_empty() {
            // still tracked so the next pass and finalization revisit these namespaces
            pending.push(ReplicatedConfigMap { targets: failed, ..orphan.clone() });
        }
        if let Some(db) = records {
            match db.delete(&orphan.name, &orphan.source_namespace, &record_owner) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(configmap = %orphan.name, error = %e, "deleting persisted row failed"),
            }
        }
    }

    let synced = replicated.len();
    if !pending.is_empty() {
        warn!(pending = pending.len(), "orphaned copies left behind; retrying next pass");
    }
    replicated.extend(pending);

    let database_status = if mirror.database_enabled() { Some(probe_database(ctx, now)) } else { None };
    let generation = mirror.metadata.generation;
    let message = format!("Replicated {} ConfigMap(s) to {} namespace(s)", synced, targets.len());
    status::write(ctx, key, mirror, |st| {
        st.replicated_config_maps = replicated.clone();
        st.database_status = database_status.clone();
        st.observed_generation = generation;
        st.set_condition(ready_condition(true, reasons::RECONCILE_SUCCESS, message.as_str(), generation, now));
    })
    .await?;

    info!(replicated = synced, "mirror in sync");
    Ok(Action::Requeue(ctx.config.resync))
}

/// Ownership-checked delete with failures logged. `None` means the copy may still exist.
async fn remove_logged(ctx: &Context, namespace: &str, name: &str, owner: &ObjectKey) -> Option<RemoveOutcome> {
    match replicate::remove_copy(ctx.store.as_ref(), namespace, name, owner).await {
        Ok(outcome) => {
            match outcome {
                RemoveOutcome::Deleted => debug!(namespace, configmap = %name, "copy removed"),
                RemoveOutcome::NotOwned => {
                    debug!(namespace, configmap = %name, "leaving object without our owner marker")
                }
                RemoveOutcome::Absent => {}
            }
            Some(outcome)
        }
        Err(e) => {
            warn!(namespace, configmap = %name, error = %e, "removing copy failed");
            None
        }
    }
}

fn probe_database(ctx: &Context, now: chrono::DateTime<Utc>) -> DatabaseStatus {
    let Some(db) = ctx.records.as_deref() else {
        return DatabaseStatus {
            connected: false,
            last_sync_time: None,
            message: "no database configured".into(),
        };
    };
    match db.ping() {
        Ok(()) => {
            ctx.db_health.record(true);
            DatabaseStatus { connected: true, last_sync_time: Some(Time(now)), message: "Connected".into() }
        }
        Err(e) => {
            ctx.db_health.record(false);
            warn!(error = %e, "database ping failed");
            DatabaseStatus { connected: false, last_sync_time: None, message: e.to_string() }
        }
    }
}

/// Remove every derived copy and persisted row, then release the finalizer. Only the
/// derived-copy phase can block deletion.
async fn finalize(key: &ObjectKey, mut mirror: ConfigMirror, ctx: &Context) -> Result<(), Error> {
    info!("mirror terminating; cleaning up");
    let owner_value = key.owner_value();
    let owner_selector = Selector::from_labels([(OWNER_LABEL.to_string(), owner_value.clone())]);
    // an over-long owner value was rejected before any copy could carry it
    let namespaces: BTreeSet<String> = if owner_value.len() > MAX_OWNER_VALUE {
        BTreeSet::new()
    } else {
        mirror
            .spec
            .target_namespaces
            .iter()
            .chain(mirror.tracked().iter().flat_map(|r| r.targets.iter()))
            .filter(|ns| !ns.trim().is_empty())
            .cloned()
            .collect()
    };

    for ns in &namespaces {
        let cleanup = |source: StoreError| Error::Cleanup { namespace: ns.clone(), source };
        let copies = ctx.store.list_config_maps(ns, &owner_selector).await.map_err(cleanup)?;
        for cm in copies {
            match ctx.store.delete_config_map(ns, &cm.name_any()).await {
                Ok(()) => debug!(namespace = %ns, configmap = %cm.name_any(), "copy removed"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(cleanup(e)),
            }
        }
    }

    if let Some(db) = ctx.records.as_deref() {
        purge_records(db, &Owner::new(&key.name, &key.namespace));
    }

    mirror.metadata.finalizers.get_or_insert_with(Vec::new).retain(|f| f != FINALIZER);
    ctx.store.replace_mirror(&mirror).await?;
    info!(namespaces = namespaces.len(), "cleanup finished; finalizer released");
    Ok(())
}

fn purge_records(db: &dyn RecordStore, owner: &Owner) {
    let rows = match db.query(owner) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "listing persisted rows for cleanup failed");
            return;
        }
    };
    for row in rows {
        let snap = &row.snapshot;
        match db.delete(&snap.name, &snap.namespace, owner) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(configmap = %snap.name, error = %e, "deleting persisted row failed"),
        }
    }
}
