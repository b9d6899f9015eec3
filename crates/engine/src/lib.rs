//! Mirror engine: the ConfigMirror reconciliation pass and event routing.
//!
//! A pass takes one ConfigMirror identity and converges three things toward its spec:
//! the derived ConfigMaps in every target namespace, the persisted snapshot rows, and
//! the resource status. Dependencies are injected through [`Context`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::gauge;
use mirror_core::ConfigMirror;
use mirror_kubehub::ObjectStore;
use mirror_persist::RecordStore;

mod error;
mod reconcile;
pub mod replicate;
pub mod routing;
mod status;
mod worker;

pub use error::Error;
pub use reconcile::reconcile;
pub use routing::{route_config_map, GenerationFilter, MirrorIndex};
pub use worker::Reconciler;

/// What the caller should do after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Requeue(Duration),
    AwaitChange,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Periodic resync after a successful pass.
    pub resync: Duration,
    /// Status write attempts before giving up on optimistic-concurrency conflicts.
    pub status_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { resync: Duration::from_secs(300), status_attempts: 5 }
    }
}

/// Outcome of the most recent database liveness probe, shared across workers.
#[derive(Debug, Default)]
pub struct DbHealth {
    state: AtomicU8,
}

impl DbHealth {
    const UNKNOWN: u8 = 0;
    const UP: u8 = 1;
    const DOWN: u8 = 2;

    pub fn record(&self, ok: bool) {
        self.state.store(if ok { Self::UP } else { Self::DOWN }, Ordering::Relaxed);
        gauge!("mirror_db_connected", if ok { 1.0 } else { 0.0 });
    }

    /// `None` until the first probe ran.
    pub fn last_probe_ok(&self) -> Option<bool> {
        match self.state.load(Ordering::Relaxed) {
            Self::UNKNOWN => None,
            s => Some(s == Self::UP),
        }
    }
}

pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    /// Process-wide persistence client; `None` when no database is configured.
    pub records: Option<Arc<dyn RecordStore>>,
    pub db_health: Arc<DbHealth>,
    pub config: EngineConfig,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>, records: Option<Arc<dyn RecordStore>>, config: EngineConfig) -> Self {
        Self { store, records, db_health: Arc::new(DbHealth::default()), config }
    }

    /// The record store, if this mirror asked for persistence and one is configured.
    pub(crate) fn records_for(&self, mirror: &ConfigMirror) -> Option<&dyn RecordStore> {
        if mirror.database_enabled() {
            self.records.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_health_starts_unknown() {
        let h = DbHealth::default();
        assert_eq!(h.last_probe_ok(), None);
        h.record(false);
        assert_eq!(h.last_probe_ok(), Some(false));
        h.record(true);
        assert_eq!(h.last_probe_ok(), Some(true));
    }
}
