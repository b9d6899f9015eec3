//! Mirror persistence: SQLite table of ConfigMap snapshots keyed by owner.
//! Every call stands alone; the natural-key constraint keeps one row per object and owner.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of the ConfigMirror a row belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
}

impl Owner {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

/// Point-in-time copy of a source ConfigMap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, String>,
    pub labels: Option<BTreeMap<String, String>>,
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapRecord {
    pub id: i64,
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub owner: Owner,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("record not found")]
    NotFound,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl PersistError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistError::NotFound)
    }
}

pub trait RecordStore: Send + Sync {
    /// Create table and indexes if absent. Safe on every start.
    fn init_schema(&self) -> Result<(), PersistError>;
    /// Insert, or overwrite payload and `updated_at` on (name, namespace, owner) conflict.
    fn upsert(&self, owner: &Owner, snapshot: &Snapshot) -> Result<(), PersistError>;
    /// Remove exactly one row; `PersistError::NotFound` if nothing matched.
    fn delete(&self, name: &str, namespace: &str, owner: &Owner) -> Result<(), PersistError>;
    /// All rows for `owner`, newest first.
    fn query(&self, owner: &Owner) -> Result<Vec<ConfigMapRecord>, PersistError>;
    fn ping(&self) -> Result<(), PersistError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS configmaps (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    name            TEXT NOT NULL,
    namespace       TEXT NOT NULL,
    data            TEXT NOT NULL,
    labels          TEXT,
    annotations     TEXT,
    owner_name      TEXT NOT NULL,
    owner_namespace TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    UNIQUE(name, namespace, owner_namespace, owner_name)
);
CREATE INDEX IF NOT EXISTS idx_configmaps_owner ON configmaps(owner_namespace, owner_name);
CREATE INDEX IF NOT EXISTS idx_configmaps_created_at ON configmaps(created_at DESC);
";

/// SQLite-backed store. The mutex serializes use of the single connection; row
/// consistency comes from the unique key, not from the lock.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self, PersistError> {
        let path = std::env::var("MIRROR_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    /// Open (or create) the database at `path`; `:memory:` gives a private in-memory db.
    pub fn open(path: &str) -> Result<Self, PersistError> {
        let started = std::time::Instant::now();
        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "opened record store");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.db.lock().map_err(|_| PersistError::Unavailable("connection lock poisoned".into()))
    }
}

fn to_json(map: Option<&BTreeMap<String, String>>) -> Result<Option<String>, PersistError> {
    Ok(match map {
        Some(m) => Some(serde_json::to_string(m)?),
        None => None,
    })
}

fn from_json(raw: Option<String>) -> Result<Option<BTreeMap<String, String>>, PersistError> {
    Ok(match raw {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    })
}

fn ts(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl RecordStore for SqliteStore {
    fn init_schema(&self) -> Result<(), PersistError> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn upsert(&self, owner: &Owner, snapshot: &Snapshot) -> Result<(), PersistError> {
        let started = std::time::Instant::now();
        let data = serde_json::to_string(&snapshot.data)?;
        let labels = to_json(snapshot.labels.as_ref())?;
        let annotations = to_json(snapshot.annotations.as_ref())?;
        let now = Utc::now().timestamp_millis();
        self.conn()?.execute(
            "INSERT INTO configmaps (name, namespace, data, labels, annotations,
                                     owner_name, owner_namespace, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (name, namespace, owner_namespace, owner_name) DO UPDATE SET
                 data = excluded.data,
                 labels = excluded.labels,
                 annotations = excluded.annotations,
                 updated_at = excluded.updated_at",
            params![snapshot.name, snapshot.namespace, data, labels, annotations, owner.name, owner.namespace, now],
        )?;
        histogram!("persist_upsert_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_upsert_total", 1u64);
        Ok(())
    }

    fn delete(&self, name: &str, namespace: &str, owner: &Owner) -> Result<(), PersistError> {
        let started = std::time::Instant::now();
        let n = self.conn()?.execute(
            "DELETE FROM configmaps
             WHERE name = ?1 AND namespace = ?2 AND owner_name = ?3 AND owner_namespace = ?4",
            params![name, namespace, owner.name, owner.namespace],
        )?;
        histogram!("persist_delete_ms", started.elapsed().as_secs_f64() * 1000.0);
        if n == 0 {
            return Err(PersistError::NotFound);
        }
        counter!("persist_delete_total", 1u64);
        Ok(())
    }

    fn query(&self, owner: &Owner) -> Result<Vec<ConfigMapRecord>, PersistError> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, name, namespace, data, labels, annotations, created_at, updated_at
             FROM configmaps
             WHERE owner_name = ?1 AND owner_namespace = ?2
             ORDER BY created_at DESC, id DESC",
        )?;
        let mut rows = stmt.query(params![owner.name, owner.namespace])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let data: String = row.get(3)?;
            out.push(ConfigMapRecord {
                id: row.get(0)?,
                snapshot: Snapshot {
                    name: row.get(1)?,
                    namespace: row.get(2)?,
                    data: serde_json::from_str(&data)?,
                    labels: from_json(row.get(4)?)?,
                    annotations: from_json(row.get(5)?)?,
                },
                owner: owner.clone(),
                created_at: ts(row.get(6)?),
                updated_at: ts(row.get(7)?),
            });
        }
        histogram!("persist_query_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn ping(&self) -> Result<(), PersistError> {
        let one: Option<i64> = self.conn()?.query_row("SELECT 1", [], |r| r.get(0)).optional()?;
        match one {
            Some(1) => Ok(()),
            _ => Err(PersistError::Unavailable("liveness query returned no row".into())),
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".mirror");
        let _ = std::fs::create_dir_all(&p);
        p.push("mirror.db");
        return p.to_string_lossy().to_string();
    }
    "mirror.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let s = SqliteStore::open(":memory:").unwrap();
        s.init_schema().unwrap();
        s
    }

    fn snap(name: &str, value: &str) -> Snapshot {
        Snapshot {
            name: name.into(),
            namespace: "app-source".into(),
            data: BTreeMap::from([("key".to_string(), value.to_string())]),
            labels: Some(BTreeMap::from([("app".to_string(), "myapp".to_string())])),
            annotations: None,
        }
    }

    #[test]
    fn init_schema_is_idempotent() {
        let s = store();
        s.init_schema().unwrap();
        s.init_schema().unwrap();
        s.ping().unwrap();
    }

    #[test]
    fn upsert_overwrites_payload_and_keeps_identity() {
        let s = store();
        let owner = Owner::new("mirror", "app-source");
        s.upsert(&owner, &snap("app-config", "v1")).unwrap();
        let first = s.query(&owner).unwrap();
        assert_eq!(first.len(), 1);

        s.upsert(&owner, &snap("app-config", "v2")).unwrap();
        let second = s.query(&owner).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].created_at, first[0].created_at);
        assert!(second[0].updated_at >= first[0].updated_at);
        assert_eq!(second[0].snapshot.data["key"], "v2");
        assert_eq!(second[0].snapshot.annotations, None);
    }

    #[test]
    fn delete_distinguishes_not_found() {
        let s = store();
        let owner = Owner::new("mirror", "app-source");
        s.upsert(&owner, &snap("a", "1")).unwrap();
        s.delete("a", "app-source", &owner).unwrap();
        assert!(s.delete("a", "app-source", &owner).unwrap_err().is_not_found());
        // another owner's row with the same object key is untouched
        let other = Owner::new("other", "app-source");
        s.upsert(&other, &snap("a", "1")).unwrap();
        assert!(s.delete("a", "app-source", &owner).unwrap_err().is_not_found());
        assert_eq!(s.query(&other).unwrap().len(), 1);
    }

    #[test]
    fn query_returns_newest_first_per_owner() {
        let s = store();
        let owner = Owner::new("mirror", "app-source");
        for name in ["a", "b", "c"] {
            s.upsert(&owner, &snap(name, "x")).unwrap();
        }
        s.upsert(&Owner::new("mirror", "elsewhere"), &snap("z", "x")).unwrap();
        let names: Vec<_> = s.query(&owner).unwrap().into_iter().map(|r| r.snapshot.name).collect();
        assert_eq!(names, vec!["c", "b", "a"]);
    }
}
