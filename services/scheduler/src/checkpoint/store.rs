//! Checkpoint store backends.

use std::collections::BTreeMap;
use std::path::Path;

use batchd_reconcile::RecordDigest;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::{CheckpointRecord, CheckpointResult, CheckpointStore, ObjectType};

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    conn: Connection,
}

impl SqliteCheckpointStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CheckpointResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> CheckpointResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CheckpointResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint (
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                attr TEXT NOT NULL,
                value TEXT NOT NULL,
                digest TEXT NOT NULL,
                PRIMARY KEY (object_type, object_id, attr)
            );
            "#,
        )?;
        debug!("checkpoint schema initialized");
        Ok(())
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) -> CheckpointResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn persist(&mut self, record: &CheckpointRecord) -> CheckpointResult<()> {
        let value = serde_json::to_string(&record.value)?;
        self.conn.execute(
            r#"
            INSERT INTO checkpoint (object_type, object_id, attr, value, digest)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(object_type, object_id, attr) DO UPDATE SET
                value = excluded.value,
                digest = excluded.digest
            "#,
            params![
                record.object_type.as_str(),
                record.object_id,
                record.attr,
                value,
                record.digest().as_str(),
            ],
        )?;
        Ok(())
    }

    fn remove(&mut self, object_type: ObjectType, object_id: &str) -> CheckpointResult<()> {
        self.conn.execute(
            "DELETE FROM checkpoint WHERE object_type = ?1 AND object_id = ?2",
            params![object_type.as_str(), object_id],
        )?;
        Ok(())
    }

    fn load_all(&self) -> CheckpointResult<Vec<CheckpointRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT object_type, object_id, attr, value, digest FROM checkpoint
             ORDER BY object_type, object_id, attr",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (kind, object_id, attr, raw, digest) = row?;
            let Some(object_type) = ObjectType::parse(&kind) else {
                warn!(object_type = %kind, object_id = %object_id, "unknown checkpoint object type");
                continue;
            };
            let value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(object_id = %object_id, attr = %attr, error = %e, "unparsable checkpoint record");
                    continue;
                }
            };
            let record = CheckpointRecord {
                object_type,
                object_id,
                attr,
                value,
            };
            if let Err(e) = RecordDigest::from_stored(digest).verify(&record.key(), &record.value) {
                warn!(error = %e, "checkpoint record skipped");
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }
}

/// In-memory checkpoint store for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    rows: BTreeMap<(ObjectType, String, String), (serde_json::Value, RecordDigest)>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replaces a stored value without updating its digest.
    pub fn tamper(&mut self, object_type: ObjectType, object_id: &str, attr: &str, value: serde_json::Value) {
        let key = (object_type, object_id.to_string(), attr.to_string());
        if let Some(row) = self.rows.get_mut(&key) {
            row.0 = value;
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn persist(&mut self, record: &CheckpointRecord) -> CheckpointResult<()> {
        self.rows.insert(
            (record.object_type, record.object_id.clone(), record.attr.clone()),
            (record.value.clone(), record.digest()),
        );
        Ok(())
    }

    fn remove(&mut self, object_type: ObjectType, object_id: &str) -> CheckpointResult<()> {
        self.rows
            .retain(|(t, id, _), _| !(*t == object_type && id == object_id));
        Ok(())
    }

    fn load_all(&self) -> CheckpointResult<Vec<CheckpointRecord>> {
        let mut out = Vec::with_capacity(self.rows.len());
        for ((object_type, object_id, attr), (value, digest)) in &self.rows {
            let record = CheckpointRecord {
                object_type: *object_type,
                object_id: object_id.clone(),
                attr: attr.clone(),
                value: value.clone(),
            };
            if let Err(e) = digest.verify(&record.key(), &record.value) {
                warn!(error = %e, "checkpoint record skipped");
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, attr: &str, value: serde_json::Value) -> CheckpointRecord {
        CheckpointRecord {
            object_type: ObjectType::Job,
            object_id: id.into(),
            attr: attr.into(),
            value,
        }
    }

    #[test]
    fn test_sqlite_persist_load_and_overwrite() {
        let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.persist(&record("j1", "start_count", json!(1))).unwrap();
        store.persist(&record("j1", "start_count", json!(2))).unwrap();
        store.persist(&record("j2", "start_count", json!(0))).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, json!(2));

        store.remove(ObjectType::Job, "j1").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_sqlite_skips_tampered_rows() {
        let mut store = SqliteCheckpointStore::open_in_memory().unwrap();
        store.persist(&record("j1", "start_count", json!(1))).unwrap();
        store.persist(&record("j2", "start_count", json!(1))).unwrap();
        store
            .execute_raw("UPDATE checkpoint SET value = '7' WHERE object_id = 'j1'")
            .unwrap();
        store
            .execute_raw("UPDATE checkpoint SET value = 'not json' WHERE object_id = 'j2'")
            .unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.db");
        {
            let mut store = SqliteCheckpointStore::open(&path).unwrap();
            store.persist(&record("j1", "holds", json!({"batch": true}))).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.load_all().unwrap()[0].attr, "holds");
    }

    #[test]
    fn test_memory_store_detects_tampering() {
        let mut store = MemoryCheckpointStore::new();
        store.persist(&record("j1", "start_count", json!(1))).unwrap();
        store.tamper(ObjectType::Job, "j1", "start_count", json!(5));
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }
}
