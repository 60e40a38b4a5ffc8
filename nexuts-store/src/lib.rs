//! The small relational registry store (spec.md §6 "Local SQL store"),
//! grounded on `original_source/Nexuts/persistence/sqlite_storage.py`'s
//! `sentry`/`instance` tables. Used by the IC to remember Sentry/worker
//! registrations across restarts (out of scope of the spec's "core" but
//! named explicitly in §6 as an external collaborator whose schema is
//! given).
//!
//! `rusqlite` (bundled) is the one genuinely new ambient dependency this
//! crate introduces relative to the teacher's stack — see DESIGN.md.

pub mod error;

use error::{StoreError, StoreResult};
use nexuts_common::PodType;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SentryRecord {
    pub sentry_id: String,
    pub ip: String,
    pub port: u16,
    pub last_update: f64,
}

#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: i64,
    pub sentry_id: String,
    pub instance_id: String,
    pub pod_type: PodType,
    pub service_port: u16,
    pub tp_size: u32,
    pub base_gpu_id: u32,
    pub step: u32,
    pub status: bool,
    pub last_update: f64,
}

/// Wraps a single SQLite connection behind a mutex (spec.md §6 "two tables"
/// schema exactly, mirroring the Python original's `threading.Lock` guard
/// around one shared `sqlite3.Connection`).
pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Fatal(e.to_string()))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sentry (
                sentry_id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                last_update REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS instance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sentry_id TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                pod_type TEXT NOT NULL,
                service_port INTEGER NOT NULL,
                tp_size INTEGER NOT NULL,
                base_gpu_id INTEGER NOT NULL,
                step INTEGER NOT NULL,
                status INTEGER NOT NULL,
                last_update REAL NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE sentry (
                sentry_id TEXT PRIMARY KEY, ip TEXT NOT NULL, port INTEGER NOT NULL, last_update REAL NOT NULL
            );
            CREATE TABLE instance (
                id INTEGER PRIMARY KEY AUTOINCREMENT, sentry_id TEXT NOT NULL, instance_id TEXT NOT NULL,
                pod_type TEXT NOT NULL, service_port INTEGER NOT NULL, tp_size INTEGER NOT NULL,
                base_gpu_id INTEGER NOT NULL, step INTEGER NOT NULL, status INTEGER NOT NULL, last_update REAL NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert_sentry(&self, sentry_id: &str, ip: &str, port: u16) -> StoreResult<()> {
        let now = now_secs();
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "INSERT INTO sentry(sentry_id, ip, port, last_update) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(sentry_id) DO UPDATE SET ip=excluded.ip, port=excluded.port, last_update=excluded.last_update",
            params![sentry_id, ip, port, now],
        )?;
        Ok(())
    }

    pub fn delete_sentry(&self, sentry_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute("DELETE FROM sentry WHERE sentry_id = ?1", params![sentry_id])?;
        conn.execute("DELETE FROM instance WHERE sentry_id = ?1", params![sentry_id])?;
        Ok(())
    }

    pub fn upsert_instance(
        &self,
        sentry_id: &str,
        instance_id: &str,
        pod_type: PodType,
        service_port: u16,
        tp_size: u32,
        base_gpu_id: u32,
        step: u32,
        status: bool,
    ) -> StoreResult<()> {
        let now = now_secs();
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM instance WHERE sentry_id = ?1 AND instance_id = ?2",
                params![sentry_id, instance_id],
                |row| row.get(0),
            )
            .ok();
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE instance SET pod_type=?1, service_port=?2, tp_size=?3, base_gpu_id=?4, step=?5, status=?6, last_update=?7 WHERE id=?8",
                    params![pod_type.to_string(), service_port, tp_size, base_gpu_id, step, status as i64, now, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO instance(sentry_id, instance_id, pod_type, service_port, tp_size, base_gpu_id, step, status, last_update)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![sentry_id, instance_id, pod_type.to_string(), service_port, tp_size, base_gpu_id, step, status as i64, now],
                )?;
            }
        }
        Ok(())
    }

    pub fn set_instance_status(&self, sentry_id: &str, instance_id: &str, status: bool) -> StoreResult<()> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let updated = conn.execute(
            "UPDATE instance SET status=?1, last_update=?2 WHERE sentry_id=?3 AND instance_id=?4",
            params![status as i64, now_secs(), sentry_id, instance_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!(
                "instance {instance_id} (sentry {sentry_id}) not registered"
            )));
        }
        Ok(())
    }

    pub fn delete_instance(&self, sentry_id: &str, instance_id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "DELETE FROM instance WHERE sentry_id=?1 AND instance_id=?2",
            params![sentry_id, instance_id],
        )?;
        Ok(())
    }

    pub fn load_all_sentries(&self) -> StoreResult<Vec<SentryRecord>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let mut stmt = conn.prepare("SELECT sentry_id, ip, port, last_update FROM sentry")?;
        let rows = stmt.query_map([], |row| {
            Ok(SentryRecord {
                sentry_id: row.get(0)?,
                ip: row.get(1)?,
                port: row.get(2)?,
                last_update: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn load_all_instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, sentry_id, instance_id, pod_type, service_port, tp_size, base_gpu_id, step, status, last_update FROM instance",
        )?;
        let rows = stmt.query_map([], |row| {
            let pod_type: String = row.get(3)?;
            Ok(InstanceRecord {
                id: row.get(0)?,
                sentry_id: row.get(1)?,
                instance_id: row.get(2)?,
                pod_type: if pod_type == "decode" { PodType::Decode } else { PodType::Prefill },
                service_port: row.get(4)?,
                tp_size: row.get(5)?,
                base_gpu_id: row.get(6)?,
                step: row.get(7)?,
                status: row.get::<_, i64>(8)? != 0,
                last_update: row.get(9)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn instances_for_sentry(&self, sentry_id: &str) -> StoreResult<Vec<InstanceRecord>> {
        Ok(self
            .load_all_instances()?
            .into_iter()
            .filter(|i| i.sentry_id == sentry_id)
            .collect())
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_load_round_trips() {
        let reg = Registry::in_memory().unwrap();
        reg.upsert_sentry("s1", "10.0.0.1", 9001).unwrap();
        reg.upsert_instance("s1", "w1", PodType::Prefill, 8000, 1, 0, 1, true).unwrap();

        let sentries = reg.load_all_sentries().unwrap();
        assert_eq!(sentries.len(), 1);
        let instances = reg.instances_for_sentry("s1").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, "w1");
    }

    #[test]
    fn set_status_on_unknown_instance_is_not_found() {
        let reg = Registry::in_memory().unwrap();
        let err = reg.set_instance_status("s1", "missing", false).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn delete_sentry_cascades_to_instances() {
        let reg = Registry::in_memory().unwrap();
        reg.upsert_sentry("s1", "10.0.0.1", 9001).unwrap();
        reg.upsert_instance("s1", "w1", PodType::Decode, 8000, 1, 0, 1, true).unwrap();
        reg.delete_sentry("s1").unwrap();
        assert!(reg.load_all_sentries().unwrap().is_empty());
        assert!(reg.instances_for_sentry("s1").unwrap().is_empty());
    }
}
