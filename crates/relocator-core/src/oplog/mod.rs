//! Operation Log
//!
//! Durable history of operations and their actions in SQLite. Operations that
//! are still running are also kept in memory and served from there.

mod record;

pub use record::{
    ActionKind, OperationAction, OperationId, OperationKind, OperationRecord, OperationStatus,
};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{RelocatorError, Result};

pub const HISTORY_DB: &str = "history.db";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

pub struct OperationLog {
    db_path: PathBuf,
    conn: Mutex<Connection>,
    /// Operations begun but not yet completed
    active: Mutex<HashMap<OperationId, OperationRecord>>,
    retention_days: u32,
}

impl OperationLog {
    /// Open (or create) `<base_dir>/history.db`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        Self::open_with_retention(base_dir, DEFAULT_RETENTION_DAYS)
    }

    pub fn open_with_retention(base_dir: &Path, retention_days: u32) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let db_path = base_dir.join(HISTORY_DB);
        let conn = Connection::open(&db_path)?;
        let log = Self {
            db_path,
            conn: Mutex::new(conn),
            active: Mutex::new(HashMap::new()),
            retention_days: retention_days.max(1),
        };
        log.migrate()?;
        Ok(log)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS operations (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              kind TEXT NOT NULL,
              description TEXT NOT NULL,
              started_at_ms INTEGER NOT NULL,
              ended_at_ms INTEGER,
              success INTEGER
            );

            CREATE TABLE IF NOT EXISTS actions (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              operation_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              description TEXT NOT NULL,
              at_ms INTEGER NOT NULL,
              before_value TEXT,
              after_value TEXT,
              rollback_capable INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_started ON operations(started_at_ms);
            CREATE INDEX IF NOT EXISTS idx_actions_operation ON actions(operation_id, seq);
            "#,
        )?;
        Ok(())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - Duration::days(i64::from(self.retention_days))
    }

    pub fn begin_operation(
        &self,
        kind: OperationKind,
        description: impl Into<String>,
    ) -> Result<OperationId> {
        let record = OperationRecord {
            id: OperationId::new(),
            kind,
            description: description.into(),
            started_at: Utc::now(),
            ended_at: None,
            success: None,
            actions: Vec::new(),
        };

        self.conn.lock().execute(
            "INSERT INTO operations(id, kind, description, started_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id.as_str(),
                kind.as_str(),
                record.description,
                record.started_at.timestamp_millis()
            ],
        )?;

        let id = record.id.clone();
        debug!(operation = %id, kind = %kind, "operation started");
        self.active.lock().insert(id.clone(), record);
        Ok(id)
    }

    pub fn log_action(&self, id: &OperationId, action: OperationAction) -> Result<()> {
        let mut active = self.active.lock();
        let conn = self.conn.lock();
        if !active.contains_key(id) && !Self::exists(&conn, id)? {
            return Err(RelocatorError::OperationNotFound {
                id: id.to_string(),
            });
        }

        conn.execute(
            "INSERT INTO actions(operation_id, kind, description, at_ms, before_value, after_value, rollback_capable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                action.kind.as_str(),
                action.description,
                action.timestamp.timestamp_millis(),
                action.before,
                action.after,
                action.rollback_capable
            ],
        )?;

        if let Some(record) = active.get_mut(id) {
            record.actions.push(action);
        }
        Ok(())
    }

    pub fn complete_operation(&self, id: &OperationId, success: bool) -> Result<()> {
        let ended = Utc::now();
        let changed = self.conn.lock().execute(
            "UPDATE operations SET ended_at_ms = ?1, success = ?2 WHERE id = ?3",
            params![ended.timestamp_millis(), success, id.as_str()],
        )?;
        if changed == 0 {
            return Err(RelocatorError::OperationNotFound {
                id: id.to_string(),
            });
        }
        self.active.lock().remove(id);
        info!(operation = %id, success, "operation completed");
        Ok(())
    }

    /// Active set first, then the database.
    pub fn get_operation(&self, id: &OperationId) -> Result<Option<OperationRecord>> {
        if let Some(record) = self.active.lock().get(id) {
            return Ok(Some(record.clone()));
        }
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, kind, description, started_at_ms, ended_at_ms, success
                 FROM operations WHERE id = ?1",
                params![id.as_str()],
                OperationRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(Self::hydrate(&conn, row)?)),
            None => Ok(None),
        }
    }

    /// Newest first. Never reaches back past the retention window.
    pub fn get_history(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<OperationRecord>> {
        let cutoff = self.retention_cutoff();
        let since = since.map_or(cutoff, |s| s.max(cutoff));
        let limit = limit.map_or(-1, |l| l as i64);

        // Same lock order as log_action: active set, then connection.
        let active = self.active.lock();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, description, started_at_ms, ended_at_ms, success
             FROM operations WHERE started_at_ms >= ?1
             ORDER BY started_at_ms DESC, seq DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![since.timestamp_millis(), limit],
                OperationRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = OperationId::from_string(row.id.clone());
            match active.get(&id) {
                Some(record) => records.push(record.clone()),
                None => records.push(Self::hydrate(&conn, row)?),
            }
        }
        Ok(records)
    }

    /// Delete finished operations older than the retention window.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = self.retention_cutoff().timestamp_millis();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM actions WHERE operation_id IN (
               SELECT id FROM operations WHERE started_at_ms < ?1 AND ended_at_ms IS NOT NULL
             )",
            params![cutoff],
        )?;
        let removed = tx.execute(
            "DELETE FROM operations WHERE started_at_ms < ?1 AND ended_at_ms IS NOT NULL",
            params![cutoff],
        )?;
        tx.commit()?;
        if removed > 0 {
            info!(removed, "purged expired operations");
        }
        Ok(removed)
    }

    fn exists(conn: &Connection, id: &OperationId) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM operations WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn hydrate(conn: &Connection, row: OperationRow) -> Result<OperationRecord> {
        let mut stmt = conn.prepare(
            "SELECT kind, description, at_ms, before_value, after_value, rollback_capable
             FROM actions WHERE operation_id = ?1 ORDER BY seq ASC",
        )?;
        let action_rows = stmt
            .query_map(params![row.id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, bool>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut actions = Vec::with_capacity(action_rows.len());
        for (kind, description, at_ms, before, after, rollback_capable) in action_rows {
            actions.push(OperationAction {
                kind: ActionKind::parse(&kind).ok_or_else(|| {
                    RelocatorError::InvalidArgument(format!("unknown action kind: {}", kind))
                })?,
                description,
                timestamp: from_ms(at_ms),
                before,
                after,
                rollback_capable,
            });
        }

        Ok(OperationRecord {
            kind: OperationKind::parse(&row.kind).ok_or_else(|| {
                RelocatorError::InvalidArgument(format!("unknown operation kind: {}", row.kind))
            })?,
            id: OperationId::from_string(row.id),
            description: row.description,
            started_at: from_ms(row.started_at_ms),
            ended_at: row.ended_at_ms.map(from_ms),
            success: row.success,
            actions,
        })
    }
}

struct OperationRow {
    id: String,
    kind: String,
    description: String,
    started_at_ms: i64,
    ended_at_ms: Option<i64>,
    success: Option<bool>,
}

impl OperationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            description: row.get(2)?,
            started_at_ms: row.get(3)?,
            ended_at_ms: row.get(4)?,
            success: row.get(5)?,
        })
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
