//! SQLite-backed persistence for workflows, executions, schedules and logs.
//! Survives restarts and is shared by every instance pointing at the same file.
//!
//! Each row stores the full entity as JSON next to the columns used for
//! filtering. The log table's UNIQUE `dedup_key` lets only one instance
//! claim a scheduled occurrence.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde::de::DeserializeOwned;

use flowcron_core::error::{FlowError, Result};
use flowcron_core::traits::{Entity, Repository};
use flowcron_core::types::{ExecutionRecord, WorkflowDefinition};

use crate::logbook::ScheduleLogEntry;
use crate::schedule::ScheduleDefinition;

pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open or create the database, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path).map_err(|e| db_error("DB open", e))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| db_error("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self> {
        // other instances may hold the write lock briefly
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|e| db_error("DB open", e))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                data TEXT NOT NULL                 -- JSON: WorkflowDefinition
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                deleted INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 0,
                next_fire_at TEXT,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schedule_logs (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,              -- running, completed, failed, timeout, cancelled
                trigger_type TEXT NOT NULL,        -- scheduled, manual, retry
                instance_id TEXT NOT NULL,
                dedup_key TEXT UNIQUE,             -- schedule_id@scheduled_time, scheduled only
                started_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_schedule ON schedule_logs(schedule_id, status);
         ",
            )
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<R>,
    ) -> Result<R> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| FlowError::Database("connection lock poisoned".into()))?;
        f(&conn).map_err(|e| db_error("SQLite", e))
    }

    fn get_row<T: Table>(&self, id: &str) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {} WHERE id = ?1", T::TABLE);
        let data: Option<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })?;
        data.map(|json| serde_json::from_str(&json).map_err(FlowError::from))
            .transpose()
    }

    fn list_rows<T: Table>(&self, filter: &T::Filter) -> Result<Vec<T>> {
        let conditions = T::conditions(filter);
        let mut sql = format!("SELECT data FROM {}", T::TABLE);
        if !conditions.is_empty() {
            let clauses: Vec<String> = conditions
                .iter()
                .enumerate()
                .map(|(i, (column, _))| format!("{column} = ?{}", i + 1))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY rowid");

        let params: Vec<SqlValue> = conditions.into_iter().map(|(_, v)| v).collect();
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?;
            rows.collect()
        })?;

        let mut entities = Vec::with_capacity(rows.len());
        for json in rows {
            let entity: T = serde_json::from_str(&json)?;
            if entity.matches(filter) {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    fn insert_row<T: Table>(&self, entity: &T) -> Result<()> {
        let columns = entity.columns();
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        let placeholders: Vec<String> = (1..=columns.len() + 2).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {} (id, data, {}) VALUES ({})",
            T::TABLE,
            names.join(", "),
            placeholders.join(", ")
        );
        let mut params = vec![SqlValue::Text(entity.id().to_string()), SqlValue::Text(serde_json::to_string(entity)?)];
        params.extend(columns.into_iter().map(|(_, v)| v));

        let conn = self
            .conn
            .lock()
            .map_err(|_| FlowError::Database("connection lock poisoned".into()))?;
        match conn.execute(&sql, rusqlite::params_from_iter(params.iter())) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(FlowError::Duplicate(format!("{} {}", T::KIND, entity.id())))
            }
            Err(e) => Err(db_error("Insert", e)),
        }
    }

    fn update_row<T: Table>(&self, entity: &T) -> Result<()> {
        let columns = entity.columns();
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{name} = ?{}", i + 3))
            .collect();
        let sql = format!(
            "UPDATE {} SET data = ?2, {} WHERE id = ?1",
            T::TABLE,
            assignments.join(", ")
        );
        let mut params = vec![SqlValue::Text(entity.id().to_string()), SqlValue::Text(serde_json::to_string(entity)?)];
        params.extend(columns.into_iter().map(|(_, v)| v));

        let changed = self.with_conn(|conn| conn.execute(&sql, rusqlite::params_from_iter(params.iter())))?;
        if changed == 0 {
            return Err(FlowError::Database(format!("{} {} not found", T::KIND, entity.id())));
        }
        Ok(())
    }
}

fn db_error(context: &str, e: rusqlite::Error) -> FlowError {
    FlowError::Database(format!("{context}: {e}"))
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn flag(b: bool) -> SqlValue {
    SqlValue::Integer(b as i64)
}

fn opt_text(s: Option<String>) -> SqlValue {
    s.map(SqlValue::Text).unwrap_or(SqlValue::Null)
}

/// Row mapping for one entity type.
pub trait Table: Entity + Serialize + DeserializeOwned {
    const TABLE: &'static str;

    /// Indexed columns besides `id` and `data`.
    fn columns(&self) -> Vec<(&'static str, SqlValue)>;

    /// Equality conditions pushed into SQL. `Entity::matches` still runs
    /// on every loaded row.
    fn conditions(filter: &Self::Filter) -> Vec<(&'static str, SqlValue)>;
}

impl Table for WorkflowDefinition {
    const TABLE: &'static str = "workflows";

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![("name", text(&self.name)), ("enabled", flag(self.enabled))]
    }

    fn conditions(filter: &Self::Filter) -> Vec<(&'static str, SqlValue)> {
        filter.enabled.map(|e| ("enabled", flag(e))).into_iter().collect()
    }
}

impl Table for ExecutionRecord {
    const TABLE: &'static str = "executions";

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("workflow_id", text(&self.workflow_id)),
            ("status", text(self.status.as_str())),
            ("started_at", SqlValue::Text(self.started_at.to_rfc3339())),
        ]
    }

    fn conditions(filter: &Self::Filter) -> Vec<(&'static str, SqlValue)> {
        let mut c = Vec::new();
        if let Some(w) = &filter.workflow_id {
            c.push(("workflow_id", text(w)));
        }
        if let Some(s) = filter.status {
            c.push(("status", text(s.as_str())));
        }
        c
    }
}

impl Table for ScheduleDefinition {
    const TABLE: &'static str = "schedules";

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("name", text(&self.name)),
            ("workflow_id", text(&self.workflow_id)),
            ("enabled", flag(self.enabled)),
            ("status", text(self.status.as_str())),
            ("deleted", flag(self.deleted)),
            ("priority", SqlValue::Integer(self.priority as i64)),
            ("next_fire_at", opt_text(self.next_fire_at.map(|t| t.to_rfc3339()))),
        ]
    }

    fn conditions(filter: &Self::Filter) -> Vec<(&'static str, SqlValue)> {
        let mut c = Vec::new();
        if !filter.include_deleted {
            c.push(("deleted", flag(false)));
        }
        if let Some(e) = filter.enabled {
            c.push(("enabled", flag(e)));
        }
        if let Some(s) = filter.status {
            c.push(("status", text(s.as_str())));
        }
        if let Some(w) = &filter.workflow_id {
            c.push(("workflow_id", text(w)));
        }
        c
    }
}

impl Table for ScheduleLogEntry {
    const TABLE: &'static str = "schedule_logs";

    fn columns(&self) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("schedule_id", text(&self.schedule_id)),
            ("workflow_id", text(&self.workflow_id)),
            ("status", text(self.status.as_str())),
            ("trigger_type", text(self.trigger_type.as_str())),
            ("instance_id", text(&self.instance_id)),
            ("dedup_key", opt_text(self.dedup_key())),
            ("started_at", SqlValue::Text(self.started_at.to_rfc3339())),
        ]
    }

    fn conditions(filter: &Self::Filter) -> Vec<(&'static str, SqlValue)> {
        let mut c = Vec::new();
        if let Some(s) = &filter.schedule_id {
            c.push(("schedule_id", text(s)));
        }
        if let Some(w) = &filter.workflow_id {
            c.push(("workflow_id", text(w)));
        }
        if let Some(s) = filter.status {
            c.push(("status", text(s.as_str())));
        }
        if let Some(t) = filter.trigger_type {
            c.push(("trigger_type", text(t.as_str())));
        }
        if let Some(i) = &filter.instance_id {
            c.push(("instance_id", text(i)));
        }
        c
    }
}

#[async_trait]
impl<T: Table> Repository<T> for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<T>> {
        self.get_row(id)
    }

    async fn list(&self, filter: &T::Filter) -> Result<Vec<T>> {
        self.list_rows(filter)
    }

    async fn save(&self, entity: &T) -> Result<()> {
        self.insert_row(entity)
    }

    async fn update(&self, entity: &T) -> Result<()> {
        self.update_row(entity)
    }
}
