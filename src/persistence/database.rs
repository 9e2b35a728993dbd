//! SQLite database implementation for persistent storage

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::{HistoryEntry, InstanceStore, LifecycleEvent, StoreError};
use crate::core::{
    HealthStatus, Instance, InstanceConfig, InstanceId, InstanceStatus, InstanceUpdate,
    NewInstance, Settings,
};

const INSTANCE_COLUMNS: &str = "id, name, container_ref, image, port, status, health, config, \
     created_at, updated_at, last_health_check_at";

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

/// Raw column values of an `instances` row, decoded outside the rusqlite closure
struct InstanceRow {
    id: i64,
    name: String,
    container_ref: Option<String>,
    image: String,
    port: Option<u16>,
    status: String,
    health: String,
    config: String,
    created_at: String,
    updated_at: String,
    last_health_check_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            container_ref: row.get(2)?,
            image: row.get(3)?,
            port: row.get(4)?,
            status: row.get(5)?,
            health: row.get(6)?,
            config: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            last_health_check_at: row.get(10)?,
        })
    }

    fn into_instance(self) -> Result<Instance, StoreError> {
        let config: InstanceConfig = serde_json::from_str(&self.config)?;
        Ok(Instance {
            id: InstanceId(self.id),
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            health: self.health.parse().map_err(StoreError::Corrupt)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            last_health_check_at: self
                .last_health_check_at
                .as_deref()
                .map(parse_time)
                .transpose()?,
            name: self.name,
            container_ref: self.container_ref,
            image: self.image,
            port: self.port,
            config,
        })
    }
}

/// Fixed-width UTC timestamps so stored values compare lexically
fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{value}': {e}")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Open the database at the default location
    pub fn new() -> Result<Self, StoreError> {
        Self::open(Self::default_path())
    }

    /// Default database file path
    pub fn default_path() -> PathBuf {
        Settings::default().database_path()
    }

    /// Open (creating if needed) a database file and initialize its schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // WAL for concurrent readers; returns a row, so it goes through query_row
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Journal mode {}", mode);

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        info!("Database opened at {:?}", path);
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.initialize()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Instances table
            CREATE TABLE IF NOT EXISTS instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                container_ref TEXT,
                image TEXT NOT NULL,
                port INTEGER,
                status TEXT NOT NULL,
                health TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_health_check_at TEXT
            );

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_instance
                ON instance_history (instance_id);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'orchestrator_settings'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => {
                let mut settings: Settings = serde_json::from_str(&json)?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('orchestrator_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === History ===

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize, StoreError> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - TimeDelta::try_days(i64::from(retention_days)).unwrap_or_else(|| TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![format_time(cutoff)],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }

    fn fetch_one(
        conn: &Connection,
        filter: &str,
        param: Value,
    ) -> Result<Option<Instance>, StoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE {filter}");
        conn.query_row(&sql, [param], InstanceRow::from_row)
            .optional()?
            .map(InstanceRow::into_instance)
            .transpose()
    }
}

impl InstanceStore for Database {
    fn create_instance(&self, new: &NewInstance) -> Result<Instance, StoreError> {
        let conn = self.conn()?;
        let now = format_time(Utc::now());
        let config = serde_json::to_string(&new.config)?;

        conn.execute(
            r#"
            INSERT INTO instances
            (name, container_ref, image, port, status, health, config, created_at, updated_at)
            VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            "#,
            params![
                new.name,
                new.image,
                new.port,
                InstanceStatus::Created.as_str(),
                HealthStatus::Unknown.as_str(),
                config,
                now,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(new.name.clone())
            } else {
                e.into()
            }
        })?;

        let id = InstanceId(conn.last_insert_rowid());
        debug!("Instance {} ({}) saved", new.name, id);
        Self::fetch_one(&conn, "id = ?1", Value::Integer(id.0))?
            .ok_or_else(|| StoreError::Corrupt(format!("instance {id} vanished after insert")))
    }

    fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_one(&conn, "id = ?1", Value::Integer(id.0))
    }

    fn get_instance_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError> {
        let conn = self.conn()?;
        Self::fetch_one(&conn, "name = ?1", Value::Text(name.to_string()))
    }

    fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY id"
        ))?;
        let rows = stmt.query_map([], InstanceRow::from_row)?;

        let mut result = Vec::new();
        for row in rows {
            match row?.into_instance() {
                Ok(instance) => result.push(instance),
                Err(e) => warn!("Skipping unreadable instance record: {}", e),
            }
        }
        Ok(result)
    }

    fn update_instance(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
    ) -> Result<Option<Instance>, StoreError> {
        let conn = self.conn()?;

        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        let mut values: Vec<Value> = vec![Value::Text(format_time(Utc::now()))];

        if let Some(container_ref) = &update.container_ref {
            sets.push("container_ref = ?");
            values.push(Value::Text(container_ref.clone()));
        }
        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(health) = update.health {
            sets.push("health = ?");
            values.push(Value::Text(health.as_str().to_string()));
        }
        if let Some(config) = &update.config {
            sets.push("config = ?");
            values.push(Value::Text(serde_json::to_string(config)?));
            sets.push("image = ?");
            values.push(Value::Text(config.image.clone()));
        }
        if let Some(checked_at) = update.last_health_check_at {
            sets.push("last_health_check_at = ?");
            values.push(Value::Text(format_time(checked_at)));
        }
        values.push(Value::Integer(id.0));

        let sql = format!("UPDATE instances SET {} WHERE id = ?", sets.join(", "));
        let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
        if changed == 0 {
            return Ok(None);
        }
        Self::fetch_one(&conn, "id = ?1", Value::Integer(id.0))
    }

    fn delete_instance(&self, id: InstanceId) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM instances WHERE id = ?1", params![id.0])?;
        debug!("Instance {} deleted", id);
        Ok(changed > 0)
    }

    fn record_event(
        &self,
        id: InstanceId,
        event: LifecycleEvent,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![id.0, event.as_str(), format_time(Utc::now()), details],
        )?;
        Ok(())
    }

    fn instance_history(&self, id: InstanceId) -> Result<Vec<HistoryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history \
             WHERE instance_id = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (event, at, details) = row?;
            result.push(HistoryEntry {
                instance_id: id,
                event,
                at: parse_time(&at)?,
                details,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance(name: &str, port: u16) -> NewInstance {
        NewInstance {
            name: name.to_string(),
            image: "app:latest".to_string(),
            port: Some(port),
            config: InstanceConfig::new("app:latest"),
        }
    }

    #[test]
    fn create_and_fetch() {
        let db = Database::open_in_memory().unwrap();
        let created = db.create_instance(&new_instance("demo", 9000)).unwrap();

        assert_eq!(created.status, InstanceStatus::Created);
        assert_eq!(created.health, HealthStatus::Unknown);
        assert_eq!(created.container_ref, None);

        let by_id = db.get_instance(created.id).unwrap().unwrap();
        let by_name = db.get_instance_by_name("demo").unwrap().unwrap();
        assert_eq!(by_id, created);
        assert_eq!(by_name.id, created.id);

        assert!(db.get_instance(InstanceId(999)).unwrap().is_none());
        assert!(db.get_instance_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_name_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.create_instance(&new_instance("demo", 9000)).unwrap();
        let err = db.create_instance(&new_instance("demo", 9001)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(name) if name == "demo"));
        assert_eq!(db.list_instances().unwrap().len(), 1);
    }

    #[test]
    fn partial_update_touches_only_given_fields() {
        let db = Database::open_in_memory().unwrap();
        let created = db.create_instance(&new_instance("demo", 9000)).unwrap();

        let updated = db
            .update_instance(
                created.id,
                &InstanceUpdate::status(InstanceStatus::Running).with_container_ref("abc123"),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, InstanceStatus::Running);
        assert_eq!(updated.container_ref.as_deref(), Some("abc123"));
        assert_eq!(updated.health, HealthStatus::Unknown);
        assert_eq!(updated.port, Some(9000));
        assert!(updated.updated_at >= created.updated_at);

        let missing = db
            .update_instance(InstanceId(42), &InstanceUpdate::status(InstanceStatus::Stopped))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let db = Database::open_in_memory().unwrap();
        let created = db.create_instance(&new_instance("demo", 9000)).unwrap();
        assert!(db.delete_instance(created.id).unwrap());
        assert!(!db.delete_instance(created.id).unwrap());
        assert!(db.get_instance_by_name("demo").unwrap().is_none());

        // The name is free again
        db.create_instance(&new_instance("demo", 9000)).unwrap();
    }

    #[test]
    fn history_is_newest_first_and_prunable() {
        let db = Database::open_in_memory().unwrap();
        let id = db.create_instance(&new_instance("demo", 9000)).unwrap().id;
        db.record_event(id, LifecycleEvent::Created, None).unwrap();
        db.record_event(id, LifecycleEvent::Started, Some("port 9000"))
            .unwrap();

        let history = db.instance_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, "started");
        assert_eq!(history[0].details.as_deref(), Some("port 9000"));
        assert_eq!(history[1].event, "created");

        assert_eq!(db.cleanup_history(0).unwrap(), 0);
        assert_eq!(db.cleanup_history(30).unwrap(), 0);
        assert_eq!(db.instance_history(id).unwrap().len(), 2);
    }

    #[test]
    fn settings_and_records_persist_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("instances.db");

        {
            let db = Database::open(&path).unwrap();
            let settings = Settings {
                port_range_start: 9000,
                port_range_end: 9010,
                ..Default::default()
            };
            db.save_settings(&settings).unwrap();
            db.create_instance(&new_instance("demo", 9000)).unwrap();
        }

        let db = Database::open(&path).unwrap();
        let settings = db.load_settings().unwrap().unwrap();
        assert_eq!(settings.port_range(), (9000, 9010));
        assert_eq!(db.list_instances().unwrap()[0].name, "demo");
    }
}
