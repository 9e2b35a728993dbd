//! Persistence - SQLite-backed instance store

mod database;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Instance, InstanceId, InstanceUpdate, NewInstance};

pub use database::Database;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A unique constraint (instance name) was violated
    #[error("instance name '{0}' is already in use")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Lifecycle events kept in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Created,
    Started,
    Stopped,
    Restarted,
    Failed,
    Cloned,
    DataCloned,
    ConfigUpdated,
    Deleted,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Restarted => "restarted",
            Self::Failed => "failed",
            Self::Cloned => "cloned",
            Self::DataCloned => "data_cloned",
            Self::ConfigUpdated => "config_updated",
            Self::Deleted => "deleted",
        }
    }
}

/// One row of an instance's audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub instance_id: InstanceId,
    pub event: String,
    pub at: DateTime<Utc>,
    pub details: Option<String>,
}

/// Durable owner of instance records.
///
/// "No record" is a normal outcome (`Ok(None)` / `Ok(false)`), never an error.
pub trait InstanceStore: Send + Sync {
    /// Insert a record in `created` status; the store assigns the id
    fn create_instance(&self, new: &NewInstance) -> Result<Instance, StoreError>;
    fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>, StoreError>;
    fn get_instance_by_name(&self, name: &str) -> Result<Option<Instance>, StoreError>;
    fn list_instances(&self) -> Result<Vec<Instance>, StoreError>;
    /// Write the `Some` fields of `update`; returns the updated record
    fn update_instance(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
    ) -> Result<Option<Instance>, StoreError>;
    /// Returns whether a record was deleted
    fn delete_instance(&self, id: InstanceId) -> Result<bool, StoreError>;

    fn record_event(
        &self,
        id: InstanceId,
        event: LifecycleEvent,
        details: Option<&str>,
    ) -> Result<(), StoreError>;
    /// Audit trail for an instance, newest first
    fn instance_history(&self, id: InstanceId) -> Result<Vec<HistoryEntry>, StoreError>;
}
