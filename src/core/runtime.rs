//! Container runtime seam - the narrow interface the orchestrator drives
//!
//! Everything the orchestrator needs from a container engine goes through
//! [`ContainerRuntime`]. The Docker implementation lives in
//! [`crate::engine::docker`]; tests substitute an in-memory fake.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::instance::VolumeMount;
use super::resource::StatsSample;

/// Every kind of call made against the runtime; keys the timeout table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeOperation {
    Ping,
    PullImage,
    EnsureNetwork,
    EnsureVolume,
    RemoveVolume,
    CreateContainer,
    StartContainer,
    StopContainer,
    RestartContainer,
    RemoveContainer,
    InspectContainer,
    Stats,
    Logs,
    ListContainers,
    Cleanup,
    RunHelper,
}

impl RuntimeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::PullImage => "pull_image",
            Self::EnsureNetwork => "ensure_network",
            Self::EnsureVolume => "ensure_volume",
            Self::RemoveVolume => "remove_volume",
            Self::CreateContainer => "create_container",
            Self::StartContainer => "start_container",
            Self::StopContainer => "stop_container",
            Self::RestartContainer => "restart_container",
            Self::RemoveContainer => "remove_container",
            Self::InspectContainer => "inspect_container",
            Self::Stats => "stats",
            Self::Logs => "logs",
            Self::ListContainers => "list_containers",
            Self::Cleanup => "cleanup",
            Self::RunHelper => "run_helper",
        }
    }
}

impl fmt::Display for RuntimeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state of a container as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Failures reported by a [`ContainerRuntime`] implementation
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// The requested state change was already in effect
    #[error("not modified")]
    NotModified,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("engine returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("expected container to be {expected}, found {actual}")]
    StateMismatch {
        expected: ContainerState,
        actual: ContainerState,
    },
    #[error("helper container exited with status {0}")]
    HelperFailed(i64),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Host port published for a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

/// Everything needed to create an instance container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<VolumeMount>,
    /// Primary network the container joins at creation
    pub network: Option<String>,
    /// Additional networks, passed through verbatim
    pub extra_networks: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub labels: BTreeMap<String, String>,
}

/// Inspection result for a single container
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortMapping>,
    /// `source:destination` pairs
    pub mounts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
}

/// Disposable container used to move data between volumes
#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<VolumeMount>,
    pub command: Vec<String>,
}

/// Container engine control plane
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError>;
    async fn create_network(&self, name: &str) -> Result<(), EngineError>;

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError>;
    async fn create_volume(&self, name: &str) -> Result<(), EngineError>;
    async fn remove_volume(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError>;
    async fn restart_container(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError>;
    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;
    /// One raw stats snapshot carrying both the current and previous CPU sample
    async fn stats(&self, id: &str) -> Result<StatsSample, EngineError>;
    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError>;

    async fn list_containers(
        &self,
        state: Option<ContainerState>,
    ) -> Result<Vec<ContainerSummary>, EngineError>;
    async fn prune_images(&self) -> Result<u64, EngineError>;
    async fn prune_volumes(&self) -> Result<u64, EngineError>;
    async fn prune_networks(&self) -> Result<u64, EngineError>;

    /// Run a helper container to completion and remove it, returning its exit code
    async fn run_helper(&self, spec: &HelperSpec) -> Result<i64, EngineError>;
}
