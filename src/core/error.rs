//! Error taxonomy surfaced by the orchestrator and its collaborators

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::runtime::{EngineError, RuntimeOperation};
use crate::persistence::StoreError;

/// Errors returned by orchestrator operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad name, port or configuration supplied by the caller
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// No free port left in the configured range
    #[error("no available ports in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// The container runtime could not be reached after all retries
    #[error("container runtime unavailable after {attempts} attempt(s): {source}")]
    RuntimeUnavailable {
        attempts: u32,
        #[source]
        source: EngineError,
    },

    /// A single runtime call exceeded its budget
    #[error("{operation} timed out after {}s", .after.as_secs_f32())]
    OperationTimedOut {
        operation: RuntimeOperation,
        after: Duration,
    },

    /// Instance record or container reference is missing
    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to pull image {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to set up network {network}: {source}")]
    NetworkSetupFailed {
        network: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to set up volume {volume}: {source}")]
    VolumeSetupFailed {
        volume: String,
        #[source]
        source: EngineError,
    },

    /// Catch-all for runtime failures, with the operation and target for context
    #[error("{operation} failed for {target}: {source}")]
    UnexpectedRuntimeError {
        operation: RuntimeOperation,
        target: String,
        #[source]
        source: EngineError,
    },

    #[error("instance store error: {0}")]
    Store(#[from] StoreError),
}

/// Closed classification of [`OrchestratorError`], suitable for per-item results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    ResourceExhausted,
    RuntimeUnavailable,
    OperationTimedOut,
    NotFound,
    ImagePullFailed,
    NetworkSetupFailed,
    VolumeSetupFailed,
    UnexpectedRuntimeError,
    Store,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::RuntimeUnavailable { .. } => ErrorKind::RuntimeUnavailable,
            Self::OperationTimedOut { .. } => ErrorKind::OperationTimedOut,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ImagePullFailed { .. } => ErrorKind::ImagePullFailed,
            Self::NetworkSetupFailed { .. } => ErrorKind::NetworkSetupFailed,
            Self::VolumeSetupFailed { .. } => ErrorKind::VolumeSetupFailed,
            Self::UnexpectedRuntimeError { .. } => ErrorKind::UnexpectedRuntimeError,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// True when the underlying cause is a missing container or record
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::UnexpectedRuntimeError { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub(crate) fn instance_not_found(id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("instance {id}"))
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
