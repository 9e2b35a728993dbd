//! Core module - Instance model, lifecycle orchestration, health and monitoring

pub mod client;
pub mod cloner;
pub mod error;
pub mod health;
mod instance;
pub mod monitor;
pub mod orchestrator;
pub mod ports;
pub mod resource;
pub mod runtime;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{CleanupReport, ClientConfig, ContainerStatus, RuntimeClient};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use health::{HealthChecker, HealthProbe, HttpProbe, ProbeOutcome};
pub use instance::{
    data_volume_name, validate_name, HealthCheckResult, HealthStatus, Instance, InstanceConfig,
    InstanceId, InstanceStatus, InstanceUpdate, NewInstance, VolumeMount, INSTANCE_LABEL,
};
pub use monitor::{Monitor, SweepReport};
pub use orchestrator::{BulkAction, InstanceOrchestrator, InstanceView, OperationOutcome};
pub use ports::{PortAllocator, PortReservation};
pub use resource::{ResourceLimits, ResourceUsage};
pub use runtime::{ContainerRuntime, ContainerState, EngineError};
pub use settings::{OperationTimeouts, Settings};
