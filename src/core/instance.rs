//! Instance management - Represents a single managed container instance

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::resource::ResourceLimits;
use super::runtime::ContainerState;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{3,50}$").expect("instance name pattern is valid")
});

/// Label attached to every container created for an instance
pub const INSTANCE_LABEL: &str = "instance-orchestrator.instance";

/// Unique identifier for an instance, assigned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub i64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Container exists but has never been started
    Created,
    /// Container is running
    Running,
    /// Container has been stopped
    Stopped,
    /// Transient state while a restart is in flight
    Restarting,
    /// The last start or restart attempt failed
    Failed,
    /// Terminal; the record is deleted from the store
    Removed,
}

impl InstanceStatus {
    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;

        if *self == next {
            return *self != Removed;
        }
        match self {
            Created => matches!(next, Running | Stopped | Failed | Removed),
            Running => matches!(next, Stopped | Restarting | Failed | Removed),
            Restarting => matches!(next, Running | Stopped | Failed | Removed),
            Stopped => matches!(next, Running | Restarting | Failed | Removed),
            Failed => matches!(next, Running | Restarting | Stopped | Removed),
            Removed => false,
        }
    }

    /// Status implied by a runtime container state, if any
    pub fn from_container_state(state: ContainerState) -> Option<Self> {
        match state {
            ContainerState::Created => Some(Self::Created),
            ContainerState::Running | ContainerState::Paused => Some(Self::Running),
            ContainerState::Restarting => Some(Self::Restarting),
            ContainerState::Exited => Some(Self::Stopped),
            ContainerState::Dead => Some(Self::Failed),
            ContainerState::Removing | ContainerState::Unknown => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "restarting" => Ok(Self::Restarting),
            "failed" => Ok(Self::Failed),
            "removed" => Ok(Self::Removed),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application-level health of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown health status '{other}'")),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A volume or bind mount passed through to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume name or host path
    pub source: String,
    /// Absolute path inside the container
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Configuration for creating an instance container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Image reference, e.g. `n8nio/n8n:latest`
    pub image: String,
    /// Environment variables to set
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Resource limits for this instance
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Extra mounts beyond the instance's data volume
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Extra networks to attach
    #[serde(default)]
    pub networks: Vec<String>,
    /// Port the application listens on inside the container (defaults to the host port)
    #[serde(default)]
    pub container_port: Option<u16>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            environment: BTreeMap::new(),
            resource_limits: ResourceLimits::default(),
            volumes: Vec::new(),
            networks: Vec::new(),
            container_port: None,
        }
    }
}

impl InstanceConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = Some(port);
        self
    }

    /// Fill in defaults the caller left out. Caller-provided entries win.
    pub fn merged_with_defaults(
        mut self,
        default_image: &str,
        default_env: &BTreeMap<String, String>,
    ) -> Self {
        if self.image.trim().is_empty() {
            self.image = default_image.to_string();
        }
        for (key, value) in default_env {
            self.environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Validate everything that is passed through to the runtime
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("image must not be empty".to_string());
        }
        self.resource_limits.validate()?;
        if let Some(key) = self
            .environment
            .keys()
            .find(|k| k.is_empty() || k.contains('='))
        {
            return Err(format!("invalid environment variable name '{key}'"));
        }
        if let Some(mount) = self
            .volumes
            .iter()
            .find(|m| m.source.is_empty() || !m.target.starts_with('/'))
        {
            return Err(format!(
                "invalid mount '{}:{}' (target must be an absolute path)",
                mount.source, mount.target
            ));
        }
        if self.container_port == Some(0) {
            return Err("container port must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Check an instance name: 3-50 chars of `[A-Za-z0-9_-]`
pub fn validate_name(name: &str) -> Result<(), String> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(format!(
            "invalid instance name '{name}': use 3-50 letters, numbers, hyphens or underscores"
        ))
    }
}

/// Name of the default data volume for an instance
pub fn data_volume_name(instance_name: &str) -> String {
    format!("{instance_name}_data")
}

/// A managed container instance as persisted in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    /// Runtime-assigned container handle; set once
    pub container_ref: Option<String>,
    pub image: String,
    pub port: Option<u16>,
    pub status: InstanceStatus,
    pub health: HealthStatus,
    pub config: InstanceConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Port the application listens on inside the container
    pub fn container_port(&self) -> Option<u16> {
        self.config.container_port.or(self.port)
    }

    pub fn data_volume(&self) -> String {
        data_volume_name(&self.name)
    }
}

/// Fields for a record about to be inserted
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub image: String,
    pub port: Option<u16>,
    pub config: InstanceConfig,
}

/// A partial update; only `Some` fields are written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceUpdate {
    pub container_ref: Option<String>,
    pub status: Option<InstanceStatus>,
    pub health: Option<HealthStatus>,
    pub config: Option<InstanceConfig>,
    pub last_health_check_at: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_container_ref(mut self, container_ref: impl Into<String>) -> Self {
        self.container_ref = Some(container_ref.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of a single health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub health: HealthStatus,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(health: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            health,
            message: message.into(),
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("demo").is_ok());
        assert!(validate_name("demo-copy_2").is_ok());
        assert!(validate_name("ab").is_err());
        assert!(validate_name(&"a".repeat(50)).is_ok());
        assert!(validate_name(&"a".repeat(51)).is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dots.not.allowed").is_err());
        assert!(validate_name("").is_err());
    }

    #[test]
    fn state_machine() {
        use InstanceStatus::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Running.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Created));
        assert!(!Stopped.can_transition_to(Created));
        assert!(!Removed.can_transition_to(Running));
        assert!(!Removed.can_transition_to(Removed));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            InstanceStatus::Created,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Restarting,
            InstanceStatus::Failed,
            InstanceStatus::Removed,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>(), Ok(status));
        }
        assert!("exited".parse::<InstanceStatus>().is_err());
        assert_eq!("healthy".parse::<HealthStatus>(), Ok(HealthStatus::Healthy));
    }

    #[test]
    fn runtime_state_mapping() {
        assert_eq!(
            InstanceStatus::from_container_state(ContainerState::Exited),
            Some(InstanceStatus::Stopped)
        );
        assert_eq!(
            InstanceStatus::from_container_state(ContainerState::Dead),
            Some(InstanceStatus::Failed)
        );
        assert_eq!(
            InstanceStatus::from_container_state(ContainerState::Removing),
            None
        );
    }

    #[test]
    fn defaults_merge_without_overriding() {
        let mut defaults = BTreeMap::new();
        defaults.insert("NODE_ENV".to_string(), "production".to_string());
        defaults.insert("TZ".to_string(), "UTC".to_string());

        let config = InstanceConfig::default()
            .with_env("TZ", "Europe/Berlin")
            .merged_with_defaults("app:latest", &defaults);

        assert_eq!(config.image, "app:latest");
        assert_eq!(config.environment["TZ"], "Europe/Berlin");
        assert_eq!(config.environment["NODE_ENV"], "production");
    }

    #[test]
    fn config_validation() {
        assert!(InstanceConfig::new("app:latest").validate().is_ok());
        assert!(InstanceConfig::default().validate().is_err());
        assert!(InstanceConfig::new("app")
            .with_env("A=B", "c")
            .validate()
            .is_err());
        assert!(InstanceConfig::new("app")
            .with_volume(VolumeMount::new("data", "relative/path"))
            .validate()
            .is_err());
    }
}
