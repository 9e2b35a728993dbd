//! Orchestrator settings management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::runtime::RuntimeOperation;

/// Per-operation timeout budgets for runtime calls, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTimeouts {
    /// Budget for operations without an explicit entry
    pub default_ms: u64,
    #[serde(default)]
    pub overrides: BTreeMap<RuntimeOperation, u64>,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        use RuntimeOperation::*;

        let overrides = [
            (CreateContainer, 60),
            (StartContainer, 30),
            (StopContainer, 30),
            (RestartContainer, 45),
            (RemoveContainer, 30),
            (InspectContainer, 10),
            (Logs, 15),
            (Stats, 10),
            (PullImage, 300),
            (ListContainers, 10),
            (Cleanup, 120),
            (Ping, 5),
            (EnsureNetwork, 30),
            (EnsureVolume, 30),
            (RemoveVolume, 30),
            (RunHelper, 300),
        ]
        .into_iter()
        .map(|(op, secs)| (op, secs * 1000))
        .collect();

        Self {
            default_ms: 30_000,
            overrides,
        }
    }
}

impl OperationTimeouts {
    /// Every operation gets the same budget
    pub fn uniform(budget: Duration) -> Self {
        Self {
            default_ms: budget.as_millis() as u64,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with(mut self, operation: RuntimeOperation, budget: Duration) -> Self {
        self.overrides
            .insert(operation, budget.as_millis() as u64);
        self
    }

    pub fn get(&self, operation: RuntimeOperation) -> Duration {
        let ms = self
            .overrides
            .get(&operation)
            .copied()
            .unwrap_or(self.default_ms);
        Duration::from_millis(ms)
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Ports
    /// First host port handed out to instances
    pub port_range_start: u16,
    /// Last host port handed out to instances (inclusive)
    pub port_range_end: u16,

    // Instance defaults
    pub default_image: String,
    /// Environment entries added to every instance unless overridden
    pub default_environment: BTreeMap<String, String>,
    /// Network every instance joins
    pub network_name: String,
    /// Where the per-instance data volume is mounted inside the container
    pub data_mount_path: String,
    /// Image used for disposable copy containers
    pub helper_image: String,
    /// Start the container right after creating it
    pub auto_start: bool,

    // Runtime connection
    pub connect_max_retries: u32,
    pub connect_base_delay_ms: u64,
    pub timeouts: OperationTimeouts,
    /// How long to wait for a container to reach the expected state
    pub verify_grace_ms: u64,
    /// Seconds the runtime waits before killing a stopping container
    pub stop_timeout_secs: u32,

    // Health
    pub probe_timeout_ms: u64,
    /// Delay before the follow-up health check after start/restart
    pub health_grace_secs: u64,

    // Monitoring
    pub monitor_interval_secs: u64,
    /// Keep instance history for N days (0 = forever)
    pub history_retention_days: u32,
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut default_environment = BTreeMap::new();
        default_environment.insert("N8N_HOST".to_string(), "0.0.0.0".to_string());
        default_environment.insert("N8N_PROTOCOL".to_string(), "http".to_string());
        default_environment.insert("NODE_ENV".to_string(), "production".to_string());

        Self {
            // Ports
            port_range_start: 5678,
            port_range_end: 5700,

            // Instance defaults
            default_image: "n8nio/n8n:latest".to_string(),
            default_environment,
            network_name: "n8n_network".to_string(),
            data_mount_path: "/home/node/.n8n".to_string(),
            helper_image: "alpine:latest".to_string(),
            auto_start: true,

            // Runtime connection
            connect_max_retries: 5,
            connect_base_delay_ms: 1000,
            timeouts: OperationTimeouts::default(),
            verify_grace_ms: 2000,
            stop_timeout_secs: 10,

            // Health
            probe_timeout_ms: 5000,
            health_grace_secs: 10,

            // Monitoring
            monitor_interval_secs: 30,
            history_retention_days: 30,
            data_directory: None,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("InstanceOrchestrator")
        })
    }

    /// Path of the SQLite instance store
    pub fn database_path(&self) -> PathBuf {
        self.get_data_directory().join("instances.db")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.port_range_start = self.port_range_start.max(1024);
        if self.port_range_end < self.port_range_start {
            self.port_range_end = self.port_range_start;
        }
        self.connect_max_retries = self.connect_max_retries.max(1);
        self.stop_timeout_secs = self.stop_timeout_secs.clamp(1, 300);
        self.probe_timeout_ms = self.probe_timeout_ms.max(100);
        self.monitor_interval_secs = self.monitor_interval_secs.max(5);
        self.timeouts.default_ms = self.timeouts.default_ms.max(100);
        if self.default_image.trim().is_empty() {
            self.default_image = Self::default().default_image;
        }
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port_range_start, self.port_range_end)
    }

    pub fn connect_base_delay(&self) -> Duration {
        Duration::from_millis(self.connect_base_delay_ms)
    }

    pub fn verify_grace(&self) -> Duration {
        Duration::from_millis(self.verify_grace_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn health_grace(&self) -> Duration {
        Duration::from_secs(self.health_grace_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_table_defaults() {
        let timeouts = OperationTimeouts::default();
        assert_eq!(timeouts.get(RuntimeOperation::PullImage), Duration::from_secs(300));
        assert_eq!(timeouts.get(RuntimeOperation::Ping), Duration::from_secs(5));
        assert_eq!(timeouts.get(RuntimeOperation::RestartContainer), Duration::from_secs(45));

        let shrunk = OperationTimeouts::uniform(Duration::from_millis(50))
            .with(RuntimeOperation::PullImage, Duration::from_secs(1));
        assert_eq!(shrunk.get(RuntimeOperation::StartContainer), Duration::from_millis(50));
        assert_eq!(shrunk.get(RuntimeOperation::PullImage), Duration::from_secs(1));
    }

    #[test]
    fn validate_fixes_bad_values() {
        let mut settings = Settings {
            port_range_start: 80,
            port_range_end: 10,
            connect_max_retries: 0,
            default_image: " ".to_string(),
            ..Default::default()
        };
        settings.validate();
        assert_eq!(settings.port_range(), (1024, 1024));
        assert_eq!(settings.connect_max_retries, 1);
        assert_eq!(settings.default_image, "n8nio/n8n:latest");
    }

    #[test]
    fn settings_survive_json() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeouts, settings.timeouts);
        assert_eq!(back.port_range(), (5678, 5700));

        // Missing fields fall back to defaults
        let partial: Settings = serde_json::from_str(r#"{"auto_start": false}"#).unwrap();
        assert!(!partial.auto_start);
        assert_eq!(partial.network_name, "n8n_network");
    }
}
