//! Resource management - Limits and usage tracking

use serde::{Deserialize, Serialize};

/// Smallest memory limit accepted for an instance
pub const MIN_MEMORY_MB: u64 = 128;
/// Largest memory limit accepted for an instance
pub const MAX_MEMORY_MB: u64 = 8 * 1024;
pub const MIN_CPU_LIMIT: f32 = 0.1;
pub const MAX_CPU_LIMIT: f32 = 4.0;

/// Resource limits applied to an instance container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in MB (0 = unlimited)
    #[serde(default)]
    pub memory_mb: u64,
    /// Maximum CPU in cores, e.g. 0.5 (0 = unlimited)
    #[serde(default)]
    pub cpu_limit: f32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_limit: 0.5,
        }
    }
}

impl ResourceLimits {
    /// No limits at all
    pub fn unlimited() -> Self {
        Self {
            memory_mb: 0,
            cpu_limit: 0.0,
        }
    }

    /// Create limits with memory cap
    pub fn with_memory_limit(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Create limits with CPU cap
    pub fn with_cpu_limit(mut self, cores: f32) -> Self {
        self.cpu_limit = cores;
        self
    }

    /// Check limits against the accepted bounds
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_mb > 0 && !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(format!(
                "memory limit {} MB outside {}..={} MB",
                self.memory_mb, MIN_MEMORY_MB, MAX_MEMORY_MB
            ));
        }
        if self.cpu_limit < 0.0
            || (self.cpu_limit > 0.0 && !(MIN_CPU_LIMIT..=MAX_CPU_LIMIT).contains(&self.cpu_limit))
        {
            return Err(format!(
                "cpu limit {} outside {}..={} cores",
                self.cpu_limit, MIN_CPU_LIMIT, MAX_CPU_LIMIT
            ));
        }
        Ok(())
    }

    /// Memory limit in bytes as the runtime expects it
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_mb > 0).then(|| (self.memory_mb * 1024 * 1024) as i64)
    }

    /// CPU limit in billionths of a core
    pub fn nano_cpus(&self) -> Option<i64> {
        (self.cpu_limit > 0.0).then(|| (f64::from(self.cpu_limit) * 1e9).round() as i64)
    }
}

/// One raw stats reading from the runtime, carrying the previous CPU sample
/// alongside the current one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: u64,
    pub presystem_cpu: u64,
    pub online_cpus: Option<u64>,
    /// Length of the per-cpu usage array, used when `online_cpus` is absent
    pub percpu_count: usize,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub pids: u64,
}

/// Current resource usage for an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage, may exceed 100 on multi-core hosts
    pub cpu_percent: f64,
    /// Memory usage in bytes
    pub memory_bytes: u64,
    /// Memory limit in bytes
    pub memory_limit_bytes: u64,
    /// Memory usage as a percentage of the limit
    pub memory_percent: f64,
    /// Network bytes received since start
    pub network_rx_bytes: u64,
    /// Network bytes transmitted since start
    pub network_tx_bytes: u64,
    /// Block device bytes read
    pub block_read_bytes: u64,
    /// Block device bytes written
    pub block_write_bytes: u64,
    /// Number of processes in the container
    pub pids: u64,
}

impl ResourceUsage {
    /// Derive usage from a raw sample. Zero or missing denominators yield 0.
    pub fn from_sample(sample: &StatsSample) -> Self {
        Self {
            cpu_percent: cpu_percent(sample),
            memory_bytes: sample.memory_usage,
            memory_limit_bytes: sample.memory_limit,
            memory_percent: ratio_percent(sample.memory_usage, sample.memory_limit),
            network_rx_bytes: sample.network_rx_bytes,
            network_tx_bytes: sample.network_tx_bytes,
            block_read_bytes: sample.block_read_bytes,
            block_write_bytes: sample.block_write_bytes,
            pids: sample.pids,
        }
    }

    /// Format memory as human-readable string
    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }

    /// Format CPU percentage
    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }
}

fn cpu_percent(sample: &StatsSample) -> f64 {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total);
    let system_delta = sample.system_cpu.saturating_sub(sample.presystem_cpu);
    if system_delta == 0 || cpu_delta == 0 {
        return 0.0;
    }

    let cores = match sample.online_cpus {
        Some(n) if n > 0 => n,
        _ if sample.percpu_count > 0 => sample.percpu_count as u64,
        _ => 1,
    };

    round2(cpu_delta as f64 / system_delta as f64 * cores as f64 * 100.0)
}

fn ratio_percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        round2(used as f64 / limit as f64 * 100.0)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatsSample {
        StatsSample {
            cpu_total: 400,
            precpu_total: 200,
            system_cpu: 2_000,
            presystem_cpu: 1_000,
            online_cpus: Some(2),
            memory_usage: 256,
            memory_limit: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn cpu_and_memory_percentages() {
        let usage = ResourceUsage::from_sample(&sample());
        // 200 / 1000 * 2 cores * 100
        assert_eq!(usage.cpu_percent, 40.0);
        assert_eq!(usage.memory_percent, 25.0);
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let mut s = sample();
        s.system_cpu = s.presystem_cpu;
        s.memory_limit = 0;
        let usage = ResourceUsage::from_sample(&s);
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_percent, 0.0);
        assert!(!usage.cpu_percent.is_nan());

        let usage = ResourceUsage::from_sample(&StatsSample::default());
        assert_eq!(usage.cpu_percent, 0.0);
        assert_eq!(usage.memory_percent, 0.0);
    }

    #[test]
    fn counter_reset_does_not_underflow() {
        let mut s = sample();
        s.cpu_total = 10;
        let usage = ResourceUsage::from_sample(&s);
        assert_eq!(usage.cpu_percent, 0.0);
    }

    #[test]
    fn core_count_falls_back_to_percpu_then_one() {
        let mut s = sample();
        s.online_cpus = None;
        s.percpu_count = 4;
        assert_eq!(ResourceUsage::from_sample(&s).cpu_percent, 80.0);

        s.percpu_count = 0;
        assert_eq!(ResourceUsage::from_sample(&s).cpu_percent, 20.0);
    }

    #[test]
    fn limit_bounds() {
        assert!(ResourceLimits::default().validate().is_ok());
        assert!(ResourceLimits::unlimited().validate().is_ok());
        assert!(ResourceLimits::default().with_memory_limit(64).validate().is_err());
        assert!(ResourceLimits::default().with_cpu_limit(8.0).validate().is_err());
        assert_eq!(ResourceLimits::default().nano_cpus(), Some(500_000_000));
        assert_eq!(ResourceLimits::default().memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(ResourceLimits::unlimited().memory_bytes(), None);
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
