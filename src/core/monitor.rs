//! Periodic sweep - keeps stored status and health in step with the runtime

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::instance::{HealthCheckResult, HealthStatus, InstanceStatus};
use super::orchestrator::InstanceOrchestrator;
use crate::persistence::Database;

/// Counts gathered by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub instances: usize,
    pub running: usize,
    pub unhealthy: usize,
    pub failed_checks: usize,
    pub pruned_history: usize,
}

/// Resyncs every instance, health checks the running ones and prunes old history
pub struct Monitor {
    orchestrator: Arc<InstanceOrchestrator>,
    database: Arc<Database>,
    interval: Duration,
}

impl Monitor {
    pub fn new(orchestrator: Arc<InstanceOrchestrator>, database: Arc<Database>) -> Self {
        let interval = orchestrator.settings().monitor_interval();
        Self {
            orchestrator,
            database,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass; failures are logged and counted, never returned
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let views = match self.orchestrator.list().await {
            Ok(views) => views,
            Err(e) => {
                warn!("Monitor could not list instances: {}", e);
                return report;
            }
        };
        report.instances = views.len();

        // Busy instances come back without a container view; their operation owns them
        let running: Vec<_> = views
            .iter()
            .filter(|v| v.instance.status == InstanceStatus::Running && v.container.is_some())
            .map(|v| v.instance.id)
            .collect();
        report.running = running.len();

        let checks = running
            .iter()
            .map(|&id| async move { (id, self.orchestrator.health_check(id).await) });
        for (id, result) in join_all(checks).await {
            match result {
                Ok(HealthCheckResult {
                    health: HealthStatus::Unhealthy,
                    message,
                    ..
                }) => {
                    warn!("Instance {} is unhealthy: {}", id, message);
                    report.unhealthy += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Health check of {} failed: {}", id, e);
                    report.failed_checks += 1;
                }
            }
        }

        let retention = self.orchestrator.settings().history_retention_days;
        match self.database.cleanup_history(retention) {
            Ok(count) => report.pruned_history = count,
            Err(e) => warn!("History cleanup failed: {}", e),
        }

        debug!("Monitor sweep: {:?}", report);
        report
    }

    /// Sweep every interval until `shutdown` resolves; returns the number of sweeps
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Monitor running every {}s", self.interval.as_secs());
        let mut sweeps = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    self.run_once().await;
                    sweeps += 1;
                }
            }
        }
        info!("Monitor stopped after {} sweep(s)", sweeps);
        sweeps
    }
}
