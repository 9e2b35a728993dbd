//! Instance orchestrator - the lifecycle API over store, ports, runtime and health
//!
//! Every mutating operation on an instance holds that instance's lock for its
//! whole duration, so a `start` and a `delete` on the same id never interleave.
//! Operations on different instances run concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::client::{short_id, CleanupReport, ContainerStatus, RuntimeClient};
use super::cloner::DataCloner;
use super::error::{ErrorKind, OrchestratorError, Result};
use super::health::{HealthChecker, HealthProbe};
use super::instance::{
    self, HealthCheckResult, HealthStatus, Instance, InstanceConfig, InstanceId, InstanceStatus,
    InstanceUpdate, NewInstance, VolumeMount, INSTANCE_LABEL,
};
use super::ports::PortAllocator;
use super::resource::ResourceUsage;
use super::runtime::{ContainerSpec, PortMapping};
use super::settings::Settings;
use crate::persistence::{HistoryEntry, InstanceStore, LifecycleEvent, StoreError};


/// Per-instance async locks
#[derive(Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
}

impl InstanceLocks {
    pub async fn acquire(&self, id: InstanceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    /// The lock if nobody holds it right now
    pub fn try_acquire(&self, id: InstanceId) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id).or_default())
        };
        lock.try_lock_owned().ok()
    }

    /// Drop the lock entry of a deleted instance
    fn forget(&self, id: InstanceId) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.remove(&id);
    }
}

/// Result shape handed to CLI/UI callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
    pub instance_id: Option<InstanceId>,
    pub error: Option<ErrorKind>,
}

impl OperationOutcome {
    pub fn ok(instance_id: Option<InstanceId>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            instance_id,
            error: None,
        }
    }

    pub fn failed(instance_id: Option<InstanceId>, error: &OrchestratorError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            instance_id,
            error: Some(error.kind()),
        }
    }

    pub fn from_result<T>(
        instance_id: Option<InstanceId>,
        result: &Result<T>,
        message: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(value) => Self::ok(instance_id, message(value)),
            Err(e) => Self::failed(instance_id, e),
        }
    }
}

/// Operations that can be applied to many instances at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Start,
    Stop,
    Restart,
    HealthCheck,
}

impl BulkAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::HealthCheck => "health check",
        }
    }
}

/// A stored instance plus what the runtime says about its container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub instance: Instance,
    pub container: Option<ContainerStatus>,
}

pub struct InstanceOrchestrator {
    store: Arc<dyn InstanceStore>,
    client: Arc<RuntimeClient>,
    ports: Arc<PortAllocator>,
    health: Arc<HealthChecker>,
    cloner: DataCloner,
    settings: Settings,
    locks: InstanceLocks,
}

impl InstanceOrchestrator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        client: Arc<RuntimeClient>,
        ports: Arc<PortAllocator>,
        probe: Arc<dyn HealthProbe>,
        settings: Settings,
    ) -> Self {
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&store),
            Arc::clone(&client),
            probe,
            settings.probe_timeout(),
            settings.health_grace(),
        ));
        let cloner = DataCloner::new(Arc::clone(&client), settings.helper_image.clone());

        Self {
            store,
            client,
            ports,
            health,
            cloner,
            settings,
            locks: InstanceLocks::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &Arc<RuntimeClient> {
        &self.client
    }

    pub fn health_checker(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn data_cloner(&self) -> &DataCloner {
        &self.cloner
    }

    // === Lifecycle ===

    /// Create an instance: reserve a port, persist the record, create the
    /// container and (if configured) start it.
    ///
    /// If the container cannot be created the record is deleted again. A
    /// failed auto-start keeps the instance, in `failed` status.
    pub async fn create(&self, name: &str, config: InstanceConfig) -> Result<Instance> {
        instance::validate_name(name).map_err(OrchestratorError::ValidationFailed)?;
        let config = config
            .merged_with_defaults(&self.settings.default_image, &self.settings.default_environment);
        config.validate().map_err(OrchestratorError::ValidationFailed)?;

        if self.store.get_instance_by_name(name)?.is_some() {
            return Err(name_conflict(name));
        }

        let in_use: HashSet<u16> = self
            .store
            .list_instances()?
            .iter()
            .filter_map(|i| i.port)
            .collect();
        let (start, end) = self.settings.port_range();
        let reservation = self.ports.reserve_excluding(start, end, &in_use)?;

        let record = self
            .store
            .create_instance(&NewInstance {
                name: name.to_string(),
                image: config.image.clone(),
                port: Some(reservation.port()),
                config,
            })
            .map_err(|e| match e {
                StoreError::Conflict(name) => name_conflict(&name),
                other => other.into(),
            })?;
        let guard = self.locks.acquire(record.id).await;
        self.record_event(record.id, LifecycleEvent::Created, None);

        let spec = self.container_spec(&record);
        let container_ref = match self.client.create_container(&spec).await {
            Ok(container_ref) => container_ref,
            Err(e) => {
                error!("Creating container for {} failed: {}", name, e);
                self.discard_record(record.id, guard);
                return Err(e);
            }
        };
        // The runtime now owns the port
        drop(reservation);

        let update = InstanceUpdate::default().with_container_ref(container_ref.clone());
        let record = match self.write(record.id, &update) {
            Ok(record) => record,
            Err(e) => {
                error!("Recording container of {} failed: {}", name, e);
                if let Err(cleanup) = self.client.remove_container(&container_ref, true, false).await
                {
                    warn!(
                        "Could not remove container {} of {}: {}",
                        short_id(&container_ref),
                        name,
                        cleanup
                    );
                }
                self.discard_record(record.id, guard);
                return Err(e);
            }
        };
        info!(
            "Created instance {} ({}) on port {} as {}",
            record.name,
            record.id,
            record.port.unwrap_or_default(),
            short_id(&container_ref)
        );

        if !self.settings.auto_start {
            return Ok(record);
        }
        let id = record.id;
        match self.start_locked(record).await {
            Ok(started) => Ok(started),
            Err(e) => {
                warn!("Auto-start of {} failed: {}", name, e);
                self.load(id)
            }
        }
    }

    pub async fn start(&self, id: InstanceId) -> Result<Instance> {
        let _guard = self.locks.acquire(id).await;
        let record = self.load(id)?;
        self.start_locked(record).await
    }

    async fn start_locked(&self, record: Instance) -> Result<Instance> {
        ensure_transition(&record, InstanceStatus::Running)?;
        let container_ref = require_container(&record)?;

        if let Err(e) = self.client.start_container(container_ref).await {
            self.mark_failed(&record, &e);
            return Err(e);
        }

        let started = self.write(
            record.id,
            &InstanceUpdate::status(InstanceStatus::Running).with_health(HealthStatus::Starting),
        )?;
        self.record_event(record.id, LifecycleEvent::Started, None);
        info!("Started instance {} ({})", started.name, started.id);

        self.schedule_health_checks(&started).await;
        self.load(record.id)
    }

    pub async fn stop(&self, id: InstanceId) -> Result<Instance> {
        let _guard = self.locks.acquire(id).await;
        let record = self.load(id)?;
        ensure_transition(&record, InstanceStatus::Stopped)?;
        let container_ref = require_container(&record)?;

        self.client.stop_container(container_ref).await?;

        let stopped = self.write(
            id,
            &InstanceUpdate::status(InstanceStatus::Stopped).with_health(HealthStatus::Stopped),
        )?;
        self.record_event(id, LifecycleEvent::Stopped, None);
        info!("Stopped instance {} ({})", stopped.name, id);
        Ok(stopped)
    }

    pub async fn restart(&self, id: InstanceId) -> Result<Instance> {
        let _guard = self.locks.acquire(id).await;
        let record = self.load(id)?;
        ensure_transition(&record, InstanceStatus::Restarting)?;
        let container_ref = require_container(&record)?;

        let record = self.write(id, &InstanceUpdate::status(InstanceStatus::Restarting))?;
        if let Err(e) = self.client.restart_container(container_ref).await {
            self.mark_failed(&record, &e);
            return Err(e);
        }

        let restarted = self.write(
            id,
            &InstanceUpdate::status(InstanceStatus::Running).with_health(HealthStatus::Starting),
        )?;
        self.record_event(id, LifecycleEvent::Restarted, None);
        info!("Restarted instance {} ({})", restarted.name, id);

        self.schedule_health_checks(&restarted).await;
        self.load(id)
    }

    /// Remove the container (best-effort) and delete the record.
    ///
    /// Container or volume removal failures are logged; the record is deleted regardless.
    pub async fn delete(&self, id: InstanceId, remove_data: bool) -> Result<()> {
        let guard = self.locks.acquire(id).await;
        let record = self.load(id)?;

        if let Some(container_ref) = record.container_ref.as_deref() {
            if let Err(e) = self.client.remove_container(container_ref, true, false).await {
                warn!(
                    "Removing container {} of {} failed, deleting record anyway: {}",
                    short_id(container_ref),
                    record.name,
                    e
                );
            }
        }
        if remove_data {
            let volume = record.data_volume();
            if let Err(e) = self.client.remove_volume(&volume, true).await {
                warn!("Removing volume {} failed: {}", volume, e);
            }
        }

        self.store.delete_instance(id)?;
        self.record_event(
            id,
            LifecycleEvent::Deleted,
            Some(if remove_data { "data removed" } else { "data kept" }),
        );
        info!("Deleted instance {} ({})", record.name, id);

        drop(guard);
        self.locks.forget(id);
        Ok(())
    }

    /// Create `new_name` with the source's configuration, optionally copying its data
    pub async fn clone_instance(
        &self,
        source_id: InstanceId,
        new_name: &str,
        clone_data: bool,
    ) -> Result<Instance> {
        let source = self.load(source_id)?;
        let target = self.create(new_name, source.config.clone()).await?;
        self.record_event(
            target.id,
            LifecycleEvent::Cloned,
            Some(&format!("from {}", source.name)),
        );
        if !clone_data {
            return Ok(target);
        }

        // Lock in id order so two clones between the same pair cannot deadlock
        let (first, second) = if source.id < target.id {
            (source.id, target.id)
        } else {
            (target.id, source.id)
        };
        let _first = self.locks.acquire(first).await;
        let _second = self.locks.acquire(second).await;

        let source = self.load(source_id)?;
        let target = self.load(target.id)?;
        let copied = self.cloner.clone_data(&source, &target).await;

        // Both containers were stopped and started behind the records' backs
        self.observe(source).await;
        let target = self.observe(target).await.instance;

        match copied {
            Ok(()) => {
                self.record_event(
                    target.id,
                    LifecycleEvent::DataCloned,
                    Some(&format!("from {}", source_id)),
                );
                Ok(target)
            }
            Err(e) => {
                error!("Cloning data into {} failed: {}", target.name, e);
                Err(e)
            }
        }
    }

    /// Apply `action` to every id independently; one failure does not stop the rest
    pub async fn bulk(
        &self,
        ids: &[InstanceId],
        action: BulkAction,
    ) -> Vec<(InstanceId, OperationOutcome)> {
        let runs = ids.iter().map(|&id| async move {
            let outcome = match action {
                BulkAction::Start => OperationOutcome::from_result(
                    Some(id),
                    &self.start(id).await,
                    |i| format!("{} started", i.name),
                ),
                BulkAction::Stop => OperationOutcome::from_result(
                    Some(id),
                    &self.stop(id).await,
                    |i| format!("{} stopped", i.name),
                ),
                BulkAction::Restart => OperationOutcome::from_result(
                    Some(id),
                    &self.restart(id).await,
                    |i| format!("{} restarted", i.name),
                ),
                BulkAction::HealthCheck => OperationOutcome::from_result(
                    Some(id),
                    &self.health_check(id).await,
                    |r| format!("{}: {}", r.health, r.message),
                ),
            };
            if !outcome.success {
                warn!("Bulk {} failed for {}: {}", action.label(), id, outcome.message);
            }
            (id, outcome)
        });
        join_all(runs).await
    }

    pub async fn update_config(&self, id: InstanceId, config: InstanceConfig) -> Result<Instance> {
        let _guard = self.locks.acquire(id).await;
        self.load(id)?;
        let config = config
            .merged_with_defaults(&self.settings.default_image, &self.settings.default_environment);
        config.validate().map_err(OrchestratorError::ValidationFailed)?;

        let updated = self.write(
            id,
            &InstanceUpdate {
                config: Some(config),
                ..Default::default()
            },
        )?;
        self.record_event(id, LifecycleEvent::ConfigUpdated, None);
        Ok(updated)
    }

    // === Queries ===

    pub async fn health_check(&self, id: InstanceId) -> Result<HealthCheckResult> {
        let _guard = self.locks.acquire(id).await;
        self.health.check(id).await
    }

    /// All instances, with status re-synchronized against the runtime.
    ///
    /// Instances with an operation in flight are reported as stored, without
    /// a container view; their status is settled by that operation.
    pub async fn list(&self) -> Result<Vec<InstanceView>> {
        let mut views = Vec::new();
        for record in self.store.list_instances()? {
            let Some(_guard) = self.locks.try_acquire(record.id) else {
                debug!("{} is busy, listing stored state", record.name);
                views.push(InstanceView {
                    instance: record,
                    container: None,
                });
                continue;
            };
            // Re-read under the lock; the record may have changed or gone
            let Some(record) = self.store.get_instance(record.id)? else {
                continue;
            };
            views.push(self.observe(record).await);
        }
        Ok(views)
    }

    /// Like [`list`](Self::list) for a single instance
    pub async fn status(&self, id: InstanceId) -> Result<InstanceView> {
        let Some(_guard) = self.locks.try_acquire(id) else {
            return Ok(InstanceView {
                instance: self.load(id)?,
                container: None,
            });
        };
        let record = self.load(id)?;
        Ok(self.observe(record).await)
    }

    pub async fn logs(&self, id: InstanceId, tail: usize) -> Result<String> {
        let record = self.load(id)?;
        self.client.logs(require_container(&record)?, tail).await
    }

    pub async fn stats(&self, id: InstanceId) -> Result<ResourceUsage> {
        let record = self.load(id)?;
        let usage = self.client.stats(require_container(&record)?).await?;
        debug!(
            "Usage of {}: cpu {}, memory {}",
            record.name,
            usage.cpu_string(),
            usage.memory_string()
        );
        Ok(usage)
    }

    pub fn history(&self, id: InstanceId) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.instance_history(id)?)
    }

    /// Remove unused runtime objects, never touching containers of stored instances
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let keep: HashSet<String> = self
            .store
            .list_instances()?
            .into_iter()
            .flat_map(|i| i.container_ref.into_iter().chain(std::iter::once(i.name)))
            .collect();
        Ok(self.client.cleanup_unused(&keep).await)
    }

    // === Internals ===

    fn load(&self, id: InstanceId) -> Result<Instance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| OrchestratorError::instance_not_found(id))
    }

    fn write(&self, id: InstanceId, update: &InstanceUpdate) -> Result<Instance> {
        self.store
            .update_instance(id, update)?
            .ok_or_else(|| OrchestratorError::instance_not_found(id))
    }

    /// Delete a record whose container never came to be, then drop its lock
    fn discard_record(&self, id: InstanceId, guard: OwnedMutexGuard<()>) {
        if let Err(e) = self.store.delete_instance(id) {
            error!("Could not delete orphan record {}: {}", id, e);
        }
        drop(guard);
        self.locks.forget(id);
    }

    fn mark_failed(&self, record: &Instance, cause: &OrchestratorError) {
        if let Err(e) = self.store.update_instance(
            record.id,
            &InstanceUpdate::status(InstanceStatus::Failed).with_health(HealthStatus::Unhealthy),
        ) {
            error!("Could not mark {} failed: {}", record.name, e);
        }
        self.record_event(record.id, LifecycleEvent::Failed, Some(&cause.to_string()));
        warn!("Instance {} ({}) failed: {}", record.name, record.id, cause);
    }

    fn record_event(&self, id: InstanceId, event: LifecycleEvent, details: Option<&str>) {
        if let Err(e) = self.store.record_event(id, event, details) {
            warn!("Could not record {} event for {}: {}", event.as_str(), id, e);
        }
    }

    /// Immediate health check now, a follow-up after the grace delay
    async fn schedule_health_checks(&self, instance: &Instance) {
        if let Err(e) = self.health.check_instance(instance).await {
            warn!("Health check of {} failed: {}", instance.name, e);
        }
        self.health.spawn_delayed(instance.id);
    }

    /// Read the live container state and write back an allowed status change
    async fn observe(&self, record: Instance) -> InstanceView {
        let Some(container_ref) = record.container_ref.clone() else {
            return InstanceView {
                instance: record,
                container: None,
            };
        };

        let (observed, container) = match self.client.status(&container_ref).await {
            Ok(status) => (InstanceStatus::from_container_state(status.state), Some(status)),
            Err(e) if e.is_not_found() => {
                warn!("Container of {} is gone", record.name);
                (Some(InstanceStatus::Failed), None)
            }
            Err(e) => {
                warn!("Could not inspect {}: {}", record.name, e);
                (None, None)
            }
        };

        let instance = match observed {
            Some(next) if next != record.status => self.resync(record, next),
            _ => record,
        };
        InstanceView {
            instance,
            container,
        }
    }

    fn resync(&self, record: Instance, observed: InstanceStatus) -> Instance {
        if !record.status.can_transition_to(observed) {
            warn!(
                "Ignoring runtime state {} for {} (stored {})",
                observed, record.name, record.status
            );
            return record;
        }

        let mut update = InstanceUpdate::status(observed);
        if observed == InstanceStatus::Stopped {
            update = update.with_health(HealthStatus::Stopped);
        }
        match self.store.update_instance(record.id, &update) {
            Ok(Some(updated)) => {
                debug!(
                    "Resynced {} from {} to {}",
                    updated.name, record.status, updated.status
                );
                updated
            }
            Ok(None) => record,
            Err(e) => {
                warn!("Could not resync {}: {}", record.name, e);
                record
            }
        }
    }

    fn container_spec(&self, record: &Instance) -> ContainerSpec {
        let config = &record.config;
        let mut mounts = vec![VolumeMount::new(
            record.data_volume(),
            self.settings.data_mount_path.clone(),
        )];
        mounts.extend(config.volumes.iter().cloned());

        let ports = match (record.port, record.container_port()) {
            (Some(host_port), Some(container_port)) => vec![PortMapping {
                container_port,
                host_port,
            }],
            _ => Vec::new(),
        };

        ContainerSpec {
            name: record.name.clone(),
            image: config.image.clone(),
            environment: config.environment.clone(),
            ports,
            mounts,
            network: Some(self.settings.network_name.clone()),
            extra_networks: config.networks.clone(),
            memory_bytes: config.resource_limits.memory_bytes(),
            nano_cpus: config.resource_limits.nano_cpus(),
            labels: [(INSTANCE_LABEL.to_string(), record.name.clone())]
                .into_iter()
                .collect(),
        }
    }
}

fn name_conflict(name: &str) -> OrchestratorError {
    OrchestratorError::ValidationFailed(format!("instance name '{name}' is already in use"))
}

fn ensure_transition(record: &Instance, next: InstanceStatus) -> Result<()> {
    if record.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(OrchestratorError::ValidationFailed(format!(
            "instance {} cannot go from {} to {}",
            record.name, record.status, next
        )))
    }
}

fn require_container(record: &Instance) -> Result<&str> {
    record.container_ref.as_deref().ok_or_else(|| {
        OrchestratorError::NotFound(format!("container for instance {}", record.name))
    })
}
