//! Resilient façade over the container runtime
//!
//! [`RuntimeClient`] owns connection establishment (retry with exponential
//! backoff), wraps every runtime call in its per-operation timeout and turns
//! [`EngineError`]s into [`OrchestratorError`]s carrying the operation and
//! target. Timeouts drop the in-flight request future; the engine may still
//! finish the effect on its side.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::error::{OrchestratorError, Result};
use super::resource::ResourceUsage;
use super::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary,
    EngineError, HelperSpec, PortMapping, RuntimeOperation,
};
use super::settings::{OperationTimeouts, Settings};

const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tunables for [`RuntimeClient`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeouts: OperationTimeouts,
    /// How long a start/stop/restart may take to show up in inspect
    pub verify_grace: Duration,
    /// Seconds the engine waits before killing a stopping container
    pub stop_timeout_secs: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ClientConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.connect_max_retries.max(1),
            base_delay: settings.connect_base_delay(),
            timeouts: settings.timeouts.clone(),
            verify_grace: settings.verify_grace(),
            stop_timeout_secs: settings.stop_timeout_secs,
        }
    }
}

/// Live view of a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<String>,
    /// Only sampled for running containers
    pub resource_usage: Option<ResourceUsage>,
}

/// Per-category results of [`RuntimeClient::cleanup_unused`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub containers: u64,
    pub images: u64,
    pub volumes: u64,
    pub networks: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.containers + self.images + self.volumes + self.networks
    }
}

pub struct RuntimeClient {
    runtime: Arc<dyn ContainerRuntime>,
    config: ClientConfig,
    connected: AtomicBool,
}

impl RuntimeClient {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: ClientConfig) -> Self {
        Self {
            runtime,
            config,
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Ping the runtime until it answers, backing off `base * 2^attempt` between tries
    pub async fn connect(&self) -> Result<()> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = EngineError::Connection("no attempt made".to_string());

        for attempt in 0..attempts {
            match self.ping_once().await {
                Ok(()) => {
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Connected to container runtime (attempt {})", attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Container runtime ping failed (attempt {}/{}): {}",
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }

            if attempt + 1 < attempts {
                let delay = self
                    .config
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt));
                debug!("Retrying runtime connection in {:?}", delay);
                sleep(delay).await;
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        Err(OrchestratorError::RuntimeUnavailable {
            attempts,
            source: last_error,
        })
    }

    /// Re-ping a cached connection, reconnecting with backoff if it went away
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            match self.ping_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("Container runtime stopped answering: {}", e);
                    self.connected.store(false, Ordering::SeqCst);
                }
            }
        }
        self.connect().await
    }

    /// Single ping, no retries
    pub async fn is_available(&self) -> bool {
        let ok = self.ping_once().await.is_ok();
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn ping_once(&self) -> std::result::Result<(), EngineError> {
        let budget = self.config.timeouts.get(RuntimeOperation::Ping);
        match timeout(budget, self.runtime.ping()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Connection(format!(
                "ping timed out after {:?}",
                budget
            ))),
        }
    }

    /// Run `fut` within the budget for `operation`, without error translation.
    ///
    /// Connects first if no connection is cached. A connection error from the
    /// call triggers a reconnect; if that fails the caller sees
    /// [`OrchestratorError::RuntimeUnavailable`].
    async fn within<T, F>(
        &self,
        operation: RuntimeOperation,
        fut: F,
    ) -> Result<std::result::Result<T, EngineError>>
    where
        F: Future<Output = std::result::Result<T, EngineError>>,
    {
        if !self.is_connected() {
            self.connect().await?;
        }

        let budget = self.config.timeouts.get(operation);
        match timeout(budget, fut).await {
            Ok(result) => {
                if let Err(EngineError::Connection(e)) = &result {
                    warn!("{} lost the container runtime: {}", operation, e);
                    self.connected.store(false, Ordering::SeqCst);
                    self.connect().await?;
                }
                Ok(result)
            }
            Err(_) => {
                warn!("{} timed out after {:?}", operation, budget);
                Err(OrchestratorError::OperationTimedOut {
                    operation,
                    after: budget,
                })
            }
        }
    }

    /// Run `fut` within its budget and translate engine errors
    async fn timed<T, F>(&self, operation: RuntimeOperation, target: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, EngineError>>,
    {
        self.within(operation, fut)
            .await?
            .map_err(|e| translate(operation, target, e))
    }

    // === Images, networks, volumes ===

    /// Pull `image` unless it is already present
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        let fut = async {
            if self.runtime.image_exists(image).await? {
                return Ok(());
            }
            info!("Pulling image {}", image);
            self.runtime.pull_image(image).await
        };
        self.within(RuntimeOperation::PullImage, fut)
            .await?
            .map_err(|source| OrchestratorError::ImagePullFailed {
                image: image.to_string(),
                source,
            })
    }

    pub async fn ensure_network(&self, name: &str) -> Result<()> {
        let fut = async {
            if self.runtime.network_exists(name).await? {
                return Ok(());
            }
            info!("Creating network {}", name);
            match self.runtime.create_network(name).await {
                Err(EngineError::AlreadyExists(_)) => Ok(()),
                other => other,
            }
        };
        self.within(RuntimeOperation::EnsureNetwork, fut)
            .await?
            .map_err(|source| OrchestratorError::NetworkSetupFailed {
                network: name.to_string(),
                source,
            })
    }

    pub async fn ensure_volume(&self, name: &str) -> Result<()> {
        let fut = async {
            if self.runtime.volume_exists(name).await? {
                return Ok(());
            }
            debug!("Creating volume {}", name);
            match self.runtime.create_volume(name).await {
                Err(EngineError::AlreadyExists(_)) => Ok(()),
                other => other,
            }
        };
        self.within(RuntimeOperation::EnsureVolume, fut)
            .await?
            .map_err(|source| OrchestratorError::VolumeSetupFailed {
                volume: name.to_string(),
                source,
            })
    }

    /// Remove a volume; a missing volume is not an error
    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        match self
            .within(RuntimeOperation::RemoveVolume, self.runtime.remove_volume(name, force))
            .await?
        {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(translate(RuntimeOperation::RemoveVolume, name, e)),
        }
    }

    // === Containers ===

    /// Ensure the image, networks and named volumes exist, then create the container
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_connected().await?;
        self.ensure_image(&spec.image).await?;
        for network in spec.network.iter().chain(spec.extra_networks.iter()) {
            self.ensure_network(network).await?;
        }
        for mount in spec.mounts.iter().filter(|m| is_named_volume(&m.source)) {
            self.ensure_volume(&mount.source).await?;
        }

        let result = self
            .timed(
                RuntimeOperation::CreateContainer,
                &spec.name,
                self.runtime.create_container(spec),
            )
            .await;

        match result {
            Ok(id) => {
                info!("Created container {} ({})", spec.name, short_id(&id));
                Ok(id)
            }
            Err(e @ OrchestratorError::OperationTimedOut { .. }) => {
                // The create may still land after we gave up on it
                self.discard_container(&spec.name).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_container(&self, name_or_id: &str) {
        match self
            .within(
                RuntimeOperation::RemoveContainer,
                self.runtime.remove_container(name_or_id, true, false),
            )
            .await
        {
            Ok(Ok(())) => debug!("Discarded partially created container {}", name_or_id),
            Ok(Err(EngineError::NotFound(_))) => {}
            Ok(Err(e)) => warn!("Could not discard container {}: {}", name_or_id, e),
            Err(e) => warn!("Could not discard container {}: {}", name_or_id, e),
        }
    }

    /// Start a container and confirm it is running
    pub async fn start_container(&self, id: &str) -> Result<ContainerDetails> {
        match self
            .within(RuntimeOperation::StartContainer, self.runtime.start_container(id))
            .await?
        {
            Ok(()) | Err(EngineError::NotModified) => {}
            Err(e) => return Err(translate(RuntimeOperation::StartContainer, id, e)),
        }
        self.await_state(RuntimeOperation::StartContainer, id, ContainerState::Running, |s| {
            s.is_running()
        })
        .await
    }

    /// Stop a container and confirm it is no longer running. Already stopped is fine.
    pub async fn stop_container(&self, id: &str) -> Result<ContainerDetails> {
        let grace = self.config.stop_timeout_secs;
        match self
            .within(RuntimeOperation::StopContainer, self.runtime.stop_container(id, grace))
            .await?
        {
            Ok(()) | Err(EngineError::NotModified) => {}
            Err(e) => return Err(translate(RuntimeOperation::StopContainer, id, e)),
        }
        self.await_state(RuntimeOperation::StopContainer, id, ContainerState::Exited, |s| {
            matches!(
                s,
                ContainerState::Exited | ContainerState::Created | ContainerState::Dead
            )
        })
        .await
    }

    /// Restart a container and confirm it is running again
    pub async fn restart_container(&self, id: &str) -> Result<ContainerDetails> {
        let grace = self.config.stop_timeout_secs;
        self.timed(
            RuntimeOperation::RestartContainer,
            id,
            self.runtime.restart_container(id, grace),
        )
        .await?;
        self.await_state(RuntimeOperation::RestartContainer, id, ContainerState::Running, |s| {
            s.is_running()
        })
        .await
    }

    /// Poll inspect until `accept` holds or the verify grace runs out
    async fn await_state(
        &self,
        operation: RuntimeOperation,
        id: &str,
        expected: ContainerState,
        accept: impl Fn(&ContainerState) -> bool,
    ) -> Result<ContainerDetails> {
        let deadline = Instant::now() + self.config.verify_grace;
        loop {
            let details = self.inspect(id).await?;
            if accept(&details.state) {
                return Ok(details);
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} on {}: expected {}, still {}",
                    operation,
                    short_id(id),
                    expected,
                    details.state
                );
                return Err(OrchestratorError::UnexpectedRuntimeError {
                    operation,
                    target: id.to_string(),
                    source: EngineError::StateMismatch {
                        expected,
                        actual: details.state,
                    },
                });
            }
            sleep(VERIFY_POLL_INTERVAL.min(self.config.verify_grace)).await;
        }
    }

    /// Stop (if running) and remove a container. Already gone is success.
    pub async fn remove_container(&self, id: &str, force: bool, remove_volumes: bool) -> Result<()> {
        match self.inspect(id).await {
            Ok(details) if details.state.is_running() => {
                if let Err(e) = self.stop_container(id).await {
                    if !force {
                        return Err(e);
                    }
                    warn!("Stop before removal failed for {}: {}", short_id(id), e);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!("Container {} already removed", short_id(id));
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self
            .within(
                RuntimeOperation::RemoveContainer,
                self.runtime.remove_container(id, force, remove_volumes),
            )
            .await?
        {
            Ok(()) | Err(EngineError::NotFound(_)) => {
                info!("Removed container {}", short_id(id));
                Ok(())
            }
            Err(e) => Err(translate(RuntimeOperation::RemoveContainer, id, e)),
        }
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerDetails> {
        self.timed(
            RuntimeOperation::InspectContainer,
            id,
            self.runtime.inspect_container(id),
        )
        .await
    }

    /// Inspect plus a stats sample for running containers
    pub async fn status(&self, id: &str) -> Result<ContainerStatus> {
        let details = self.inspect(id).await?;
        let resource_usage = if details.state.is_running() {
            match self.stats(id).await {
                Ok(usage) => Some(usage),
                Err(e) => {
                    warn!("Stats unavailable for {}: {}", short_id(id), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(ContainerStatus {
            state: details.state,
            created_at: details.created_at,
            started_at: details.started_at,
            ports: details.ports,
            mounts: details.mounts,
            resource_usage,
        })
    }

    pub async fn stats(&self, id: &str) -> Result<ResourceUsage> {
        let sample = self
            .timed(RuntimeOperation::Stats, id, self.runtime.stats(id))
            .await?;
        Ok(ResourceUsage::from_sample(&sample))
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String> {
        self.timed(RuntimeOperation::Logs, id, self.runtime.logs(id, tail))
            .await
    }

    pub async fn list_containers(
        &self,
        state: Option<ContainerState>,
    ) -> Result<Vec<ContainerSummary>> {
        self.timed(
            RuntimeOperation::ListContainers,
            "containers",
            self.runtime.list_containers(state),
        )
        .await
    }

    /// Run a disposable helper container to completion; non-zero exit is a failure
    pub async fn run_helper(&self, spec: &HelperSpec) -> Result<()> {
        let code = self
            .timed(RuntimeOperation::RunHelper, &spec.name, self.runtime.run_helper(spec))
            .await?;
        if code != 0 {
            return Err(OrchestratorError::UnexpectedRuntimeError {
                operation: RuntimeOperation::RunHelper,
                target: spec.name.clone(),
                source: EngineError::HelperFailed(code),
            });
        }
        Ok(())
    }

    /// Best-effort removal of stopped containers and unused images, volumes and
    /// networks. Containers whose id or name is in `keep` are left alone. A
    /// failing category counts as zero and does not stop the others.
    pub async fn cleanup_unused(&self, keep: &HashSet<String>) -> CleanupReport {
        let report = CleanupReport {
            containers: self.remove_stopped_containers(keep).await,
            images: self
                .prune_category("images", self.runtime.prune_images())
                .await,
            volumes: self
                .prune_category("volumes", self.runtime.prune_volumes())
                .await,
            networks: self
                .prune_category("networks", self.runtime.prune_networks())
                .await,
        };
        info!(
            "Cleanup removed {} objects ({} containers, {} images, {} volumes, {} networks)",
            report.total(),
            report.containers,
            report.images,
            report.volumes,
            report.networks
        );
        report
    }

    async fn remove_stopped_containers(&self, keep: &HashSet<String>) -> u64 {
        let stopped = match self.list_containers(Some(ContainerState::Exited)).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Cleanup of containers failed: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for container in stopped
            .iter()
            .filter(|c| !keep.contains(&c.id) && !keep.contains(&c.name))
        {
            let result = self
                .timed(
                    RuntimeOperation::Cleanup,
                    &container.name,
                    self.runtime.remove_container(&container.id, false, false),
                )
                .await;
            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove container {}: {}", container.name, e),
            }
        }
        removed
    }

    async fn prune_category<F>(&self, category: &str, fut: F) -> u64
    where
        F: Future<Output = std::result::Result<u64, EngineError>>,
    {
        match self.timed(RuntimeOperation::Cleanup, category, fut).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Cleanup of {} failed: {}", category, e);
                0
            }
        }
    }
}

fn translate(operation: RuntimeOperation, target: &str, error: EngineError) -> OrchestratorError {
    match error {
        EngineError::NotFound(what) => OrchestratorError::NotFound(what),
        source => OrchestratorError::UnexpectedRuntimeError {
            operation,
            target: target.to_string(),
            source,
        },
    }
}

/// Bind mounts use host paths; anything else is a named volume
pub(crate) fn is_named_volume(source: &str) -> bool {
    !(source.starts_with('/') || source.starts_with('.') || source.starts_with('~'))
}

pub(crate) fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
