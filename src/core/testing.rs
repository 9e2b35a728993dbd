//! In-memory fakes for the runtime and health probe, plus an orchestrator harness

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::client::{ClientConfig, RuntimeClient};
use super::health::{HealthProbe, ProbeOutcome};
use super::instance::{Instance, InstanceConfig};
use super::orchestrator::InstanceOrchestrator;
use super::ports::{free_port_range, PortAllocator};
use super::resource::StatsSample;
use super::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary,
    EngineError, HelperSpec,
};
use super::settings::{OperationTimeouts, Settings};
use crate::persistence::{Database, InstanceStore};

/// Calls the fake can fail, delay and count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeCall {
    Ping,
    PullImage,
    CreateNetwork,
    CreateVolume,
    RemoveVolume,
    CreateContainer,
    Start,
    Stop,
    Restart,
    Remove,
    Inspect,
    Stats,
    Logs,
    List,
    PruneImages,
    PruneVolumes,
    PruneNetworks,
    RunHelper,
}

struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    state: ContainerState,
    created_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    images: HashSet<String>,
    networks: HashSet<String>,
    /// volume name -> file path -> contents
    volumes: HashMap<String, BTreeMap<String, String>>,
    next_id: u64,
    calls: Vec<FakeCall>,
    failures: HashMap<FakeCall, EngineError>,
    delays: HashMap<FakeCall, Duration>,
    pings_to_fail: u32,
    ignore_starts: bool,
    helper_exit_code: i64,
    prune_counts: (u64, u64, u64),
}

impl FakeState {
    fn find(&mut self, key: &str) -> Result<&mut FakeContainer, EngineError> {
        self.containers
            .iter_mut()
            .find(|c| c.id == key || c.spec.name == key)
            .ok_or_else(|| EngineError::NotFound(format!("container {key}")))
    }
}

/// In-memory container engine
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Fail every `call` with `error` until cleared
    pub fn fail(&self, call: FakeCall, error: EngineError) {
        self.state().failures.insert(call, error);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn delay(&self, call: FakeCall, by: Duration) {
        self.state().delays.insert(call, by);
    }

    pub fn fail_pings(&self, count: u32) {
        self.state().pings_to_fail = count;
    }

    /// Accept start/restart calls without changing container state
    pub fn ignore_starts(&self, ignore: bool) {
        self.state().ignore_starts = ignore;
    }

    pub fn set_helper_exit_code(&self, code: i64) {
        self.state().helper_exit_code = code;
    }

    pub fn set_prune_counts(&self, images: u64, volumes: u64, networks: u64) {
        self.state().prune_counts = (images, volumes, networks);
    }

    /// Change a container's state behind the orchestrator's back
    pub fn set_state(&self, key: &str, state: ContainerState) {
        self.state().find(key).unwrap().state = state;
    }

    /// Drop a container without going through the API
    pub fn forget_container(&self, key: &str) {
        self.state()
            .containers
            .retain(|c| c.id != key && c.spec.name != key);
    }

    pub fn container_state(&self, key: &str) -> Option<ContainerState> {
        self.state().find(key).ok().map(|c| c.state)
    }

    pub fn container_spec(&self, key: &str) -> Option<ContainerSpec> {
        self.state().find(key).ok().map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    pub fn call_count(&self, call: FakeCall) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.state().images.contains(image)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state().networks.contains(name)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains_key(name)
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    pub fn write_file(&self, volume: &str, path: &str, contents: &str) {
        self.state()
            .volumes
            .entry(volume.to_string())
            .or_default()
            .insert(path.to_string(), contents.to_string());
    }

    pub fn volume_files(&self, volume: &str) -> BTreeMap<String, String> {
        self.state().volumes.get(volume).cloned().unwrap_or_default()
    }

    /// Record the call, apply any configured delay, then any configured failure
    async fn enter(&self, call: FakeCall) -> Result<(), EngineError> {
        let (delay, failure) = {
            let mut state = self.state();
            state.calls.push(call);
            (
                state.delays.get(&call).copied(),
                state.failures.get(&call).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), EngineError> {
        let mut state = self.state();
        state.calls.push(FakeCall::Ping);
        if state.pings_to_fail > 0 {
            state.pings_to_fail -= 1;
            return Err(EngineError::Connection("daemon not running".into()));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        Ok(self.has_image(image))
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.enter(FakeCall::PullImage).await?;
        self.state().images.insert(image.to_string());
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.has_network(name))
    }

    async fn create_network(&self, name: &str) -> Result<(), EngineError> {
        self.enter(FakeCall::CreateNetwork).await?;
        self.state().networks.insert(name.to_string());
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.has_volume(name))
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        self.enter(FakeCall::CreateVolume).await?;
        self.state().volumes.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> Result<(), EngineError> {
        self.enter(FakeCall::RemoveVolume).await?;
        self.state()
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("volume {name}")))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.enter(FakeCall::CreateContainer).await?;
        let mut state = self.state();
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::AlreadyExists(format!("container {}", spec.name)));
        }
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(format!("image {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
            created_at: Utc::now(),
            started_at: None,
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.enter(FakeCall::Start).await?;
        let mut state = self.state();
        let ignore = state.ignore_starts;
        let container = state.find(id)?;
        if container.state == ContainerState::Running {
            return Err(EngineError::NotModified);
        }
        if !ignore {
            container.state = ContainerState::Running;
            container.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u32) -> Result<(), EngineError> {
        self.enter(FakeCall::Stop).await?;
        let mut state = self.state();
        let container = state.find(id)?;
        if container.state != ContainerState::Running {
            return Err(EngineError::NotModified);
        }
        container.state = ContainerState::Exited;
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout_secs: u32) -> Result<(), EngineError> {
        self.enter(FakeCall::Restart).await?;
        let mut state = self.state();
        let ignore = state.ignore_starts;
        let container = state.find(id)?;
        if !ignore {
            container.state = ContainerState::Running;
            container.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        _remove_volumes: bool,
    ) -> Result<(), EngineError> {
        self.enter(FakeCall::Remove).await?;
        let mut state = self.state();
        let container = state.find(id)?;
        if container.state == ContainerState::Running && !force {
            return Err(EngineError::Api {
                status: 409,
                message: "container is running".into(),
            });
        }
        let id = container.id.clone();
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        self.enter(FakeCall::Inspect).await?;
        let mut state = self.state();
        let container = state.find(id)?;
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.spec.name.clone(),
            state: container.state,
            created_at: Some(container.created_at),
            started_at: container.started_at,
            ports: container.spec.ports.clone(),
            mounts: container
                .spec
                .mounts
                .iter()
                .map(|m| format!("{}:{}", m.source, m.target))
                .collect(),
        })
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, EngineError> {
        self.enter(FakeCall::Stats).await?;
        self.state().find(id)?;
        Ok(StatsSample {
            cpu_total: 400,
            precpu_total: 200,
            system_cpu: 2_000,
            presystem_cpu: 1_000,
            online_cpus: Some(2),
            percpu_count: 2,
            memory_usage: 128 * 1024 * 1024,
            memory_limit: 512 * 1024 * 1024,
            pids: 7,
            ..Default::default()
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError> {
        self.enter(FakeCall::Logs).await?;
        let mut state = self.state();
        let container = state.find(id)?;
        let lines: Vec<String> = (1..=tail.min(3))
            .map(|n| format!("{} log line {}", container.spec.name, n))
            .collect();
        Ok(lines.join("\n"))
    }

    async fn list_containers(
        &self,
        filter: Option<ContainerState>,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.enter(FakeCall::List).await?;
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|c| filter.map_or(true, |s| c.state == s))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                state: c.state,
            })
            .collect())
    }

    async fn prune_images(&self) -> Result<u64, EngineError> {
        self.enter(FakeCall::PruneImages).await?;
        Ok(self.state().prune_counts.0)
    }

    async fn prune_volumes(&self) -> Result<u64, EngineError> {
        self.enter(FakeCall::PruneVolumes).await?;
        Ok(self.state().prune_counts.1)
    }

    async fn prune_networks(&self) -> Result<u64, EngineError> {
        self.enter(FakeCall::PruneNetworks).await?;
        Ok(self.state().prune_counts.2)
    }

    /// Emulates `cp -a /from/. /to/` between the two mounted volumes
    async fn run_helper(&self, spec: &HelperSpec) -> Result<i64, EngineError> {
        self.enter(FakeCall::RunHelper).await?;
        let mut state = self.state();
        if !state.images.contains(&spec.image) {
            return Err(EngineError::NotFound(format!("image {}", spec.image)));
        }
        if state.helper_exit_code != 0 {
            return Ok(state.helper_exit_code);
        }

        let volume_at = |target: &str| {
            spec.mounts
                .iter()
                .find(|m| m.target == target)
                .map(|m| m.source.clone())
        };
        let (Some(from), Some(to)) = (volume_at("/from"), volume_at("/to")) else {
            return Ok(2);
        };
        let files = state.volumes.get(&from).cloned().unwrap_or_default();
        state.volumes.entry(to).or_default().extend(files);
        Ok(0)
    }
}

/// Scripted probe; ports without a script answer HTTP 200
#[derive(Default)]
pub struct FakeProbe {
    outcomes: Mutex<HashMap<u16, ProbeOutcome>>,
    probes: Mutex<Vec<u16>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, port: u16, outcome: ProbeOutcome) {
        self.outcomes.lock().unwrap().insert(port, outcome);
    }

    pub fn probe_count(&self, port: u16) -> usize {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| **p == port)
            .count()
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, port: u16, _timeout: Duration) -> ProbeOutcome {
        self.probes.lock().unwrap().push(port);
        self.outcomes
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or(ProbeOutcome::Status(200))
    }
}

/// Settings with small budgets and a port range that is free on this host
pub fn test_settings(ports: (u16, u16)) -> Settings {
    Settings {
        port_range_start: ports.0,
        port_range_end: ports.1,
        default_image: "app:latest".to_string(),
        default_environment: BTreeMap::new(),
        network_name: "test_net".to_string(),
        data_mount_path: "/data".to_string(),
        connect_max_retries: 2,
        connect_base_delay_ms: 10,
        timeouts: OperationTimeouts::uniform(Duration::from_secs(5)),
        verify_grace_ms: 200,
        stop_timeout_secs: 1,
        ..Default::default()
    }
}

/// Orchestrator wired to fakes and an in-memory database
pub struct Harness {
    pub orchestrator: Arc<InstanceOrchestrator>,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub store: Arc<Database>,
    pub ports: Arc<PortAllocator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings(free_port_range(5)))
    }

    pub fn with_settings(settings: Settings) -> Self {
        let runtime = FakeRuntime::new();
        let probe = FakeProbe::new();
        let store = Arc::new(Database::open_in_memory().unwrap());
        let ports = PortAllocator::new();
        let client = Arc::new(RuntimeClient::new(
            runtime.clone(),
            ClientConfig::from_settings(&settings),
        ));
        let orchestrator = Arc::new(InstanceOrchestrator::new(
            store.clone() as Arc<dyn InstanceStore>,
            client,
            ports.clone(),
            probe.clone(),
            settings,
        ));

        Self {
            orchestrator,
            runtime,
            probe,
            store,
            ports,
        }
    }

    /// Create (and auto-start) an instance with the default image
    pub async fn create_running(&self, name: &str) -> Instance {
        self.orchestrator
            .create(name, InstanceConfig::default())
            .await
            .unwrap()
    }

    pub fn container_state(&self, instance: &Instance) -> Option<ContainerState> {
        self.runtime
            .container_state(instance.container_ref.as_deref()?)
    }
}
