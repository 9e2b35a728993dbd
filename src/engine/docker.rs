//! Docker Engine backend over the bollard API client

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, PruneImagesOptions};
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, EndpointSettings, HostConfig, Mount,
    MountTypeEnum, PortBinding, PortMap,
};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions, PruneNetworksOptions,
};
use bollard::volume::{CreateVolumeOptions, PruneVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, trace, warn};

use crate::core::client::is_named_volume;
use crate::core::resource::StatsSample;
use crate::core::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary,
    EngineError, HelperSpec, PortMapping,
};
use crate::core::VolumeMount;

/// [`ContainerRuntime`] backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn connect_local() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(map_error)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn connect_extra_networks(&self, id: &str, networks: &[String]) -> Result<(), EngineError> {
        for network in networks {
            self.docker
                .connect_network(
                    network,
                    ConnectNetworkOptions {
                        container: id.to_string(),
                        endpoint_config: EndpointSettings::default(),
                    },
                )
                .await
                .map_err(map_error)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(map_error)?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        exists(self.docker.inspect_image(image).await)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let info = update.map_err(map_error)?;
            if let Some(status) = info.status {
                trace!("pull {}: {}", image, status);
            }
        }
        Ok(())
    }

    async fn network_exists(&self, name: &str) -> Result<bool, EngineError> {
        exists(
            self.docker
                .inspect_network(name, None::<InspectNetworkOptions<String>>)
                .await,
        )
    }

    async fn create_network(&self, name: &str) -> Result<(), EngineError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.docker.create_network(options).await.map_err(map_error)?;
        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool, EngineError> {
        exists(self.docker.inspect_volume(name).await)
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            ..Default::default()
        };
        self.docker.create_volume(options).await.map_err(map_error)?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
            .map_err(map_error)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(map_error)?;
        for warning in &response.warnings {
            debug!("create {}: {}", spec.name, warning);
        }

        if let Err(e) = self
            .connect_extra_networks(&response.id, &spec.extra_networks)
            .await
        {
            if let Err(cleanup) = self.remove_container(&response.id, true, false).await {
                warn!(
                    "Could not remove {} after network attach failed: {}",
                    spec.name, cleanup
                );
            }
            return Err(e);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: i64::from(timeout_secs),
        };
        self.docker
            .stop_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn restart_container(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError> {
        let options = RestartContainerOptions {
            t: timeout_secs as isize,
        };
        self.docker
            .restart_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        remove_volumes: bool,
    ) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(map_error)
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        Ok(container_details(response))
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, EngineError> {
        // A non-streaming read waits for two samples so precpu_stats is populated
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(id, Some(options));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| EngineError::Other(format!("no stats returned for {id}")))?
            .map_err(map_error)?;

        let (network_rx_bytes, network_tx_bytes) = stats
            .networks
            .iter()
            .flat_map(|networks| networks.values())
            .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes));
        let (block_read_bytes, block_write_bytes) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .iter()
            .flatten()
            .fold((0, 0), |(read, write), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (read + entry.value, write),
                    "write" => (read, write + entry.value),
                    _ => (read, write),
                }
            });

        Ok(StatsSample {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage.unwrap_or_default(),
            presystem_cpu: stats.precpu_stats.system_cpu_usage.unwrap_or_default(),
            online_cpus: stats.cpu_stats.online_cpus,
            percpu_count: stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map_or(0, Vec::len),
            memory_usage: stats.memory_stats.usage.unwrap_or_default(),
            memory_limit: stats.memory_stats.limit.unwrap_or_default(),
            network_rx_bytes,
            network_tx_bytes,
            block_read_bytes,
            block_write_bytes,
            pids: stats.pids_stats.current.unwrap_or_default(),
        })
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk.map_err(map_error)?.to_string());
        }
        Ok(output)
    }

    async fn list_containers(
        &self,
        state: Option<ContainerState>,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters = HashMap::new();
        if let Some(state) = state {
            filters.insert("status".to_string(), vec![state.label().to_string()]);
        }
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                state: c.state.as_deref().map_or(ContainerState::Unknown, parse_state),
            })
            .collect())
    }

    async fn prune_images(&self) -> Result<u64, EngineError> {
        let response = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(map_error)?;
        Ok(response.images_deleted.map_or(0, |d| d.len() as u64))
    }

    async fn prune_volumes(&self) -> Result<u64, EngineError> {
        let response = self
            .docker
            .prune_volumes(None::<PruneVolumesOptions<String>>)
            .await
            .map_err(map_error)?;
        Ok(response.volumes_deleted.map_or(0, |d| d.len() as u64))
    }

    async fn prune_networks(&self) -> Result<u64, EngineError> {
        let response = self
            .docker
            .prune_networks(None::<PruneNetworksOptions<String>>)
            .await
            .map_err(map_error)?;
        Ok(response.networks_deleted.map_or(0, |d| d.len() as u64))
    }

    async fn run_helper(&self, spec: &HelperSpec) -> Result<i64, EngineError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            host_config: Some(HostConfig {
                mounts: Some(spec.mounts.iter().map(mount).collect()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_error)?;

        let exit_code = async {
            self.start_container(&created.id).await?;
            let mut wait = self
                .docker
                .wait_container(&created.id, None::<WaitContainerOptions<String>>);
            match wait.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(map_error(e)),
                None => Err(EngineError::Other(format!(
                    "helper {} ended without a wait result",
                    spec.name
                ))),
            }
        }
        .await;

        if let Err(e) = self.remove_container(&created.id, true, false).await {
            debug!("Could not remove helper {}: {}", spec.name, e);
        }
        exit_code
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let env = spec
        .environment
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings: PortMap = HashMap::new();
    for mapping in &spec.ports {
        let key = format!("{}/tcp", mapping.container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(mapping.host_port.to_string()),
            }]),
        );
    }

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        mounts: Some(spec.mounts.iter().map(mount).collect()),
        network_mode: spec.network.clone(),
        memory: spec.memory_bytes,
        nano_cpus: spec.nano_cpus,
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        env: Some(env),
        exposed_ports: Some(exposed_ports),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn mount(volume: &VolumeMount) -> Mount {
    let typ = if is_named_volume(&volume.source) {
        MountTypeEnum::VOLUME
    } else {
        MountTypeEnum::BIND
    };
    Mount {
        source: Some(volume.source.clone()),
        target: Some(volume.target.clone()),
        typ: Some(typ),
        read_only: Some(volume.read_only),
        ..Default::default()
    }
}

fn container_details(response: ContainerInspectResponse) -> ContainerDetails {
    let state = response.state.as_ref();
    ContainerDetails {
        id: response.id.clone().unwrap_or_default(),
        name: response
            .name
            .as_deref()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        state: state
            .and_then(|s| s.status.clone())
            .map_or(ContainerState::Unknown, state_from_status),
        created_at: response.created.as_deref().and_then(parse_time),
        started_at: state
            .and_then(|s| s.started_at.as_deref())
            .and_then(parse_time),
        ports: response
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref())
            .map(published_ports)
            .unwrap_or_default(),
        mounts: response
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| {
                let source = m.name.or(m.source).unwrap_or_default();
                format!("{}:{}", source, m.destination.unwrap_or_default())
            })
            .collect(),
    }
}

fn published_ports(ports: &PortMap) -> Vec<PortMapping> {
    let mut mappings: Vec<PortMapping> = ports
        .iter()
        .filter_map(|(key, bindings)| {
            let container_port = key.split('/').next()?.parse().ok()?;
            let host_port = bindings
                .iter()
                .flatten()
                .find_map(|b| b.host_port.as_deref()?.parse().ok())?;
            Some(PortMapping {
                container_port,
                host_port,
            })
        })
        .collect();
    mappings.sort_by_key(|m| m.container_port);
    mappings.dedup();
    mappings
}

fn state_from_status(status: ContainerStateStatusEnum) -> ContainerState {
    match status {
        ContainerStateStatusEnum::CREATED => ContainerState::Created,
        ContainerStateStatusEnum::RUNNING => ContainerState::Running,
        ContainerStateStatusEnum::PAUSED => ContainerState::Paused,
        ContainerStateStatusEnum::RESTARTING => ContainerState::Restarting,
        ContainerStateStatusEnum::REMOVING => ContainerState::Removing,
        ContainerStateStatusEnum::EXITED => ContainerState::Exited,
        ContainerStateStatusEnum::DEAD => ContainerState::Dead,
        ContainerStateStatusEnum::EMPTY => ContainerState::Unknown,
    }
}

fn parse_state(state: &str) -> ContainerState {
    match state {
        "created" => ContainerState::Created,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "restarting" => ContainerState::Restarting,
        "removing" => ContainerState::Removing,
        "exited" => ContainerState::Exited,
        "dead" => ContainerState::Dead,
        _ => ContainerState::Unknown,
    }
}

/// Docker reports "never" as the zero time `0001-01-01T00:00:00Z`
fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0)
}

fn exists<T>(result: Result<T, BollardError>) -> Result<bool, EngineError> {
    match result.map_err(map_error) {
        Ok(_) => Ok(true),
        Err(EngineError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn map_error(error: BollardError) -> EngineError {
    match error {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            304 => EngineError::NotModified,
            404 => EngineError::NotFound(message),
            409 => EngineError::AlreadyExists(message),
            status => EngineError::Api { status, message },
        },
        BollardError::DockerStreamError { error } => EngineError::Other(error),
        e @ (BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::RequestTimeoutError) => EngineError::Connection(e.to_string()),
        e => EngineError::Other(e.to_string()),
    }
}
