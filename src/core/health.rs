//! Health checking - application-level liveness of running instances

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::client::RuntimeClient;
use super::error::{OrchestratorError, Result};
use super::instance::{HealthCheckResult, HealthStatus, Instance, InstanceId, InstanceUpdate};
use crate::persistence::InstanceStore;

/// What an HTTP probe observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered with this status code
    Status(u16),
    /// Connection refused or reset; the app has likely not bound its port yet
    ConnectionRefused,
    TimedOut,
    Failed(String),
}

impl ProbeOutcome {
    /// Map a probe observation to a health state
    pub fn classify(&self) -> (HealthStatus, String) {
        match self {
            Self::Status(200) => (HealthStatus::Healthy, "responding".to_string()),
            Self::Status(code) => (HealthStatus::Unhealthy, format!("responded with HTTP {code}")),
            Self::ConnectionRefused => (
                HealthStatus::Starting,
                "connection refused, application still starting".to_string(),
            ),
            Self::TimedOut => (HealthStatus::Unhealthy, "health probe timed out".to_string()),
            Self::Failed(reason) => (HealthStatus::Unhealthy, format!("health probe failed: {reason}")),
        }
    }
}

/// Application health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// GET the root path on a published host port
    async fn probe(&self, port: u16, timeout: Duration) -> ProbeOutcome;
}

/// Plain HTTP GET against `http://127.0.0.1:<port>/`
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, port: u16, timeout: Duration) -> ProbeOutcome {
        let url = format!("http://127.0.0.1:{port}/");
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) => ProbeOutcome::Status(response.status().as_u16()),
            Err(e) if e.is_timeout() => ProbeOutcome::TimedOut,
            Err(e) if e.is_connect() || is_refused_or_reset(&e) => ProbeOutcome::ConnectionRefused,
            Err(e) => ProbeOutcome::Failed(e.to_string()),
        }
    }
}

fn is_refused_or_reset(error: &reqwest::Error) -> bool {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            );
        }
        source = cause.source();
    }
    false
}

/// Evaluates and records instance health
pub struct HealthChecker {
    store: Arc<dyn InstanceStore>,
    client: Arc<RuntimeClient>,
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    grace: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        client: Arc<RuntimeClient>,
        probe: Arc<dyn HealthProbe>,
        probe_timeout: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            client,
            probe,
            probe_timeout,
            grace,
        }
    }

    /// Check an instance by id and persist the outcome
    pub async fn check(&self, id: InstanceId) -> Result<HealthCheckResult> {
        let instance = self
            .store
            .get_instance(id)?
            .ok_or_else(|| OrchestratorError::instance_not_found(id))?;
        self.check_instance(&instance).await
    }

    /// Check an already loaded instance and persist the outcome
    pub async fn check_instance(&self, instance: &Instance) -> Result<HealthCheckResult> {
        let result = self.evaluate(instance).await;
        debug!(
            "Health of {}: {} ({})",
            instance.name, result.health, result.message
        );

        let update = InstanceUpdate {
            health: Some(result.health),
            last_health_check_at: Some(result.checked_at),
            ..Default::default()
        };
        // The record may have been deleted meanwhile; that is not an error here
        self.store.update_instance(instance.id, &update)?;
        Ok(result)
    }

    async fn evaluate(&self, instance: &Instance) -> HealthCheckResult {
        let Some(container_ref) = instance.container_ref.as_deref() else {
            return HealthCheckResult::new(HealthStatus::Unknown, "no container yet");
        };

        let details = match self.client.inspect(container_ref).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => {
                return HealthCheckResult::new(HealthStatus::Unhealthy, "container not found")
            }
            Err(e) => {
                return HealthCheckResult::new(
                    HealthStatus::Unhealthy,
                    format!("container unavailable: {e}"),
                )
            }
        };

        if !details.state.is_running() {
            return HealthCheckResult::new(
                HealthStatus::Stopped,
                format!("container is {}", details.state),
            );
        }

        let Some(port) = instance.port else {
            return HealthCheckResult::new(HealthStatus::Unhealthy, "no published port");
        };

        let outcome = self.probe.probe(port, self.probe_timeout).await;
        let (health, message) = outcome.classify();
        HealthCheckResult {
            health,
            message,
            checked_at: Utc::now(),
        }
    }

    /// Run a follow-up check after the grace delay on a detached task
    pub fn spawn_delayed(self: &Arc<Self>, id: InstanceId) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(checker.grace).await;
            match checker.check(id).await {
                Ok(result) => debug!("Delayed health check for {}: {}", id, result.health),
                Err(e) if e.is_not_found() => debug!("Instance {} gone before delayed check", id),
                Err(e) => warn!("Delayed health check for {} failed: {}", id, e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::core::runtime::ContainerState;
    use crate::core::testing::Harness;

    /// Serve a single canned HTTP response per connection
    async fn serve(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn http_probe_classifies_responses() {
        let probe = HttpProbe::new().unwrap();
        let timeout = Duration::from_secs(2);

        let ok = serve("200 OK").await;
        assert_eq!(probe.probe(ok, timeout).await, ProbeOutcome::Status(200));
        assert_eq!(
            probe.probe(ok, timeout).await.classify().0,
            HealthStatus::Healthy
        );

        let broken = serve("500 Internal Server Error").await;
        let outcome = probe.probe(broken, timeout).await;
        assert_eq!(outcome, ProbeOutcome::Status(500));
        assert_eq!(outcome.classify().0, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn http_probe_refused_means_starting() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let outcome = HttpProbe::new()
            .unwrap()
            .probe(port, Duration::from_secs(2))
            .await;
        assert_eq!(outcome, ProbeOutcome::ConnectionRefused);
        assert_eq!(outcome.classify().0, HealthStatus::Starting);
    }

    #[tokio::test]
    async fn http_probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold connections without answering
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let outcome = HttpProbe::new()
            .unwrap()
            .probe(port, Duration::from_millis(200))
            .await;
        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert_eq!(outcome.classify().0, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn check_reflects_container_state_and_is_persisted() {
        let h = Harness::new();
        let instance = h.create_running("demo").await;
        let checker = h.orchestrator.health_checker();

        let result = checker.check(instance.id).await.unwrap();
        assert_eq!(result.health, HealthStatus::Healthy);

        h.runtime
            .set_state(instance.container_ref.as_deref().unwrap(), ContainerState::Exited);
        let result = checker.check(instance.id).await.unwrap();
        assert_eq!(result.health, HealthStatus::Stopped);

        let stored = h.store.get_instance(instance.id).unwrap().unwrap();
        assert_eq!(stored.health, HealthStatus::Stopped);
        assert_eq!(stored.last_health_check_at, Some(result.checked_at.trunc_subsecs(6)));
    }

    #[tokio::test]
    async fn missing_container_is_unhealthy() {
        let h = Harness::new();
        let instance = h.create_running("demo").await;
        h.runtime.forget_container(instance.container_ref.as_deref().unwrap());

        let result = h
            .orchestrator
            .health_checker()
            .check(instance.id)
            .await
            .unwrap();
        assert_eq!(result.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn probe_outcomes_drive_health() {
        let h = Harness::new();
        let instance = h.create_running("demo").await;
        let port = instance.port.unwrap();
        let checker = h.orchestrator.health_checker();

        h.probe.set(port, ProbeOutcome::ConnectionRefused);
        assert_eq!(
            checker.check(instance.id).await.unwrap().health,
            HealthStatus::Starting
        );

        h.probe.set(port, ProbeOutcome::TimedOut);
        assert_eq!(
            checker.check(instance.id).await.unwrap().health,
            HealthStatus::Unhealthy
        );
    }
}
