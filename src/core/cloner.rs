//! Volume data cloning between instances
//!
//! Both containers are stopped so nothing writes while the copy runs. Data
//! moves source volume -> staging volume -> target volume through disposable
//! helper containers; the copy is additive, so target files that the source
//! does not have survive.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::client::RuntimeClient;
use super::error::{OrchestratorError, Result};
use super::instance::{Instance, VolumeMount};
use super::runtime::HelperSpec;

const COPY_FROM: &str = "/from";
const COPY_TO: &str = "/to";

pub struct DataCloner {
    client: Arc<RuntimeClient>,
    helper_image: String,
}

impl DataCloner {
    pub fn new(client: Arc<RuntimeClient>, helper_image: impl Into<String>) -> Self {
        Self {
            client,
            helper_image: helper_image.into(),
        }
    }

    /// Copy the data volume of `source` into the data volume of `target`.
    ///
    /// On success the target is running and the source is back in the state
    /// it was in before. On failure, whichever containers were running
    /// beforehand are restarted on a best-effort basis and the error returned.
    pub async fn clone_data(&self, source: &Instance, target: &Instance) -> Result<()> {
        let source_ref = container_ref(source)?;
        let target_ref = container_ref(target)?;

        let source_was_running = self.client.inspect(source_ref).await?.state.is_running();
        let target_was_running = self.client.inspect(target_ref).await?.state.is_running();

        info!(
            "Cloning data {} -> {} (source running: {})",
            source.name, target.name, source_was_running
        );

        if let Err(e) = self.stop_and_copy(source, source_ref, target, target_ref).await {
            warn!("Data clone {} -> {} failed: {}", source.name, target.name, e);
            if source_was_running {
                self.restart_best_effort(&source.name, source_ref).await;
            }
            if target_was_running {
                self.restart_best_effort(&target.name, target_ref).await;
            }
            return Err(e);
        }

        let target_started = self.client.start_container(target_ref).await;
        if source_was_running {
            self.restart_best_effort(&source.name, source_ref).await;
        }
        target_started?;

        info!("Data cloned {} -> {}", source.name, target.name);
        Ok(())
    }

    async fn stop_and_copy(
        &self,
        source: &Instance,
        source_ref: &str,
        target: &Instance,
        target_ref: &str,
    ) -> Result<()> {
        self.client.stop_container(source_ref).await?;
        self.client.stop_container(target_ref).await?;
        self.client.ensure_image(&self.helper_image).await?;

        let staging = format!("clone-staging-{}", Uuid::new_v4().simple());
        self.client.ensure_volume(&staging).await?;

        let copied = async {
            self.copy_volume(&source.data_volume(), &staging).await?;
            self.copy_volume(&staging, &target.data_volume()).await
        }
        .await;

        if let Err(e) = self.client.remove_volume(&staging, true).await {
            warn!("Could not remove staging volume {}: {}", staging, e);
        }
        copied
    }

    /// Run one helper container that copies everything in `from` into `to`
    async fn copy_volume(&self, from: &str, to: &str) -> Result<()> {
        let helper = HelperSpec {
            name: format!("clone-helper-{}", Uuid::new_v4().simple()),
            image: self.helper_image.clone(),
            mounts: vec![
                VolumeMount::new(from, COPY_FROM).read_only(),
                VolumeMount::new(to, COPY_TO),
            ],
            command: vec![
                "cp".to_string(),
                "-a".to_string(),
                format!("{COPY_FROM}/."),
                format!("{COPY_TO}/"),
            ],
        };
        self.client.run_helper(&helper).await
    }

    async fn restart_best_effort(&self, name: &str, container_ref: &str) {
        if let Err(e) = self.client.start_container(container_ref).await {
            warn!("Could not restart {} after data clone: {}", name, e);
        }
    }
}

fn container_ref(instance: &Instance) -> Result<&str> {
    instance.container_ref.as_deref().ok_or_else(|| {
        OrchestratorError::NotFound(format!("container for instance {}", instance.name))
    })
}
