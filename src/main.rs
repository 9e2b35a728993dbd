//! instanced - keeps managed container instances in step with the runtime
//!
//! Opens the instance database, connects to the local Docker daemon and runs
//! the periodic monitor sweep until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use instance_orchestrator::core::{
    ClientConfig, HttpProbe, InstanceOrchestrator, Monitor, PortAllocator, RuntimeClient, Settings,
};
use instance_orchestrator::engine::DockerEngine;
use instance_orchestrator::persistence::{Database, InstanceStore};

/// Application name constant
pub const APP_NAME: &str = "instanced";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    let database = Arc::new(Database::new().context("Failed to open instance database")?);
    let settings = match database.load_settings()? {
        Some(settings) => settings,
        None => {
            let mut settings = Settings::default();
            settings.validate();
            database.save_settings(&settings)?;
            info!("Saved default settings");
            settings
        }
    };

    let engine = DockerEngine::connect_local().context("Failed to configure Docker client")?;
    let client = Arc::new(RuntimeClient::new(
        Arc::new(engine),
        ClientConfig::from_settings(&settings),
    ));
    client
        .connect()
        .await
        .context("Docker is not reachable; is the daemon running?")?;

    let probe = Arc::new(HttpProbe::new().context("Failed to build HTTP client")?);
    let orchestrator = Arc::new(InstanceOrchestrator::new(
        Arc::clone(&database) as Arc<dyn InstanceStore>,
        client,
        PortAllocator::new(),
        probe,
        settings,
    ));

    let monitor = Monitor::new(orchestrator, database);
    monitor
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("{} shutting down", APP_NAME);
    Ok(())
}

/// Initialize the logging system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("instance_orchestrator=info,instanced=info,bollard=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
