use anyhow::{Context, Result};
use facetag_pipeline::{spawn_engine, Pipeline};
use facetag_store::{FsObjectStore, IdentityRegistry, ObjectStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

use config::Config;
use dbus_interface::{PipelineService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facetagd starting");

    let config = Config::load().context("loading configuration")?;

    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.object_root));
    let registry = IdentityRegistry::open(&config.db_path, objects)
        .await
        .with_context(|| format!("opening registry at {}", config.db_path.display()))?;
    tracing::info!(
        db = %config.db_path.display(),
        objects = %config.object_root.display(),
        "registry opened"
    );

    // Fail fast if the models are missing rather than on the first photo.
    let engine = spawn_engine(&config.model_dir, config.engine_queue_depth)
        .with_context(|| format!("starting face engine from {}", config.model_dir.display()))?;

    let pipeline = Arc::new(Pipeline::new(registry, Arc::new(engine), config.pipeline.clone())?);
    tracing::info!(
        resolution = %config.pipeline.resolution,
        metric = %config.pipeline.distance_metric,
        threshold = config.pipeline.distance_threshold,
        cache = %config.pipeline.cache_dir.display(),
        "pipeline ready"
    );

    let service = PipelineService::new(pipeline, config.model_dir.clone());
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = if config.system_bus { "system" } else { "session" }, name = BUS_NAME, "facetagd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetagd shutting down");

    Ok(())
}
