use anyhow::{Context, Result};
use facerelay_core::engine::{EngineFactory, OnnxEngineFactory};
use facerelay_core::gallery::{CameraStore, GalleryStore, MemoryStore, PhotoStore};
use facerelay_hub::{
    spawn_engine, serve, Config, Hub, Launcher, ProcessLauncher, Relay, Stores, Supervisor, ThreadLauncher,
    WorkerMode,
};
use facerelay_hw::SystemOpener;
use facerelay_store::{PhotoDir, SqliteStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

fn open_stores(config: &Config) -> Stores {
    let photos: Arc<dyn PhotoStore> = Arc::new(PhotoDir::new(&config.photo_dir));
    match SqliteStore::open(&config.db_path) {
        Ok(store) => {
            let store = Arc::new(store);
            Stores { gallery: store.clone(), cameras: store, photos }
        }
        Err(e) => {
            tracing::warn!(
                path = %config.db_path.display(),
                error = %e,
                "database unavailable; enrollments and cameras will not persist"
            );
            let store = MemoryStore::new();
            Stores {
                gallery: Arc::new(store.clone()) as Arc<dyn GalleryStore>,
                cameras: Arc::new(store) as Arc<dyn CameraStore>,
                photos,
            }
        }
    }
}

async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(bind = %config.bind, mode = ?config.worker_mode, "facerelayd starting");

    let stores = open_stores(&config);

    let engines = Arc::new(OnnxEngineFactory { model_dir: config.model_dir.clone() });
    let loader = engines.clone();
    let pool_size = config.engine_workers;
    let loaded = tokio::task::spawn_blocking(move || (0..pool_size).map(|_| loader.create()).collect::<Vec<_>>())
        .await
        .context("engine loader panicked")?;
    let engine = spawn_engine(loaded, stores.gallery.clone(), stores.photos.clone())
        .context("failed to spawn engine pool")?;

    let relay = Relay::new(config.broadcast_capacity);
    let launcher = match config.worker_mode {
        WorkerMode::Thread => Launcher::Thread(ThreadLauncher {
            opener: Arc::new(SystemOpener::default()),
            engines,
            gallery: stores.gallery.clone(),
            relay: relay.clone(),
        }),
        WorkerMode::Process => Launcher::Process(ProcessLauncher {
            node_bin: config.node_bin.clone(),
            hub_url: config.public_url.clone(),
            model_dir: config.model_dir.clone(),
            db_path: config.db_path.clone(),
            startup_timeout: config.startup_timeout(),
        }),
    };
    let settings = {
        let config = config.clone();
        move |camera_id: &str| config.worker_settings(camera_id)
    };
    let supervisor = Supervisor::new(launcher, Box::new(settings), config.stop_grace());

    let hub = Arc::new(Hub::new(engine, relay, supervisor, stores, config.interactive_threshold));
    hub.warm_up().await;

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "facerelayd ready");

    serve(listener, hub.clone(), shutdown_signal()).await?;

    let stopped = hub.supervisor().stop_all().await;
    tracing::info!(workers = stopped.len(), "facerelayd stopped");
    Ok(())
}
