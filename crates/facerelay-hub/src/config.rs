use facerelay_node::WorkerSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How camera workers are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// One `facerelay-node` child process per camera.
    Process,
    /// One thread per camera inside the hub.
    Thread,
}

/// Hub configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: String,
    /// Websocket address handed to worker processes.
    pub public_url: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory for representative enrollment photos.
    pub photo_dir: PathBuf,
    /// Match threshold for frames viewers submit directly.
    pub interactive_threshold: f32,
    /// Match threshold used by camera workers.
    pub worker_threshold: f32,
    pub worker_mode: WorkerMode,
    /// Worker executable for [`WorkerMode::Process`].
    pub node_bin: PathBuf,
    /// Whether workers embed each frame in their results.
    pub send_frames: bool,
    /// Grace period between a graceful stop request and forced termination.
    pub stop_grace_secs: u64,
    /// How long a worker process may take to report readiness.
    pub startup_timeout_secs: u64,
    /// Pause between frames, at least 1 ms.
    pub frame_interval_ms: u64,
    pub downscale: f32,
    pub gallery_refresh_secs: u64,
    /// Per-viewer broadcast buffer, in messages.
    pub broadcast_capacity: usize,
    /// Engine threads serving client frames and enrollment, at least 1.
    pub engine_workers: usize,
}

impl Config {
    /// Load configuration from `FACERELAY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = facerelay_core::default_data_dir();
        let path = |key: &str, default: PathBuf| var(key).map(PathBuf::from).unwrap_or(default);
        let parsed = |key: &str| {
            var(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite())
        };

        let bind = var("FACERELAY_BIND").unwrap_or_else(|| "0.0.0.0:5000".to_string());
        let public_url = var("FACERELAY_PUBLIC_URL").unwrap_or_else(|| default_public_url(&bind));

        Self {
            public_url,
            model_dir: path("FACERELAY_MODEL_DIR", data_dir.join("models")),
            db_path: path("FACERELAY_DB_PATH", data_dir.join("gallery.db")),
            photo_dir: path("FACERELAY_PHOTO_DIR", data_dir.join("photos")),
            interactive_threshold: parsed("FACERELAY_INTERACTIVE_THRESHOLD").map_or(0.6, |v| v as f32),
            worker_threshold: parsed("FACERELAY_WORKER_THRESHOLD").map_or(0.5, |v| v as f32),
            worker_mode: match var("FACERELAY_WORKER_MODE").as_deref() {
                Some("thread") => WorkerMode::Thread,
                _ => WorkerMode::Process,
            },
            node_bin: path("FACERELAY_NODE_BIN", default_node_bin()),
            send_frames: var("FACERELAY_SEND_FRAMES").map(|v| v == "1").unwrap_or(false),
            stop_grace_secs: parsed("FACERELAY_STOP_GRACE_SECS").map_or(3, |v| v as u64),
            startup_timeout_secs: parsed("FACERELAY_STARTUP_TIMEOUT_SECS").map_or(10, |v| v as u64),
            frame_interval_ms: parsed("FACERELAY_FRAME_INTERVAL_MS").map_or(50, |v| (v as u64).max(1)),
            downscale: parsed("FACERELAY_DOWNSCALE").map_or(0.5, |v| v as f32),
            gallery_refresh_secs: parsed("FACERELAY_GALLERY_REFRESH_SECS").map_or(30, |v| v as u64),
            broadcast_capacity: parsed("FACERELAY_BROADCAST_CAPACITY").map_or(64, |v| (v as usize).max(1)),
            engine_workers: parsed("FACERELAY_ENGINE_WORKERS").map_or(2, |v| (v as usize).max(1)),
            bind,
        }
    }

    /// Worker settings for `camera_id` under this configuration.
    pub fn worker_settings(&self, camera_id: &str) -> WorkerSettings {
        WorkerSettings {
            threshold: self.worker_threshold,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            downscale: self.downscale,
            send_frame: self.send_frames,
            gallery_refresh: Duration::from_secs(self.gallery_refresh_secs),
            ..WorkerSettings::new(camera_id)
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

fn default_public_url(bind: &str) -> String {
    let port = bind.parse::<SocketAddr>().map(|a| a.port()).unwrap_or(5000);
    format!("ws://127.0.0.1:{port}/ws")
}

/// `facerelay-node` next to the running executable, else from `$PATH`.
fn default_node_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("facerelay-node")))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from("facerelay-node"))
}
