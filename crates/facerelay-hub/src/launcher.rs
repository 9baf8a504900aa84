//! Starting and stopping one camera worker, in-process or as a child process.

use crate::relay::Relay;
use facerelay_core::engine::EngineFactory;
use facerelay_core::gallery::GalleryStore;
use facerelay_hw::SourceOpener;
use facerelay_node::{StopToken, Worker, WorkerError, WorkerSettings, READY_LINE, UNAVAILABLE_PREFIX};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error("vision engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker did not report readiness within {0:?}")]
    StartupTimeout(Duration),
    #[error("worker exited during startup: {0}")]
    EarlyExit(String),
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running under that id.
    NotRunning,
    /// The worker exited within the grace period.
    Stopped,
    /// The grace period ran out; the worker was killed (process) or
    /// abandoned with its stop flag set (thread).
    Forced,
}

/// In-process workers: one OS thread per camera, publishing to the relay.
pub struct ThreadLauncher {
    pub opener: Arc<dyn SourceOpener>,
    pub engines: Arc<dyn EngineFactory>,
    pub gallery: Arc<dyn GalleryStore>,
    pub relay: Relay,
}

/// Worker processes: one `facerelay-node` child per camera.
pub struct ProcessLauncher {
    pub node_bin: PathBuf,
    pub hub_url: String,
    pub model_dir: PathBuf,
    pub db_path: PathBuf,
    pub startup_timeout: Duration,
}

pub enum Launcher {
    Thread(ThreadLauncher),
    Process(ProcessLauncher),
}

/// A live worker as seen by its launcher.
pub enum RunningWorker {
    Thread {
        stop: StopToken,
        exited: oneshot::Receiver<()>,
    },
    Process {
        child: Child,
    },
}

impl Launcher {
    /// Start a worker and wait until its camera is open. Nothing keeps
    /// running when this fails.
    pub async fn launch(
        &self,
        settings: WorkerSettings,
        url: Option<String>,
    ) -> Result<RunningWorker, LaunchError> {
        match self {
            Launcher::Thread(launcher) => launcher.launch(settings, url).await,
            Launcher::Process(launcher) => launcher.launch(settings, url).await,
        }
    }
}

impl ThreadLauncher {
    async fn launch(&self, settings: WorkerSettings, url: Option<String>) -> Result<RunningWorker, LaunchError> {
        let opener = self.opener.clone();
        let engines = self.engines.clone();
        let gallery = self.gallery.clone();
        let worker = tokio::task::spawn_blocking(move || {
            Worker::open(settings, url.as_deref(), opener.as_ref(), engines.as_ref(), gallery)
        })
        .await
        .map_err(|e| LaunchError::EarlyExit(format!("worker setup panicked: {e}")))?
        .map_err(|e| match e {
            WorkerError::Engine(e) => LaunchError::EngineUnavailable(e.to_string()),
            other => LaunchError::CameraUnavailable(other.to_string()),
        })?;

        let stop = StopToken::new();
        let (exited_tx, exited) = oneshot::channel();
        let loop_stop = stop.clone();
        let mut sink = self.relay.clone();
        std::thread::Builder::new()
            .name(format!("facerelay-worker-{}", worker.camera_id()))
            .spawn(move || {
                // Dropped on every exit, including unwinding.
                let _exited = exited_tx;
                let _ = worker.run(&mut sink, &loop_stop);
            })?;

        Ok(RunningWorker::Thread { stop, exited })
    }
}

impl ProcessLauncher {
    fn command(&self, settings: &WorkerSettings, url: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.node_bin);
        cmd.arg("--camera-id")
            .arg(&settings.camera_id)
            .arg("--hub-url")
            .arg(&self.hub_url)
            .arg("--threshold")
            .arg(settings.threshold.to_string())
            .arg("--model-dir")
            .arg(&self.model_dir)
            .arg("--db-path")
            .arg(&self.db_path)
            .arg("--frame-interval-ms")
            .arg(settings.frame_interval.as_millis().to_string())
            .arg("--downscale")
            .arg(settings.downscale.to_string())
            .arg("--gallery-refresh-secs")
            .arg(settings.gallery_refresh.as_secs().to_string());
        if let Some(url) = url {
            cmd.arg("--camera-url").arg(url);
        }
        if settings.send_frame {
            cmd.arg("--send-frame");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    async fn launch(&self, settings: WorkerSettings, url: Option<String>) -> Result<RunningWorker, LaunchError> {
        let mut child = self.command(&settings, url.as_deref()).spawn()?;
        tracing::debug!(camera_id = %settings.camera_id, pid = ?child.id(), "worker process spawned");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LaunchError::EarlyExit("worker stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let first = match tokio::time::timeout(self.startup_timeout, lines.next_line()).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(LaunchError::Spawn(e));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(LaunchError::StartupTimeout(self.startup_timeout));
            }
        };

        match first.as_deref().map(str::trim) {
            Some(READY_LINE) => Ok(RunningWorker::Process { child }),
            Some(line) if line.starts_with(UNAVAILABLE_PREFIX) => {
                let _ = child.wait().await;
                let reason = line[UNAVAILABLE_PREFIX.len()..].trim();
                Err(LaunchError::CameraUnavailable(reason.to_string()))
            }
            Some(line) => {
                let _ = child.kill().await;
                Err(LaunchError::EarlyExit(format!("unexpected handshake: {line}")))
            }
            None => {
                let status = child.wait().await?;
                Err(LaunchError::EarlyExit(status.to_string()))
            }
        }
    }
}

impl RunningWorker {
    /// Whether the worker is still running.
    pub fn is_alive(&mut self) -> bool {
        match self {
            RunningWorker::Thread { exited, .. } => {
                matches!(exited.try_recv(), Err(oneshot::error::TryRecvError::Empty))
            }
            RunningWorker::Process { child } => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Ask the worker to stop; force it after `grace`.
    pub async fn stop(self, grace: Duration) -> StopOutcome {
        match self {
            RunningWorker::Thread { stop, mut exited } => {
                stop.stop();
                match tokio::time::timeout(grace, &mut exited).await {
                    Ok(_) => StopOutcome::Stopped,
                    // The thread exits at its next iteration boundary; its
                    // stop flag stays set.
                    Err(_) => StopOutcome::Forced,
                }
            }
            RunningWorker::Process { mut child } => {
                if let Some(pid) = child.id() {
                    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                        tracing::debug!(pid, error = %e, "SIGTERM failed");
                    }
                }
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => StopOutcome::Stopped,
                    Err(_) => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!(error = %e, "failed to kill worker process");
                        }
                        StopOutcome::Forced
                    }
                }
            }
        }
    }
}
