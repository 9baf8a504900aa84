//! Registry of running camera workers, keyed by camera id.
//!
//! Every change to the registry happens under one async mutex, held across
//! the whole start or stop. Two concurrent `start` calls for the same camera
//! therefore cannot both pass the "already running" check.

use crate::launcher::{LaunchError, Launcher, RunningWorker, StopOutcome};
use facerelay_node::WorkerSettings;
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("camera {camera_id} unavailable: {reason}")]
    CameraUnavailable { camera_id: String, reason: String },
    #[error("camera {camera_id} failed to start: {source}")]
    Launch {
        camera_id: String,
        #[source]
        source: LaunchError,
    },
    #[error("camera id must not be empty")]
    EmptyCameraId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A worker for that camera was already running; nothing was spawned.
    AlreadyRunning,
}

struct WorkerHandle {
    state: WorkerState,
    worker: RunningWorker,
    started_at: Instant,
}

/// Builds the settings for a camera's worker.
pub type SettingsFn = dyn Fn(&str) -> WorkerSettings + Send + Sync;

pub struct Supervisor {
    launcher: Launcher,
    settings: Box<SettingsFn>,
    grace: Duration,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

fn transition(camera_id: &str, state: WorkerState) {
    tracing::info!(camera_id, ?state, "worker state");
}

impl Supervisor {
    pub fn new(launcher: Launcher, settings: Box<SettingsFn>, grace: Duration) -> Self {
        Self { launcher, settings, grace, workers: Mutex::new(HashMap::new()) }
    }

    /// Start a worker for `camera_id` unless one is already running.
    ///
    /// On failure the registry holds no entry for `camera_id`.
    pub async fn start(&self, camera_id: &str, url: Option<&str>) -> Result<StartOutcome, SupervisorError> {
        let camera_id = camera_id.trim();
        if camera_id.is_empty() {
            return Err(SupervisorError::EmptyCameraId);
        }

        let mut workers = self.workers.lock().await;
        if let Some(handle) = workers.get_mut(camera_id) {
            if handle.worker.is_alive() {
                tracing::debug!(camera_id, "worker already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            workers.remove(camera_id);
            transition(camera_id, WorkerState::Stopped);
        }

        transition(camera_id, WorkerState::Starting);
        let url = url.map(str::trim).filter(|u| !u.is_empty());
        let launched = self
            .launcher
            .launch((self.settings)(camera_id), url.map(str::to_string))
            .await;

        match launched {
            Ok(worker) => {
                workers.insert(
                    camera_id.to_string(),
                    WorkerHandle { state: WorkerState::Running, worker, started_at: Instant::now() },
                );
                transition(camera_id, WorkerState::Running);
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                transition(camera_id, WorkerState::Stopped);
                tracing::warn!(camera_id, error = %e, "worker failed to start");
                Err(match e {
                    LaunchError::CameraUnavailable(reason) => {
                        SupervisorError::CameraUnavailable { camera_id: camera_id.to_string(), reason }
                    }
                    source => SupervisorError::Launch { camera_id: camera_id.to_string(), source },
                })
            }
        }
    }

    /// Stop the worker for `camera_id`. Unknown or already stopped ids are a
    /// no-op. The handle is removed whatever the outcome.
    pub async fn stop(&self, camera_id: &str) -> StopOutcome {
        let mut workers = self.workers.lock().await;
        let Some(handle) = workers.remove(camera_id) else {
            return StopOutcome::NotRunning;
        };
        Self::shut_down(camera_id, handle, self.grace).await
    }

    /// Stop every worker concurrently, returning the ids that were running.
    pub async fn stop_all(&self) -> Vec<String> {
        let mut workers = self.workers.lock().await;
        let drained: Vec<(String, WorkerHandle)> = workers.drain().collect();
        let stops = drained.into_iter().map(|(camera_id, handle)| async move {
            let outcome = Self::shut_down(&camera_id, handle, self.grace).await;
            (camera_id, outcome)
        });

        let mut stopped: Vec<String> = join_all(stops)
            .await
            .into_iter()
            .filter(|(_, outcome)| *outcome != StopOutcome::NotRunning)
            .map(|(camera_id, _)| camera_id)
            .collect();
        stopped.sort();
        stopped
    }

    async fn shut_down(camera_id: &str, mut handle: WorkerHandle, grace: Duration) -> StopOutcome {
        if !handle.worker.is_alive() {
            transition(camera_id, WorkerState::Stopped);
            return StopOutcome::NotRunning;
        }
        handle.state = WorkerState::Stopping;
        transition(camera_id, handle.state);

        let uptime = handle.started_at.elapsed();
        let outcome = handle.worker.stop(grace).await;
        if outcome == StopOutcome::Forced {
            tracing::warn!(camera_id, ?grace, "worker ignored stop request; forced");
        }
        tracing::info!(camera_id, ?outcome, uptime_secs = uptime.as_secs(), "worker stopped");
        transition(camera_id, WorkerState::Stopped);
        outcome
    }

    /// Ids of running workers. Workers that exited on their own are pruned.
    pub async fn status(&self) -> BTreeSet<String> {
        let mut workers = self.workers.lock().await;
        workers.retain(|camera_id, handle| {
            let alive = handle.worker.is_alive();
            if !alive {
                tracing::info!(camera_id = %camera_id, "worker exited on its own");
                transition(camera_id, WorkerState::Stopped);
            }
            alive
        });
        workers.keys().cloned().collect()
    }

    /// Current state of one worker, `Stopped` when unknown.
    pub async fn state(&self, camera_id: &str) -> WorkerState {
        self.workers
            .lock()
            .await
            .get(camera_id)
            .map_or(WorkerState::Stopped, |handle| handle.state)
    }
}
