//! facerelay hub: the realtime relay, the shared engine pool and camera
//! worker supervision.

pub mod config;
pub mod engine;
pub mod hub;
pub mod launcher;
pub mod relay;
pub mod supervisor;

pub use config::{Config, WorkerMode};
pub use engine::{spawn_engine, EngineHandle, EngineThreadError, LoadedEngine};
pub use hub::{router, serve, Hub, Stores};
pub use launcher::{LaunchError, Launcher, ProcessLauncher, StopOutcome, ThreadLauncher};
pub use relay::Relay;
pub use supervisor::{StartOutcome, Supervisor, SupervisorError, WorkerState};
