//! facerelay-node: the Camera Worker.
//!
//! [`worker`] holds the capture loop shared by in-process workers and the
//! `facerelay-node` executable. [`client`] speaks the hub's websocket
//! protocol for worker processes and the CLI.

pub mod client;
pub mod worker;

pub use client::{ClientError, HubClient};
pub use worker::{EventSink, SinkClosed, StopToken, Worker, WorkerError, WorkerSettings};

/// Line a worker process prints on stdout once its camera is open.
pub const READY_LINE: &str = "READY";
/// Prefix of the line a worker process prints when its camera cannot be opened.
pub const UNAVAILABLE_PREFIX: &str = "UNAVAILABLE";
/// Exit status of a worker process whose camera could not be opened.
pub const EXIT_UNAVAILABLE: i32 = 2;
/// Exit status of a worker process whose camera stopped delivering frames.
pub const EXIT_SOURCE_LOST: i32 = 3;
