use anyhow::{Context, Result};
use clap::Parser;
use facerelay_core::engine::OnnxEngineFactory;
use facerelay_core::gallery::{GalleryStore, MemoryStore};
use facerelay_core::protocol::{ClientMessage, ConnectionRole};
use facerelay_core::types::RecognitionEvent;
use facerelay_hw::SystemOpener;
use facerelay_node::worker::{StopToken, Worker, WorkerError, WorkerSettings};
use facerelay_node::{HubClient, EXIT_SOURCE_LOST, EXIT_UNAVAILABLE, READY_LINE, UNAVAILABLE_PREFIX};
use facerelay_store::SqliteStore;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Out-of-process camera worker: captures one camera and submits results to the hub.
#[derive(Parser)]
#[command(name = "facerelay-node", version, about)]
struct Args {
    /// Camera identifier reported with every result
    #[arg(long)]
    camera_id: String,

    /// Camera source URL; the default local device when absent
    #[arg(long)]
    camera_url: Option<String>,

    /// Hub websocket address
    #[arg(long, default_value = "ws://127.0.0.1:5000/ws")]
    hub_url: String,

    /// Embed each JPEG frame in its result
    #[arg(long)]
    send_frame: bool,

    /// Match threshold
    #[arg(long, default_value_t = 0.5)]
    threshold: f32,

    /// ONNX model directory
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Gallery database
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Delay between frames, in milliseconds
    #[arg(long, default_value_t = 50)]
    frame_interval_ms: u64,

    /// Detection downscale factor (1.0 disables)
    #[arg(long, default_value_t = 0.5)]
    downscale: f32,

    /// Gallery refresh interval, in seconds
    #[arg(long, default_value_t = 30)]
    gallery_refresh_secs: u64,
}

/// Report the handshake line on stdout. Logs go to stderr.
fn handshake(line: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{line}");
    let _ = stdout.flush();
}

fn open_gallery(db_path: Option<PathBuf>) -> Arc<dyn GalleryStore> {
    let path = db_path.unwrap_or_else(|| facerelay_core::default_data_dir().join("gallery.db"));
    match SqliteStore::open(&path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "gallery unavailable; every face will be unknown");
            Arc::new(MemoryStore::new())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let camera_id = args.camera_id.clone();
    tracing::info!(camera_id = %camera_id, url = ?args.camera_url, "facerelay-node starting");

    let settings = WorkerSettings {
        threshold: args.threshold,
        frame_interval: Duration::from_millis(args.frame_interval_ms),
        downscale: args.downscale,
        send_frame: args.send_frame,
        gallery_refresh: Duration::from_secs(args.gallery_refresh_secs),
        ..WorkerSettings::new(camera_id.clone())
    };
    let engines = OnnxEngineFactory {
        model_dir: args.model_dir.clone().unwrap_or_else(facerelay_core::default_model_dir),
    };
    let gallery = open_gallery(args.db_path.clone());

    // Camera and models are opened on a blocking thread; V4L2 and ONNX
    // Runtime setup both block.
    let url = args.camera_url.clone();
    let opened = tokio::task::spawn_blocking(move || {
        Worker::open(settings, url.as_deref(), &SystemOpener::default(), &engines, gallery)
    })
    .await
    .context("worker setup panicked")?;

    let worker = match opened {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(camera_id = %camera_id, error = %e, "cannot start worker");
            handshake(&format!("{UNAVAILABLE_PREFIX} {e}"));
            std::process::exit(EXIT_UNAVAILABLE);
        }
    };

    let client = match HubClient::connect(&args.hub_url, ConnectionRole::Worker, Some(&camera_id)).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(hub = %args.hub_url, error = %e, "cannot reach hub");
            handshake(&format!("{UNAVAILABLE_PREFIX} hub unreachable: {e}"));
            std::process::exit(EXIT_UNAVAILABLE);
        }
    };
    let (mut hub_tx, mut hub_rx) = client.split();

    let stop = StopToken::new();
    let (events_tx, mut events_rx) = mpsc::channel::<RecognitionEvent>(8);
    let loop_stop = stop.clone();
    let capture = tokio::task::spawn_blocking(move || {
        let mut sink = events_tx;
        worker.run(&mut sink, &loop_stop)
    });

    handshake(READY_LINE);

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                // Closed once the capture loop has exited.
                let Some(event) = event else { break };
                if let Err(e) = hub_tx.send(&ClientMessage::NodeResult(event)).await {
                    tracing::warn!(error = %e, "lost hub connection");
                    break;
                }
            }
            msg = hub_rx.recv() => match msg {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!("hub closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "hub connection failed");
                    break;
                }
            },
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    stop.stop();
    // Drain so a capture loop blocked on a full channel can observe the stop.
    events_rx.close();
    let exit = capture.await.context("capture loop panicked")?;

    match exit {
        Ok(()) | Err(WorkerError::SinkClosed) => {
            tracing::info!(camera_id = %camera_id, "facerelay-node exiting");
            Ok(())
        }
        Err(e @ WorkerError::SourceLost { .. }) => {
            tracing::error!(camera_id = %camera_id, error = %e, "camera lost");
            std::process::exit(EXIT_SOURCE_LOST);
        }
        Err(e) => Err(e.into()),
    }
}
