use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use facerelay_core::protocol::{ClientMessage, ConnectionRole, ServerMessage};
use facerelay_core::types::RecognitionEvent;
use facerelay_hw::Camera;
use facerelay_node::HubClient;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facerelay", version, about = "facerelay hub control CLI")]
struct Cli {
    /// Hub websocket address
    #[arg(long, global = true, default_value = "ws://127.0.0.1:5000/ws")]
    hub: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or re-point) a camera
    RegisterCamera {
        camera_id: String,
        /// Device path or HTTP snapshot URL; empty for the default device
        #[arg(default_value = "")]
        url: String,
    },
    /// Enroll a face from one or more image files
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Start camera workers; every registered camera when none are given
    Start {
        /// Cameras as `id=url`
        cameras: Vec<String>,
    },
    /// Stop camera workers; all of them when none are given
    Stop { cameras: Vec<String> },
    /// List running camera workers
    Status,
    /// Print recognition updates as they arrive
    Watch {
        /// Only show updates from this camera
        #[arg(long)]
        camera: Option<String>,
    },
    /// Recognize the faces in a still image
    Recognize { image: PathBuf },
    /// Remove an enrolled face
    Remove { name: String },
    /// List local V4L2 capture devices
    Devices,
}

/// Encode raw image bytes as a data URL.
fn data_url(bytes: &[u8]) -> String {
    let mime = image::guess_format(bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    format!("data:{mime};base64,{}", base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn read_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(data_url(&bytes))
}

/// Parse `id=url` pairs. A bare id means the default device.
fn parse_cameras(entries: &[String]) -> Result<BTreeMap<String, String>> {
    let mut cameras = BTreeMap::new();
    for entry in entries {
        let (id, url) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
        if id.trim().is_empty() {
            bail!("camera id missing in {entry:?}");
        }
        cameras.insert(id.trim().to_string(), url.trim().to_string());
    }
    Ok(cameras)
}

fn print_event(event: &RecognitionEvent) {
    let labels: Vec<&str> = event.boxes.iter().map(|b| b.label.as_str()).collect();
    println!("[{}] {}x{} faces={} {}", event.camera_id, event.frame_w, event.frame_h, labels.len(), labels.join(", "));
}

async fn connect(hub: &str) -> Result<HubClient> {
    let mut client = HubClient::connect(hub, ConnectionRole::Viewer, None)
        .await
        .with_context(|| format!("cannot reach hub at {hub}"))?;
    match client.recv().await? {
        Some(ServerMessage::ServerInfo { version, .. }) => tracing::debug!(%version, "connected to hub"),
        other => bail!("unexpected greeting from hub: {other:?}"),
    }
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices => {
            list_devices();
            Ok(())
        }
        command => run(&cli.hub, command).await,
    }
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for dev in devices {
        println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }
}

async fn run(hub: &str, command: Commands) -> Result<()> {
    let mut client = connect(hub).await?;

    match command {
        Commands::RegisterCamera { camera_id, url } => {
            let reply = client
                .request(&ClientMessage::RegisterCamera { camera_id, url }, |m| {
                    matches!(m, ServerMessage::CameraRegistered { .. })
                })
                .await?;
            if let ServerMessage::CameraRegistered { ok, camera_id, message } = reply {
                if !ok {
                    bail!("registering {camera_id} failed: {}", message.unwrap_or_default());
                }
                println!("Registered camera {camera_id}");
            }
        }
        Commands::Enroll { name, owner, images } => {
            let samples = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let reply = client
                .request(&ClientMessage::SubmitFaceSamples { name: name.clone(), samples, owner }, |m| {
                    matches!(m, ServerMessage::SubmitResult { .. })
                })
                .await?;
            if let ServerMessage::SubmitResult { ok, detected_count, message } = reply {
                if !ok {
                    bail!("enrollment failed: {message}");
                }
                println!("Enrolled {name} from {detected_count} sample(s)");
            }
        }
        Commands::Start { cameras } => {
            let cameras = if cameras.is_empty() { None } else { Some(parse_cameras(&cameras)?) };
            let reply = client
                .request(&ClientMessage::EnableMulticam { cameras }, |m| {
                    matches!(m, ServerMessage::MulticamStarted { .. })
                })
                .await?;
            if let ServerMessage::MulticamStarted { started, running, failed } = reply {
                for id in started {
                    println!("started  {id}");
                }
                for id in running {
                    println!("running  {id}");
                }
                for failure in &failed {
                    println!("failed   {}: {}", failure.camera_id, failure.message);
                }
            }
        }
        Commands::Stop { cameras } => {
            let cameras = if cameras.is_empty() { None } else { Some(cameras) };
            let reply = client
                .request(&ClientMessage::DisableMulticam { cameras }, |m| {
                    matches!(m, ServerMessage::MulticamStopped { .. })
                })
                .await?;
            if let ServerMessage::MulticamStopped { stopped, .. } = reply {
                if stopped.is_empty() {
                    println!("Nothing was running");
                }
                for id in stopped {
                    println!("stopped  {id}");
                }
            }
        }
        Commands::Status => {
            let reply = client
                .request(&ClientMessage::WorkerStatus {}, |m| matches!(m, ServerMessage::StatusReport { .. }))
                .await?;
            if let ServerMessage::StatusReport { running } = reply {
                if running.is_empty() {
                    println!("No camera workers running");
                }
                for id in running {
                    println!("{id}");
                }
            }
        }
        Commands::Watch { camera } => {
            let mut receiver = client.split().1;
            loop {
                tokio::select! {
                    msg = receiver.recv() => match msg? {
                        Some(ServerMessage::RecognitionUpdate(event)) => {
                            if camera.as_deref().map_or(true, |c| c == event.camera_id) {
                                print_event(&event);
                            }
                        }
                        Some(_) => {}
                        None => bail!("hub closed the connection"),
                    },
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
        Commands::Recognize { image } => {
            let image = read_image(&image)?;
            let reply = client
                .request(&ClientMessage::ClientFrame { image }, |m| {
                    matches!(m, ServerMessage::RecognitionUpdate(_))
                })
                .await?;
            if let ServerMessage::RecognitionUpdate(event) = reply {
                print_event(&event);
                println!("{}", serde_json::to_string_pretty(&event.boxes)?);
            }
        }
        Commands::Remove { name } => {
            let reply = client
                .request(&ClientMessage::RemoveFace { name }, |m| matches!(m, ServerMessage::FaceRemoved { .. }))
                .await?;
            if let ServerMessage::FaceRemoved { ok, name, message } = reply {
                if !ok {
                    bail!("removing {name} failed: {}", message.unwrap_or_default());
                }
                println!("Removed {name}");
            }
        }
        Commands::Devices => list_devices(),
    }

    client.close().await?;
    Ok(())
}
