//! The realtime hub: one websocket endpoint shared by viewers and workers.
//!
//! Each connection gets a reader loop that dispatches requests in arrival
//! order and a writer task that merges direct replies with, for viewers, the
//! broadcast relay.

use crate::engine::{EngineHandle, EngineThreadError};
use crate::launcher::StopOutcome;
use crate::relay::Relay;
use crate::supervisor::{StartOutcome, Supervisor};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use facerelay_core::codec;
use facerelay_core::enroll::{EnrollError, EnrollRequest, EnrollmentResult};
use facerelay_core::gallery::{self, CameraStore, GallerySnapshot, GalleryStore, PhotoStore, StoreError};
use facerelay_core::protocol::{ClientMessage, ConnectionRole, FailedStart, ServerMessage, MAIN_CAMERA_ID};
use facerelay_core::types::{CameraSource, RecognitionEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const OUTBOUND_QUEUE: usize = 32;

/// The storage collaborators the hub works with.
#[derive(Clone)]
pub struct Stores {
    pub gallery: Arc<dyn GalleryStore>,
    pub cameras: Arc<dyn CameraStore>,
    pub photos: Arc<dyn PhotoStore>,
}

/// The gallery snapshot used for viewer-submitted frames, reloaded after
/// every enrollment and removal.
#[derive(Default)]
pub struct GalleryCache {
    current: RwLock<Arc<GallerySnapshot>>,
}

impl GalleryCache {
    pub fn current(&self) -> Arc<GallerySnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn reload(&self, store: Arc<dyn GalleryStore>) {
        let snapshot = tokio::task::spawn_blocking(move || gallery::load_snapshot(store.as_ref()))
            .await
            .unwrap_or_default();
        tracing::debug!(entries = snapshot.len(), "gallery cache reloaded");
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::new(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(snapshot),
        }
    }
}

pub struct Hub {
    engine: EngineHandle,
    relay: Relay,
    supervisor: Supervisor,
    stores: Stores,
    cache: GalleryCache,
    interactive_threshold: f32,
}

/// Who is on the other end of a websocket.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub role: ConnectionRole,
    pub camera_id: Option<String>,
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

impl Hub {
    pub fn new(
        engine: EngineHandle,
        relay: Relay,
        supervisor: Supervisor,
        stores: Stores,
        interactive_threshold: f32,
    ) -> Self {
        Self { engine, relay, supervisor, stores, cache: GalleryCache::default(), interactive_threshold }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Load the gallery snapshot used for viewer frames.
    pub async fn warm_up(&self) {
        self.cache.reload(self.stores.gallery.clone()).await;
    }

    /// Handle one request. `None` means nothing goes back to the sender.
    pub async fn dispatch(&self, msg: ClientMessage, conn: &ConnectParams) -> Option<ServerMessage> {
        let reply = match msg {
            ClientMessage::RegisterCamera { camera_id, url } => self.register_camera(camera_id, url).await,
            ClientMessage::SubmitFaceSamples { name, samples, owner } => {
                self.submit_face_samples(name, samples, owner).await
            }
            ClientMessage::ClientFrame { image } => self.client_frame(image).await,
            ClientMessage::EnableMulticam { cameras } => {
                let targets = match cameras {
                    Some(map) => map.into_iter().map(|(camera_id, url)| CameraSource { camera_id, url }).collect(),
                    None => self.registered_cameras().await,
                };
                self.enable_multicam(targets).await
            }
            ClientMessage::DisableMulticam { cameras } => self.disable_multicam(cameras).await,
            ClientMessage::NodeResult(mut event) => {
                if event.camera_id.is_empty() {
                    event.camera_id = conn.camera_id.clone().unwrap_or_default();
                }
                self.relay.publish(event);
                return None;
            }
            ClientMessage::RemoveFace { name } => self.remove_face(name).await,
            ClientMessage::WorkerStatus {} => ServerMessage::StatusReport {
                running: self.supervisor.status().await.into_iter().collect(),
            },
        };
        Some(reply)
    }

    async fn register_camera(&self, camera_id: String, url: String) -> ServerMessage {
        let camera_id = camera_id.trim().to_string();
        if camera_id.is_empty() {
            return ServerMessage::CameraRegistered {
                ok: false,
                camera_id,
                message: Some("camera_id must not be empty".into()),
            };
        }

        let cameras = self.stores.cameras.clone();
        let source = CameraSource { camera_id: camera_id.clone(), url: url.trim().to_string() };
        match blocking(move || cameras.upsert_camera(&source)).await {
            Ok(()) => {
                tracing::info!(camera_id = %camera_id, "camera registered");
                ServerMessage::CameraRegistered { ok: true, camera_id, message: None }
            }
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "camera registration failed");
                ServerMessage::CameraRegistered { ok: false, camera_id, message: Some(e.to_string()) }
            }
        }
    }

    async fn submit_face_samples(&self, name: String, images: Vec<String>, owner: Option<String>) -> ServerMessage {
        let mut samples = Vec::with_capacity(images.len());
        for (idx, image) in images.iter().enumerate() {
            match codec::decode_data_url(image) {
                Ok(bytes) => samples.push(bytes),
                Err(e) => tracing::warn!(name = %name, sample = idx, error = %e, "dropping undecodable sample"),
            }
        }

        let outcome = self.engine.enroll(EnrollRequest { name, owner, samples }).await;
        let result = match outcome {
            Ok(enrolled) => {
                self.cache.reload(self.stores.gallery.clone()).await;
                EnrollmentResult::from(&Ok::<_, EnrollError>(enrolled))
            }
            Err(EngineThreadError::Enroll(e)) => EnrollmentResult::from(&Err(e)),
            Err(e) => EnrollmentResult { ok: false, detected_count: 0, message: e.to_string() },
        };
        result.into()
    }

    async fn client_frame(&self, image: String) -> ServerMessage {
        match self.engine.recognize(image, self.cache.current(), self.interactive_threshold).await {
            Ok(recognition) => ServerMessage::RecognitionUpdate(RecognitionEvent {
                camera_id: MAIN_CAMERA_ID.to_string(),
                boxes: recognition.boxes,
                frame_w: recognition.frame_w,
                frame_h: recognition.frame_h,
                frame: None,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "client frame dropped");
                ServerMessage::Error { message: format!("frame rejected: {e}") }
            }
        }
    }

    /// Every registered camera; empty when the registry is unreachable.
    async fn registered_cameras(&self) -> Vec<CameraSource> {
        let cameras = self.stores.cameras.clone();
        blocking(move || cameras.list_cameras()).await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "camera registry unavailable");
            Vec::new()
        })
    }

    async fn enable_multicam(&self, targets: Vec<CameraSource>) -> ServerMessage {
        let mut started = Vec::new();
        let mut running = Vec::new();
        let mut failed = Vec::new();

        for camera in targets {
            match self.supervisor.start(&camera.camera_id, camera.source_url()).await {
                Ok(StartOutcome::Started) => started.push(camera.camera_id),
                Ok(StartOutcome::AlreadyRunning) => running.push(camera.camera_id),
                Err(e) => failed.push(FailedStart { camera_id: camera.camera_id, message: e.to_string() }),
            }
        }
        tracing::info!(started = started.len(), running = running.len(), failed = failed.len(), "multicam enabled");
        ServerMessage::MulticamStarted { started, running, failed }
    }

    async fn disable_multicam(&self, cameras: Option<Vec<String>>) -> ServerMessage {
        let stopped = match cameras {
            None => self.supervisor.stop_all().await,
            Some(ids) => {
                let mut stopped = Vec::new();
                for camera_id in ids {
                    if self.supervisor.stop(&camera_id).await != StopOutcome::NotRunning {
                        stopped.push(camera_id);
                    }
                }
                stopped
            }
        };
        ServerMessage::MulticamStopped { ok: true, stopped }
    }

    async fn remove_face(&self, name: String) -> ServerMessage {
        let gallery = self.stores.gallery.clone();
        let photos = self.stores.photos.clone();
        let target = name.clone();
        let removed = blocking(move || gallery::remove_face(gallery.as_ref(), photos.as_ref(), &target)).await;

        match removed {
            Ok(true) => {
                self.cache.reload(self.stores.gallery.clone()).await;
                ServerMessage::FaceRemoved { ok: true, name, message: None }
            }
            Ok(false) => ServerMessage::FaceRemoved {
                ok: false,
                message: Some(format!("no enrolled face named {name}")),
                name,
            },
            Err(e) => ServerMessage::FaceRemoved { ok: false, name, message: Some(e.to_string()) },
        }
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

/// Serve the hub on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, hub: Arc<Hub>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(hub)).with_graceful_shutdown(shutdown).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, hub))
}

async fn handle_socket(socket: WebSocket, params: ConnectParams, hub: Arc<Hub>) {
    let conn_id = Uuid::new_v4();
    tracing::info!(%conn_id, role = ?params.role, camera_id = ?params.camera_id, "connection opened");

    let (ws_tx, mut ws_rx) = socket.split();
    // Subscribe before greeting, so a viewer that has seen server_info sees
    // every update published after it.
    let feed = (params.role == ConnectionRole::Viewer).then(|| hub.relay.subscribe());
    if feed.is_some() {
        tracing::debug!(%conn_id, viewers = hub.relay.viewer_count(), "viewer subscribed");
    }
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_loop(ws_tx, out_rx, feed, conn_id));

    let hello = ServerMessage::ServerInfo {
        status: "connected".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    let mut open = enqueue(&out_tx, &hello).await;

    while open {
        let text = match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "websocket read failed");
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => hub.dispatch(msg, &params).await,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "unparseable message");
                Some(ServerMessage::Error { message: format!("invalid message: {e}") })
            }
        };
        if let Some(reply) = reply {
            open = enqueue(&out_tx, &reply).await;
        }
    }

    drop(out_tx);
    let _ = writer.await;
    tracing::info!(%conn_id, "connection closed");
}

/// Queue a reply for the writer. `false` once the writer has gone away.
async fn enqueue(out: &mpsc::Sender<String>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(text) => out.send(text).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "dropping unserializable reply");
            true
        }
    }
}

async fn next_update(feed: &mut Option<broadcast::Receiver<Arc<str>>>) -> Result<Arc<str>, broadcast::error::RecvError> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut direct: mpsc::Receiver<String>,
    mut feed: Option<broadcast::Receiver<Arc<str>>>,
    conn_id: Uuid,
) {
    loop {
        let text = tokio::select! {
            msg = direct.recv() => match msg {
                Some(text) => text,
                None => break,
            },
            update = next_update(&mut feed) => match update {
                Ok(text) => text.to_string(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(%conn_id, skipped, "viewer lagging; updates skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    feed = None;
                    continue;
                }
            },
        };
        if ws_tx.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}
