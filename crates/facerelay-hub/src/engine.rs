use facerelay_core::codec::{self, DecodeError};
use facerelay_core::engine::{EngineError, VisionEngine};
use facerelay_core::enroll::{self, EnrollError, EnrollRequest, EnrolledFace};
use facerelay_core::gallery::{GallerySnapshot, GalleryStore, PhotoStore};
use facerelay_core::matcher::{label_detections, EuclideanMatcher};
use facerelay_core::types::DetectionBox;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};

#[derive(Error, Debug)]
pub enum EngineThreadError {
    #[error("image decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("engine pool exited")]
    ChannelClosed,
}

/// Result of recognizing one still frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub boxes: Vec<DetectionBox>,
    pub frame_w: u32,
    pub frame_h: u32,
}

/// Messages sent from connection handlers to the engine pool.
enum EngineRequest {
    Recognize {
        image: String,
        gallery: Arc<GallerySnapshot>,
        threshold: f32,
        reply: oneshot::Sender<Result<Recognition, EngineThreadError>>,
    },
    Enroll {
        request: EnrollRequest,
        reply: oneshot::Sender<Result<EnrolledFace, EngineThreadError>>,
    },
}

/// Clone-safe handle to the engine pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    /// Caps concurrent enrollments so a pool of two or more always has a
    /// thread free for client frames.
    enroll_slots: Arc<Semaphore>,
}

impl EngineHandle {
    /// Detect and match the faces in an image sent as a data URL.
    pub async fn recognize(
        &self,
        image: String,
        gallery: Arc<GallerySnapshot>,
        threshold: f32,
    ) -> Result<Recognition, EngineThreadError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { image, gallery, threshold, reply: reply_tx })
            .await
            .map_err(|_| EngineThreadError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineThreadError::ChannelClosed)?
    }

    /// Run the enrollment pipeline and persist the resulting descriptor.
    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrolledFace, EngineThreadError> {
        let _slot = self
            .enroll_slots
            .acquire()
            .await
            .map_err(|_| EngineThreadError::ChannelClosed)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll { request, reply: reply_tx })
            .await
            .map_err(|_| EngineThreadError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineThreadError::ChannelClosed)?
    }
}

/// Outcome of loading one vision engine at startup.
pub type LoadedEngine = Result<Box<dyn VisionEngine>, EngineError>;

/// Spawn one dedicated OS thread per engine, all serving a shared queue.
///
/// A failed load still gets a thread, which answers each request with the
/// load error, so the hub keeps relaying worker results without models.
/// Enrollments may occupy at most `len - 1` threads (one for a single
/// engine pool).
pub fn spawn_engine(
    engines: Vec<LoadedEngine>,
    gallery: Arc<dyn GalleryStore>,
    photos: Arc<dyn PhotoStore>,
) -> std::io::Result<EngineHandle> {
    if engines.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "engine pool needs at least one engine",
        ));
    }
    let size = engines.len();
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);
    let rx = Arc::new(Mutex::new(rx));

    for (index, engine) in engines.into_iter().enumerate() {
        let engine = engine.map_err(|e| {
            tracing::error!(index, error = %e, "vision engine unavailable; recognition and enrollment disabled");
            e.to_string()
        });
        if let Ok(engine) = &engine {
            tracing::info!(index, kind = ?engine.kind(), "vision engine loaded");
        }

        let (rx, gallery, photos) = (rx.clone(), gallery.clone(), photos.clone());
        std::thread::Builder::new()
            .name(format!("facerelay-engine-{index}"))
            .spawn(move || serve_requests(index, engine, &rx, gallery.as_ref(), photos.as_ref()))?;
    }

    let enroll_slots = Arc::new(Semaphore::new(size.saturating_sub(1).max(1)));
    tracing::info!(threads = size, "engine pool started");
    Ok(EngineHandle { tx, enroll_slots })
}

/// Next queued request; `None` once every handle is dropped.
fn next_request(rx: &Mutex<mpsc::Receiver<EngineRequest>>) -> Option<EngineRequest> {
    rx.lock().ok()?.blocking_recv()
}

fn serve_requests(
    index: usize,
    mut engine: Result<Box<dyn VisionEngine>, String>,
    rx: &Mutex<mpsc::Receiver<EngineRequest>>,
    gallery: &dyn GalleryStore,
    photos: &dyn PhotoStore,
) {
    tracing::debug!(index, "engine thread started");
    while let Some(req) = next_request(rx) {
        match req {
            EngineRequest::Recognize { image, gallery: snapshot, threshold, reply } => {
                let result = match engine.as_mut() {
                    Ok(engine) => run_recognize(engine.as_mut(), &image, &snapshot, threshold),
                    Err(msg) => Err(EngineError::Unavailable(msg.clone()).into()),
                };
                let _ = reply.send(result);
            }
            EngineRequest::Enroll { request, reply } => {
                let result = match engine.as_mut() {
                    Ok(engine) => {
                        enroll::enroll(engine.as_mut(), gallery, photos, &request).map_err(EngineThreadError::from)
                    }
                    Err(msg) => Err(EngineError::Unavailable(msg.clone()).into()),
                };
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(index, "engine thread exiting");
}

fn run_recognize(
    engine: &mut dyn VisionEngine,
    image: &str,
    gallery: &GallerySnapshot,
    threshold: f32,
) -> Result<Recognition, EngineThreadError> {
    let frame = codec::decode_rgb(&codec::decode_data_url(image)?)?;
    let detections = engine.detect_and_encode(&frame)?;
    tracing::debug!(faces = detections.len(), "recognized client frame");
    Ok(Recognition {
        boxes: label_detections(&EuclideanMatcher, &detections, gallery, threshold),
        frame_w: frame.width(),
        frame_h: frame.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerelay_core::engine::{EngineKind, FaceDetection};
    use facerelay_core::gallery::MemoryStore;
    use facerelay_core::testing::{stub_frame, stub_png, StubEngine};
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Red value that makes [`GatedEngine`] stall until its gate opens.
    const HOLD: u8 = 77;

    struct GatedEngine {
        inner: StubEngine,
        open: Arc<AtomicBool>,
        held: Arc<AtomicUsize>,
    }

    impl VisionEngine for GatedEngine {
        fn kind(&self) -> EngineKind {
            self.inner.kind()
        }

        fn detect_and_encode(&mut self, frame: &RgbImage) -> Result<Vec<FaceDetection>, EngineError> {
            if frame.get_pixel(0, 0).0[0] == HOLD {
                self.held.fetch_add(1, Ordering::SeqCst);
                while !self.open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
            self.inner.detect_and_encode(frame)
        }
    }

    fn data_url(pixel: u8) -> String {
        codec::encode_jpeg_data_url(&stub_frame(32, 32, pixel)).unwrap()
    }

    fn spawn_stub(store: &MemoryStore) -> EngineHandle {
        let stub: LoadedEngine = Ok(Box::new(StubEngine::full()));
        spawn_engine(vec![stub], Arc::new(store.clone()), Arc::new(store.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_enroll_then_recognize() {
        let store = MemoryStore::new();
        let engine = spawn_stub(&store);

        let enrolled = engine
            .enroll(EnrollRequest { name: "Alice".into(), owner: None, samples: vec![stub_png(32, 32, 180)] })
            .await
            .unwrap();
        assert_eq!(enrolled.detected_count, 1);

        let gallery = Arc::new(store.get_all().unwrap());
        let result = engine.recognize(data_url(180), gallery, 0.6).await.unwrap();
        assert_eq!((result.frame_w, result.frame_h), (32, 32));
        assert_eq!(result.boxes.len(), 1);
        assert_eq!(result.boxes[0].label, "Alice");
    }

    #[tokio::test]
    async fn test_recognize_rejects_malformed_payload() {
        let engine = spawn_stub(&MemoryStore::new());
        let err = engine
            .recognize("data:image/png;base64,%%%".into(), Arc::new(GallerySnapshot::default()), 0.6)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineThreadError::Decode(_)));
    }

    #[tokio::test]
    async fn test_unavailable_engine_answers_with_error() {
        let store = MemoryStore::new();
        let engine = spawn_engine(
            vec![Err(EngineError::Unavailable("no models".into()))],
            Arc::new(store.clone()),
            Arc::new(store),
        )
        .unwrap();

        let err = engine
            .recognize(data_url(9), Arc::new(GallerySnapshot::default()), 0.6)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineThreadError::Engine(EngineError::Unavailable(_))));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let store = MemoryStore::new();
        assert!(spawn_engine(Vec::new(), Arc::new(store.clone()), Arc::new(store)).is_err());
    }

    #[tokio::test]
    async fn test_enrollments_leave_a_thread_for_client_frames() {
        let store = MemoryStore::new();
        let open = Arc::new(AtomicBool::new(false));
        let held = Arc::new(AtomicUsize::new(0));
        let gated = || -> LoadedEngine {
            Ok(Box::new(GatedEngine { inner: StubEngine::full(), open: open.clone(), held: held.clone() }))
        };
        let engine = spawn_engine(vec![gated(), gated()], Arc::new(store.clone()), Arc::new(store.clone())).unwrap();

        let enroll_held = |name: &str| {
            let engine = engine.clone();
            let request = EnrollRequest { name: name.into(), owner: None, samples: vec![stub_png(32, 32, HOLD)] };
            tokio::spawn(async move { engine.enroll(request).await })
        };
        let first = enroll_held("Alice");
        let second = enroll_held("Bob");

        tokio::time::timeout(Duration::from_secs(5), async {
            while held.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Give the second enrollment a chance to grab the other thread.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(held.load(Ordering::SeqCst), 1);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.recognize(data_url(180), Arc::new(GallerySnapshot::default()), 0.6),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.boxes.len(), 1);
        assert!(!first.is_finished() && !second.is_finished());

        open.store(true, Ordering::SeqCst);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(store.get_all().unwrap().len(), 2);
    }
}
