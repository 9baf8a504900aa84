//! The per-camera capture loop.
//!
//! A [`Worker`] owns one frame source, one vision engine instance and a
//! cached gallery snapshot. [`Worker::run`] reads frames until it is stopped,
//! the source is lost, or its sink goes away; the source is released when
//! `run` returns.

use facerelay_core::codec;
use facerelay_core::engine::{EngineError, EngineFactory, VisionEngine};
use facerelay_core::gallery::{load_snapshot, GallerySnapshot, GalleryStore};
use facerelay_core::matcher::{label_detections, EuclideanMatcher};
use facerelay_core::types::RecognitionEvent;
use facerelay_hw::{CameraError, Frame, FrameSource, SourceOpener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("vision engine unavailable: {0}")]
    Engine(#[from] EngineError),
    #[error("camera lost after {failures} consecutive read failures: {last}")]
    SourceLost { failures: u32, last: CameraError },
    #[error("result sink closed")]
    SinkClosed,
}

/// Tunables for one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub camera_id: String,
    /// Match threshold for this worker's faces.
    pub threshold: f32,
    /// Delay between processed frames.
    pub frame_interval: Duration,
    /// Detection runs on a frame resized by this factor; 1.0 disables.
    pub downscale: f32,
    /// Attach a JPEG data URL of each frame to its event.
    pub send_frame: bool,
    pub gallery_refresh: Duration,
    /// Delay before retrying a failed frame read.
    pub retry_delay: Duration,
    pub max_consecutive_failures: u32,
}

impl WorkerSettings {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            threshold: 0.5,
            frame_interval: Duration::from_millis(50),
            downscale: 0.5,
            send_frame: false,
            gallery_refresh: Duration::from_secs(30),
            retry_delay: Duration::from_millis(50),
            max_consecutive_failures: 100,
        }
    }
}

/// Cooperative stop signal, checked at every loop iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("result sink closed")]
pub struct SinkClosed;

/// Destination for a worker's recognition events.
pub trait EventSink: Send {
    fn submit(&mut self, event: RecognitionEvent) -> Result<(), SinkClosed>;
}

impl EventSink for tokio::sync::mpsc::Sender<RecognitionEvent> {
    fn submit(&mut self, event: RecognitionEvent) -> Result<(), SinkClosed> {
        self.blocking_send(event).map_err(|_| SinkClosed)
    }
}

pub struct Worker {
    settings: WorkerSettings,
    source: Box<dyn FrameSource>,
    engine: Box<dyn VisionEngine>,
    gallery: Arc<dyn GalleryStore>,
    snapshot: GallerySnapshot,
    refreshed_at: Instant,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        source: Box<dyn FrameSource>,
        engine: Box<dyn VisionEngine>,
        gallery: Arc<dyn GalleryStore>,
    ) -> Self {
        let snapshot = load_snapshot(gallery.as_ref());
        Self { settings, source, engine, gallery, snapshot, refreshed_at: Instant::now() }
    }

    /// Open the camera source and create an engine. Fails fast, without
    /// entering the loop, when either is unavailable.
    pub fn open(
        settings: WorkerSettings,
        url: Option<&str>,
        opener: &dyn SourceOpener,
        engines: &dyn EngineFactory,
        gallery: Arc<dyn GalleryStore>,
    ) -> Result<Self, WorkerError> {
        let source = opener.open(url)?;
        let engine = engines.create()?;
        tracing::info!(
            camera_id = %settings.camera_id,
            source = %source.describe(),
            engine = ?engine.kind(),
            "worker opened camera"
        );
        Ok(Self::new(settings, source, engine, gallery))
    }

    pub fn camera_id(&self) -> &str {
        &self.settings.camera_id
    }

    /// Run the capture loop until `stop` is signalled. Consumes the worker so
    /// the frame source is dropped on every exit path.
    pub fn run(mut self, sink: &mut dyn EventSink, stop: &StopToken) -> Result<(), WorkerError> {
        let camera_id = self.settings.camera_id.clone();
        tracing::info!(camera_id = %camera_id, "worker loop started");

        let mut failures = 0u32;
        let mut processed = 0u64;

        let result = loop {
            if stop.is_stopped() {
                break Ok(());
            }

            let frame = match self.source.read_frame() {
                Ok(frame) => {
                    failures = 0;
                    frame
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.max_consecutive_failures {
                        break Err(WorkerError::SourceLost { failures, last: e });
                    }
                    tracing::debug!(camera_id = %camera_id, failures, error = %e, "frame read failed; retrying");
                    std::thread::sleep(self.settings.retry_delay);
                    continue;
                }
            };

            if stop.is_stopped() {
                break Ok(());
            }

            self.refresh_gallery();
            match self.process(&frame) {
                Ok(event) => {
                    if sink.submit(event).is_err() {
                        break Err(WorkerError::SinkClosed);
                    }
                    processed += 1;
                }
                Err(e) => {
                    tracing::warn!(camera_id = %camera_id, sequence = frame.sequence, error = %e, "frame skipped");
                }
            }

            std::thread::sleep(self.settings.frame_interval);
        };

        match &result {
            Ok(()) => tracing::info!(camera_id = %camera_id, processed, "worker stopped"),
            Err(e) => tracing::warn!(camera_id = %camera_id, processed, error = %e, "worker exited"),
        }
        result
    }

    fn refresh_gallery(&mut self) {
        if self.refreshed_at.elapsed() < self.settings.gallery_refresh {
            return;
        }
        self.snapshot = load_snapshot(self.gallery.as_ref());
        self.refreshed_at = Instant::now();
        tracing::debug!(camera_id = %self.settings.camera_id, entries = self.snapshot.len(), "gallery refreshed");
    }

    /// Detect, match and label one frame. Boxes are reported in the
    /// coordinates of the full-resolution frame.
    fn process(&mut self, frame: &Frame) -> Result<RecognitionEvent, EngineError> {
        let small = frame.downscaled(self.settings.downscale);
        let back = frame.width() as f32 / small.width().max(1) as f32;

        let mut detections = self.engine.detect_and_encode(&small)?;
        for det in &mut detections {
            det.bbox = det.bbox.scaled(back);
        }
        let boxes = label_detections(&EuclideanMatcher, &detections, &self.snapshot, self.settings.threshold);

        let frame_url = if self.settings.send_frame {
            codec::encode_jpeg_data_url(&frame.image)
                .map_err(|e| tracing::debug!(error = %e, "frame encoding failed"))
                .ok()
        } else {
            None
        };

        Ok(RecognitionEvent {
            camera_id: self.settings.camera_id.clone(),
            boxes,
            frame_w: frame.width(),
            frame_h: frame.height(),
            frame: frame_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerelay_core::gallery::MemoryStore;
    use facerelay_core::testing::{stub_frame, StubEngine};
    use facerelay_core::types::{DetectionBox, FaceDescriptor};
    use std::collections::VecDeque;

    /// Scripted frame source; reports failures once the script runs out.
    struct ScriptedSource {
        script: VecDeque<Result<u8, CameraError>>,
        released: Arc<AtomicBool>,
        sequence: u32,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<u8, CameraError>>) -> (Self, Arc<AtomicBool>) {
            let released = Arc::new(AtomicBool::new(false));
            let source = Self { script: script.into(), released: released.clone(), sequence: 0 };
            (source, released)
        }
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            let next = self
                .script
                .pop_front()
                .unwrap_or_else(|| Err(CameraError::CaptureFailed("script exhausted".into())));
            self.sequence += 1;
            next.map(|pixel| Frame::new(stub_frame(64, 48, pixel), self.sequence))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Collects events and signals stop after `limit` of them.
    struct Collect {
        events: Vec<RecognitionEvent>,
        limit: usize,
        stop: StopToken,
    }

    impl EventSink for Collect {
        fn submit(&mut self, event: RecognitionEvent) -> Result<(), SinkClosed> {
            self.events.push(event);
            if self.events.len() >= self.limit {
                self.stop.stop();
            }
            Ok(())
        }
    }

    struct Closed;

    impl EventSink for Closed {
        fn submit(&mut self, _event: RecognitionEvent) -> Result<(), SinkClosed> {
            Err(SinkClosed)
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            frame_interval: Duration::ZERO,
            retry_delay: Duration::from_millis(1),
            max_consecutive_failures: 3,
            ..WorkerSettings::new("cam1")
        }
    }

    fn gallery_with_alice() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert(&FaceDescriptor {
                name: "Alice".into(),
                embedding: StubEngine::descriptor_for(200),
                owner: None,
                photo_ref: None,
            })
            .unwrap();
        store
    }

    fn worker(script: Vec<Result<u8, CameraError>>, store: MemoryStore) -> (Worker, Arc<AtomicBool>) {
        let (source, released) = ScriptedSource::new(script);
        let worker = Worker::new(settings(), Box::new(source), Box::new(StubEngine::full()), Arc::new(store));
        (worker, released)
    }

    fn collector(limit: usize, stop: &StopToken) -> Collect {
        Collect { events: Vec::new(), limit, stop: stop.clone() }
    }

    #[test]
    fn test_labels_faces_in_full_frame_coordinates() {
        let (worker, released) = worker(vec![Ok(200), Ok(0)], gallery_with_alice());
        let stop = StopToken::new();
        let mut sink = collector(2, &stop);

        worker.run(&mut sink, &stop).unwrap();

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(sink.events.len(), 2);
        let first = &sink.events[0];
        assert_eq!(first.camera_id, "cam1");
        assert_eq!((first.frame_w, first.frame_h), (64, 48));
        assert_eq!(
            first.boxes,
            vec![DetectionBox { x: 16, y: 12, w: 32, h: 24, label: "Alice".into() }]
        );
        assert!(first.frame.is_none());
        // A frame without faces still produces an event, with no boxes.
        assert!(sink.events[1].boxes.is_empty());
    }

    #[test]
    fn test_far_descriptor_is_unknown() {
        let (worker, _) = worker(vec![Ok(10)], gallery_with_alice());
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        assert_eq!(sink.events[0].boxes[0].label, "unknown");
    }

    #[test]
    fn test_unavailable_gallery_matches_as_unknown() {
        let store = gallery_with_alice();
        store.set_available(false);
        let (worker, _) = worker(vec![Ok(200)], store);
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        assert_eq!(sink.events[0].boxes[0].label, "unknown");
    }

    #[test]
    fn test_transient_read_failures_are_retried() {
        let script = vec![
            Err(CameraError::CaptureFailed("glitch".into())),
            Err(CameraError::CaptureFailed("glitch".into())),
            Ok(200),
        ];
        let (worker, _) = worker(script, gallery_with_alice());
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        assert_eq!(sink.events.len(), 1);
    }

    #[test]
    fn test_persistent_read_failure_is_source_lost() {
        let (worker, released) = worker(Vec::new(), MemoryStore::new());
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        let err = worker.run(&mut sink, &stop).unwrap_err();
        assert!(matches!(err, WorkerError::SourceLost { failures: 3, .. }));
        assert!(released.load(Ordering::SeqCst));
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_stop_before_first_frame_reads_nothing() {
        let (worker, released) = worker(vec![Ok(200)], MemoryStore::new());
        let stop = StopToken::new();
        stop.stop();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        assert!(sink.events.is_empty());
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_closed_sink_ends_loop() {
        let (worker, released) = worker(vec![Ok(200), Ok(200)], MemoryStore::new());
        let err = worker.run(&mut Closed, &StopToken::new()).unwrap_err();
        assert!(matches!(err, WorkerError::SinkClosed));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_send_frame_attaches_jpeg() {
        let (source, _) = ScriptedSource::new(vec![Ok(200)]);
        let settings = WorkerSettings { send_frame: true, ..settings() };
        let worker =
            Worker::new(settings, Box::new(source), Box::new(StubEngine::full()), Arc::new(MemoryStore::new()));
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        let frame = sink.events[0].frame.as_deref().unwrap();
        assert!(frame.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn test_embedded_frame_keeps_color() {
        struct ColorSource;
        impl FrameSource for ColorSource {
            fn read_frame(&mut self) -> Result<Frame, CameraError> {
                // Red left half, blue right half; the red top-left pixel reads as a face.
                let img = image::RgbImage::from_fn(64, 48, |x, _| {
                    if x < 32 { image::Rgb([220, 20, 20]) } else { image::Rgb([20, 20, 220]) }
                });
                Ok(Frame::new(img, 1))
            }

            fn describe(&self) -> String {
                "color".into()
            }
        }

        let settings = WorkerSettings { send_frame: true, ..settings() };
        let worker =
            Worker::new(settings, Box::new(ColorSource), Box::new(StubEngine::full()), Arc::new(MemoryStore::new()));
        let stop = StopToken::new();
        let mut sink = collector(1, &stop);

        worker.run(&mut sink, &stop).unwrap();
        assert_eq!(sink.events[0].boxes.len(), 1);
        let bytes = codec::decode_data_url(sink.events[0].frame.as_deref().unwrap()).unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().color(), image::ColorType::Rgb8);

        let decoded = codec::decode_rgb(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
        let image::Rgb([r, _, b]) = *decoded.get_pixel(8, 24);
        assert!(r > 150 && b < 100, "left half lost its red: {r},{b}");
        let image::Rgb([r, _, b]) = *decoded.get_pixel(56, 24);
        assert!(b > 150 && r < 100, "right half lost its blue: {r},{b}");
    }

    #[test]
    fn test_open_fails_fast_on_unavailable_camera() {
        let opener = |_: Option<&str>| -> Result<Box<dyn FrameSource>, CameraError> {
            Err(CameraError::DeviceNotFound("/dev/video9".into()))
        };
        let engines = || -> Result<Box<dyn VisionEngine>, EngineError> { Ok(Box::new(StubEngine::full())) };

        let result = Worker::open(settings(), None, &opener, &engines, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(WorkerError::CameraUnavailable(CameraError::DeviceNotFound(_)))));
    }

    #[test]
    fn test_gallery_refresh_picks_up_enrollment() {
        let store = MemoryStore::new();
        let (source, _) = ScriptedSource::new(vec![Ok(200), Ok(200)]);
        let settings = WorkerSettings { gallery_refresh: Duration::ZERO, ..settings() };
        let worker = Worker::new(settings, Box::new(source), Box::new(StubEngine::full()), Arc::new(store.clone()));

        struct EnrollAfterFirst {
            inner: Collect,
            store: MemoryStore,
        }
        impl EventSink for EnrollAfterFirst {
            fn submit(&mut self, event: RecognitionEvent) -> Result<(), SinkClosed> {
                self.store
                    .upsert(&FaceDescriptor {
                        name: "Alice".into(),
                        embedding: StubEngine::descriptor_for(200),
                        owner: None,
                        photo_ref: None,
                    })
                    .map_err(|_| SinkClosed)?;
                self.inner.submit(event)
            }
        }

        let stop = StopToken::new();
        let mut sink = EnrollAfterFirst { inner: collector(2, &stop), store };
        worker.run(&mut sink, &stop).unwrap();

        assert_eq!(sink.inner.events[0].boxes[0].label, "unknown");
        assert_eq!(sink.inner.events[1].boxes[0].label, "Alice");
    }
}
