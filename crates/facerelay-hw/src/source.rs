//! Frame source abstraction and source URL resolution.

use crate::camera::Camera;
use crate::frame::Frame;
use crate::snapshot::HttpSnapshotSource;
use thiserror::Error;

/// Device used when a camera has no source URL.
pub const DEFAULT_DEVICE: &str = "/dev/video0";

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("unsupported camera source: {0}")]
    UnsupportedSource(String),
    #[error("http camera error: {0}")]
    Http(String),
}

/// Something frames can be read from, one at a time. Dropping the source
/// releases the underlying camera.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable identification for logs.
    fn describe(&self) -> String;
}

/// Opens frame sources from camera URLs.
pub trait SourceOpener: Send + Sync {
    fn open(&self, url: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError>;
}

impl<F> SourceOpener for F
where
    F: Fn(Option<&str>) -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync,
{
    fn open(&self, url: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError> {
        self(url)
    }
}

/// Where a camera URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Device(String),
    HttpSnapshot(String),
}

impl SourceKind {
    /// Resolve a camera URL. `None`, blank or `"0"` selects `default_device`;
    /// a bare index `N` selects `/dev/videoN`.
    pub fn parse(url: Option<&str>, default_device: &str) -> Result<Self, CameraError> {
        let url = url.map(str::trim).unwrap_or_default();
        if url.is_empty() || url == "0" {
            return Ok(Self::Device(default_device.to_string()));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Self::HttpSnapshot(url.to_string()));
        }
        if let Some(path) = url.strip_prefix("v4l2://").or_else(|| url.strip_prefix("file://")) {
            return Ok(Self::Device(path.to_string()));
        }
        if url.starts_with('/') {
            return Ok(Self::Device(url.to_string()));
        }
        if url.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::Device(format!("/dev/video{url}")));
        }
        Err(CameraError::UnsupportedSource(url.to_string()))
    }
}

/// Opens V4L2 devices and HTTP snapshot cameras.
#[derive(Debug, Clone)]
pub struct SystemOpener {
    pub default_device: String,
}

impl Default for SystemOpener {
    fn default() -> Self {
        Self { default_device: DEFAULT_DEVICE.to_string() }
    }
}

impl SourceOpener for SystemOpener {
    fn open(&self, url: Option<&str>) -> Result<Box<dyn FrameSource>, CameraError> {
        match SourceKind::parse(url, &self.default_device)? {
            SourceKind::Device(path) => Ok(Box::new(Camera::open(&path)?)),
            SourceKind::HttpSnapshot(url) => Ok(Box::new(HttpSnapshotSource::open(&url)?)),
        }
    }
}
