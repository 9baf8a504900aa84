//! Network cameras that serve a JPEG snapshot per HTTP GET.

use crate::frame::Frame;
use crate::source::{CameraError, FrameSource};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpSnapshotSource {
    client: reqwest::blocking::Client,
    url: String,
    sequence: u32,
}

impl HttpSnapshotSource {
    /// Connect and fetch one frame, so an unreachable camera fails here
    /// rather than inside the capture loop.
    pub fn open(url: &str) -> Result<Self, CameraError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CameraError::Http(e.to_string()))?;

        let mut source = Self { client, url: url.to_string(), sequence: 0 };
        let probe = source.read_frame()?;
        tracing::info!(url, width = probe.width(), height = probe.height(), "opened snapshot camera");
        Ok(source)
    }
}

impl FrameSource for HttpSnapshotSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| CameraError::Http(e.to_string()))?;
        let body = response.bytes().map_err(|e| CameraError::Http(e.to_string()))?;

        let image = image::load_from_memory(&body)
            .map_err(|e| CameraError::CaptureFailed(format!("snapshot decode failed: {e}")))?
            .to_rgb8();

        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame::new(image, self.sequence))
    }

    fn describe(&self) -> String {
        format!("http:{}", self.url)
    }
}
