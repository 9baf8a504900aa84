//! facerelay-hw: camera frame sources.
//!
//! V4L2 devices through the `v4l` crate and HTTP snapshot cameras through
//! `reqwest`, both delivering RGB frames.

pub mod camera;
pub mod frame;
pub mod snapshot;
pub mod source;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CameraError, FrameSource, SourceKind, SourceOpener, SystemOpener, DEFAULT_DEVICE};
