//! Realtime message protocol between the hub, viewers and camera workers.
//!
//! Every websocket text frame carries one JSON object of the form
//! `{"event": "<name>", "data": {...}}`.

use crate::enroll::EnrollmentResult;
use crate::types::RecognitionEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Camera id used for frames a viewer submits from its own camera.
pub const MAIN_CAMERA_ID: &str = "main";

/// Role a connection declares in its query string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    #[default]
    Viewer,
    Worker,
}

/// Messages sent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterCamera {
        camera_id: String,
        #[serde(default)]
        url: String,
    },
    SubmitFaceSamples {
        name: String,
        #[serde(default, alias = "images")]
        samples: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    ClientFrame {
        #[serde(alias = "dataURL")]
        image: String,
    },
    EnableMulticam {
        /// Explicit `camera_id -> url` map; every registered camera when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cameras: Option<BTreeMap<String, String>>,
    },
    DisableMulticam {
        /// Cameras to stop; every running worker when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cameras: Option<Vec<String>>,
    },
    NodeResult(RecognitionEvent),
    RemoveFace {
        name: String,
    },
    WorkerStatus {},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStart {
    pub camera_id: String,
    pub message: String,
}

/// Messages sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerInfo {
        status: String,
        version: String,
    },
    CameraRegistered {
        ok: bool,
        camera_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SubmitResult {
        ok: bool,
        detected_count: usize,
        message: String,
    },
    RecognitionUpdate(RecognitionEvent),
    MulticamStarted {
        /// Workers started by this request.
        started: Vec<String>,
        /// Workers that were already running.
        #[serde(default)]
        running: Vec<String>,
        #[serde(default)]
        failed: Vec<FailedStart>,
    },
    MulticamStopped {
        ok: bool,
        stopped: Vec<String>,
    },
    FaceRemoved {
        ok: bool,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    StatusReport {
        running: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl From<EnrollmentResult> for ServerMessage {
    fn from(result: EnrollmentResult) -> Self {
        ServerMessage::SubmitResult {
            ok: result.ok,
            detected_count: result.detected_count,
            message: result.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetectionBox;

    #[test]
    fn test_client_frame_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"client_frame","data":{"dataURL":"data:image/jpeg;base64,AA=="}}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ClientFrame { image: "data:image/jpeg;base64,AA==".into() }
        );
    }

    #[test]
    fn test_enable_multicam_without_cameras() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"event":"enable_multicam","data":{}}"#).unwrap();
        assert_eq!(msg, ClientMessage::EnableMulticam { cameras: None });
    }

    #[test]
    fn test_submit_samples_accepts_images_alias() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"event":"submit_face_samples","data":{"name":"Alice","images":["a","b"]}}"#,
        )
        .unwrap();
        let ClientMessage::SubmitFaceSamples { samples, owner, .. } = msg else {
            panic!("wrong variant");
        };
        assert_eq!(samples.len(), 2);
        assert_eq!(owner, None);
    }

    #[test]
    fn test_recognition_update_wire_shape() {
        let msg = ServerMessage::RecognitionUpdate(RecognitionEvent {
            camera_id: "cam1".into(),
            boxes: vec![DetectionBox { x: 1, y: 2, w: 3, h: 4, label: "Bob".into() }],
            frame_w: 640,
            frame_h: 480,
            frame: None,
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "recognition_update");
        assert_eq!(json["data"]["camera_id"], "cam1");
        assert_eq!(json["data"]["boxes"][0]["label"], "Bob");
        assert_eq!(json["data"]["frame_w"], 640);
        assert!(json["data"].get("frame").is_none());
    }

    #[test]
    fn test_worker_status_roundtrips_as_empty_object() {
        let json = serde_json::to_string(&ClientMessage::WorkerStatus {}).unwrap();
        assert_eq!(json, r#"{"event":"worker_status","data":{}}"#);
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"event":"reboot","data":{}}"#).is_err());
    }
}
