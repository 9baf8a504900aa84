//! Fan-out of recognition events to every connected viewer.
//!
//! Each event is serialized once and published on a broadcast channel. Every
//! viewer holds its own receiver with its own buffer, so a slow viewer lags
//! (and skips events) without holding up the others.

use facerelay_core::protocol::ServerMessage;
use facerelay_core::types::RecognitionEvent;
use facerelay_node::{EventSink, SinkClosed};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Relay {
    tx: broadcast::Sender<Arc<str>>,
}

impl Relay {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Viewers currently subscribed.
    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a `recognition_update` to every viewer. Returns how many
    /// viewers it was queued for.
    pub fn publish(&self, event: RecognitionEvent) -> usize {
        if self.viewer_count() == 0 {
            return 0;
        }
        let camera_id = event.camera_id.clone();
        let text = match serde_json::to_string(&ServerMessage::RecognitionUpdate(event)) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(camera_id = %camera_id, error = %e, "dropping unserializable event");
                return 0;
            }
        };
        // Err only means nobody is watching.
        let delivered = self.tx.send(Arc::from(text)).unwrap_or(0);
        tracing::trace!(camera_id = %camera_id, viewers = delivered, "recognition update published");
        delivered
    }
}

/// In-process workers publish straight to the relay.
impl EventSink for Relay {
    fn submit(&mut self, event: RecognitionEvent) -> Result<(), SinkClosed> {
        self.publish(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facerelay_core::types::DetectionBox;

    fn event(camera_id: &str) -> RecognitionEvent {
        RecognitionEvent {
            camera_id: camera_id.into(),
            boxes: vec![DetectionBox { x: 1, y: 2, w: 3, h: 4, label: "Bob".into() }],
            frame_w: 640,
            frame_h: 480,
            frame: None,
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_the_same_update() {
        let relay = Relay::new(8);
        let mut a = relay.subscribe();
        let mut b = relay.subscribe();

        assert_eq!(relay.publish(event("cam1")), 2);

        let (got_a, got_b) = (a.recv().await.unwrap(), b.recv().await.unwrap());
        assert_eq!(got_a, got_b);
        let msg: ServerMessage = serde_json::from_str(&got_a).unwrap();
        assert_eq!(msg, ServerMessage::RecognitionUpdate(event("cam1")));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking_others() {
        let relay = Relay::new(2);
        let mut slow = relay.subscribe();
        let mut fast = relay.subscribe();

        for i in 0..5 {
            relay.publish(event(&format!("cam{i}")));
            assert!(fast.recv().await.unwrap().contains(&format!("cam{i}")));
        }
        assert!(matches!(slow.recv().await, Err(broadcast::error::RecvError::Lagged(3))));
        assert!(slow.recv().await.unwrap().contains("cam3"));
    }

    #[test]
    fn test_publish_without_viewers() {
        let mut relay = Relay::new(4);
        assert_eq!(relay.publish(event("cam1")), 0);
        assert!(relay.submit(event("cam1")).is_ok());
    }

    #[tokio::test]
    async fn test_viewer_count_follows_subscriptions() {
        let relay = Relay::new(4);
        assert_eq!(relay.viewer_count(), 0);
        let first = relay.subscribe();
        let mut second = relay.subscribe();
        assert_eq!(relay.viewer_count(), 2);

        drop(first);
        assert_eq!(relay.viewer_count(), 1);
        assert_eq!(relay.publish(event("cam1")), 1);
        assert!(second.recv().await.unwrap().contains("cam1"));

        drop(second);
        assert_eq!(relay.publish(event("cam1")), 0);
    }
}
