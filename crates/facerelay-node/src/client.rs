//! Websocket client for the hub's realtime protocol.

use facerelay_core::protocol::{ClientMessage, ConnectionRole, ServerMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed message from hub: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("hub closed the connection")]
    Closed,
    #[error("hub error: {0}")]
    Hub(String),
}

/// Append the role (and camera id for workers) to the hub's websocket URL.
pub fn endpoint(hub_url: &str, role: ConnectionRole, camera_id: Option<&str>) -> String {
    let sep = if hub_url.contains('?') { '&' } else { '?' };
    let role = match role {
        ConnectionRole::Viewer => "viewer",
        ConnectionRole::Worker => "worker",
    };
    match camera_id {
        Some(id) => format!("{hub_url}{sep}role={role}&camera_id={id}"),
        None => format!("{hub_url}{sep}role={role}"),
    }
}

/// One connection to the hub.
pub struct HubClient {
    sender: HubSender,
    receiver: HubReceiver,
}

pub struct HubSender {
    sink: SplitSink<WsStream, Message>,
}

pub struct HubReceiver {
    stream: SplitStream<WsStream>,
}

impl HubClient {
    pub async fn connect(
        hub_url: &str,
        role: ConnectionRole,
        camera_id: Option<&str>,
    ) -> Result<Self, ClientError> {
        let url = endpoint(hub_url, role, camera_id);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        tracing::debug!(url = %url, "connected to hub");
        let (sink, stream) = ws.split();
        Ok(Self { sender: HubSender { sink }, receiver: HubReceiver { stream } })
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        self.sender.send(msg).await
    }

    /// Next message from the hub, `None` once the connection is closed.
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        self.receiver.recv().await
    }

    /// Send `msg` and wait for the first reply `accept` takes. Broadcast
    /// traffic in between is skipped; an `error` reply fails the request.
    pub async fn request<F>(&mut self, msg: &ClientMessage, mut accept: F) -> Result<ServerMessage, ClientError>
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        self.send(msg).await?;
        loop {
            match self.recv().await?.ok_or(ClientError::Closed)? {
                ServerMessage::Error { message } => return Err(ClientError::Hub(message)),
                reply if accept(&reply) => return Ok(reply),
                _ => continue,
            }
        }
    }

    pub fn split(self) -> (HubSender, HubReceiver) {
        (self.sender, self.receiver)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.sender.sink.close().await?;
        Ok(())
    }
}

impl HubSender {
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = serde_json::to_string(msg)?;
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }
}

impl HubReceiver {
    pub async fn recv(&mut self) -> Result<Option<ServerMessage>, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite while reading.
                _ => continue,
            }
        }
        Ok(None)
    }
}
