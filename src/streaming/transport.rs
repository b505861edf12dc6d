//! Socket abstraction and the tokio-tungstenite adapter
//!
//! The session talks to the socket through two halves: a [`FrameSink`] owned
//! by the sender side and a [`FrameSource`] owned by the receive loop. Any
//! transport that can carry text and binary messages can back a session; the
//! WebSocket adapter below is the one used against the real service.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;

use super::SpeechError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A message read from the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Peer started or answered the close handshake
    Close(Option<String>),
}

/// Write half of a socket
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError>;
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError>;
    /// Start (or answer) the close handshake
    async fn close(&mut self) -> Result<(), SpeechError>;
}

/// Read half of a socket
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the socket is gone
    async fn receive(&mut self) -> Option<Result<Frame, SpeechError>>;
}

/// WebSocket write half
pub struct WsSink(SplitSink<WsStream, Message>);

/// WebSocket read half
pub struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| SpeechError::SendFailed(e.to_string()))
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError> {
        self.0
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| SpeechError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), SpeechError> {
        self.0
            .close()
            .await
            .map_err(|e| SpeechError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn receive(&mut self) -> Option<Result<Frame, SpeechError>> {
        while let Some(msg_result) = self.0.next().await {
            let frame = match msg_result {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(bytes)) => Frame::Binary(bytes),
                Ok(Message::Close(close)) => Frame::Close(
                    close.map(|c| format!("{} {}", u16::from(c.code), c.reason)),
                ),
                Ok(_) => continue, // ping/pong are answered by tungstenite
                Err(e) => return Some(Err(SpeechError::ReceiveFailed(e.to_string()))),
            };
            return Some(Ok(frame));
        }
        None
    }
}

/// Open a WebSocket to `url` with the speech service handshake headers
///
/// Sends `X-ConnectionId` (fresh 32-hex id) and `Authorization: Bearer <token>`.
///
/// # Returns
/// * `Ok((sink, source, connection_id))` - Connected socket halves
/// * `Err(SpeechError::ConnectFailed)` - Handshake did not complete
pub async fn connect_websocket(
    url: &str,
    token: &str,
) -> Result<(WsSink, WsSource, String), SpeechError> {
    let connection_id = Uuid::new_v4().simple().to_string();

    let mut request = url
        .into_client_request()
        .map_err(|e| SpeechError::ConnectFailed(e.to_string()))?;

    request.headers_mut().insert(
        "X-ConnectionId",
        HeaderValue::from_str(&connection_id)
            .map_err(|e| SpeechError::ConnectFailed(e.to_string()))?,
    );
    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| SpeechError::ConnectFailed(e.to_string()))?,
    );

    log::info!("Connecting to speech service (connection {})...", connection_id);

    let (ws_stream, _response) = timeout(
        CONNECTION_TIMEOUT,
        connect_async_with_config(request, None, false),
    )
    .await
    .map_err(|_| SpeechError::ConnectFailed("Connection timeout".to_string()))?
    .map_err(|e| SpeechError::ConnectFailed(e.to_string()))?;

    log::info!("WebSocket connected");

    let (write, read) = ws_stream.split();
    Ok((WsSink(write), WsSource(read), connection_id))
}
