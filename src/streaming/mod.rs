//! Streaming speech recognition over a duplex WebSocket
//!
//! One [`ConnectionSession`] carries one recognition job: a `speech.config`
//! text message, a series of length-prefixed binary audio frames, and a
//! terminator frame go out, while hypothesis and phrase messages come back on
//! the same socket.
//!
//! # Architecture
//!
//! ```text
//!  audio source ──▶ MessageBuilder ──▶ FrameCodec ──▶ FrameSink ──┐
//!                                                                 │ socket
//!  subscribers ◀── ResultDispatcher ◀── MessageParser ◀── FrameSource ◀┘
//! ```
//!
//! The sender and receiver run concurrently inside the job call and share the
//! job state behind a single mutex.

mod dispatcher;
mod frame_codec;
mod message_builder;
mod message_parser;
mod protocol;
mod session;
mod transport;

pub use dispatcher::ResultDispatcher;
pub use frame_codec::{
    decode_binary_frame, decode_text_frame, decode_text_message, encode_binary_frame,
    encode_header_block, encode_length_prefix, encode_text_frame, length_prefix_for,
    OutboundFrame, LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES,
};
pub use message_builder::MessageBuilder;
pub use message_parser::{parse_message, ParsedMessage};
pub use protocol::{
    current_timestamp, frame_timestamp, Endpoint, InboundResult, MessagePath, RecognitionContent,
    RecognitionMode, RequestId, SpeechConfigPayload, SpeechMessagePath, AUDIO_CONTENT_TYPE,
    CONFIG_CONTENT_TYPE,
};
pub use session::ConnectionSession;
pub use transport::{connect_websocket, Frame, FrameSink, FrameSource, WsSink, WsSource};

/// Errors that can occur during a recognition job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechError {
    /// WebSocket handshake did not complete
    ConnectFailed(String),
    /// Write to a closed or broken socket
    SendFailed(String),
    /// Read failure on the socket
    ReceiveFailed(String),
    /// Message body was not valid JSON
    ParseFailed(String),
    /// Frame would exceed the endpoint's size limit
    FrameTooLarge { size: usize, limit: usize },
    /// Local audio source could not be read
    Io(String),
    /// Audio format cannot be described by a PCM WAV header
    AudioFormat(String),
    /// Token issuing endpoint rejected or failed the request
    Auth(String),
}

impl std::fmt::Display for SpeechError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpeechError::ConnectFailed(e) => {
                write!(f, "Failed to connect to speech service: {}", e)
            }
            SpeechError::SendFailed(e) => write!(f, "Failed to send message: {}", e),
            SpeechError::ReceiveFailed(e) => write!(f, "Failed to receive message: {}", e),
            SpeechError::ParseFailed(e) => write!(f, "Failed to parse message body: {}", e),
            SpeechError::FrameTooLarge { size, limit } => {
                write!(f, "Frame of {} bytes exceeds the {} byte limit", size, limit)
            }
            SpeechError::Io(e) => write!(f, "Failed to read audio: {}", e),
            SpeechError::AudioFormat(e) => write!(f, "Unsupported audio format: {}", e),
            SpeechError::Auth(e) => write!(f, "Authentication failed: {}", e),
        }
    }
}

impl std::error::Error for SpeechError {}

impl From<std::io::Error> for SpeechError {
    fn from(e: std::io::Error) -> Self {
        SpeechError::Io(e.to_string())
    }
}
