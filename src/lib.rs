//! Duplex WebSocket client for streaming speech recognition.
//!
//! A [`ConnectionSession`] owns one socket and carries one recognition job:
//! it sends a `speech.config` message, streams audio in length-prefixed binary
//! frames, and decodes the service's hypothesis and phrase messages while the
//! audio is still flowing.

pub mod audio;
pub mod auth;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use auth::{StaticToken, StsTokenClient, TokenProvider};
pub use settings::{load_settings, save_settings, ClientSettings};
pub use state_machine::{JobEvent, JobKind, JobState};
pub use streaming::{
    ConnectionSession, Endpoint, InboundResult, RecognitionContent, RecognitionMode, RequestId,
    SpeechError, SpeechMessagePath,
};
