//! Speech service protocol types
//!
//! This module defines the header values, request ids and JSON bodies carried
//! inside the frames exchanged with the speech recognition endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://{region}.stt.speech.microsoft.com/speech/recognition/interactive/cognitiveservices/v1`
//! 2. Send one `speech.config` text message describing the client
//! 3. Stream audio via binary `audio` messages (max 8192 bytes each)
//! 4. Send an `audio` message with an empty body to mark the end of the utterance
//! 5. Receive `speech.hypothesis` messages while audio flows, then a final `speech.phrase`

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host of the current speech service (prefixed with the region)
pub const SPEECH_SERVICE_HOST: &str = "stt.speech.microsoft.com";

/// Fixed host of the legacy Bing speech service (no region)
pub const LEGACY_SPEECH_HOST: &str = "speech.platform.bing.com";

/// Content type of the `speech.config` message
pub const CONFIG_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Content type of every `audio` message
pub const AUDIO_CONTENT_TYPE: &str = "audio/x-wav";

/// Recognition mode segment of the endpoint path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    #[default]
    Interactive,
    Conversation,
    Dictation,
}

impl RecognitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionMode::Interactive => "interactive",
            RecognitionMode::Conversation => "conversation",
            RecognitionMode::Dictation => "dictation",
        }
    }
}

/// Where a session connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Azure region, ignored by the legacy host
    pub region: String,
    /// Recognition language, e.g. `en-US`
    pub language: String,
    pub mode: RecognitionMode,
    /// Use the fixed-host Bing speech endpoint instead of the regional one
    pub legacy: bool,
}

impl Endpoint {
    pub fn new(region: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            language: language.into(),
            mode: RecognitionMode::default(),
            legacy: false,
        }
    }

    /// Full WebSocket URL for this endpoint
    pub fn url(&self) -> String {
        let host = if self.legacy {
            LEGACY_SPEECH_HOST.to_string()
        } else {
            format!("{}.{}", self.region, SPEECH_SERVICE_HOST)
        };
        format!(
            "wss://{}/speech/recognition/{}/cognitiveservices/v1?format=simple&language={}",
            host,
            self.mode.as_str(),
            self.language
        )
    }
}

/// Path header of a frame sent by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePath {
    SpeechConfig,
    Audio,
}

impl MessagePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePath::SpeechConfig => "speech.config",
            MessagePath::Audio => "audio",
        }
    }

    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "speech.config" => Some(MessagePath::SpeechConfig),
            "audio" => Some(MessagePath::Audio),
            _ => None,
        }
    }
}

/// Path header of a message received from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeechMessagePath {
    TurnStart,
    SpeechStartDetected,
    SpeechHypothesis,
    SpeechEndDetected,
    SpeechPhrase,
    #[default]
    Unknown,
}

impl SpeechMessagePath {
    /// Map a `path:` header value. Unrecognised paths become `Unknown`.
    pub fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "turn.start" => SpeechMessagePath::TurnStart,
            "speech.startdetected" => SpeechMessagePath::SpeechStartDetected,
            "speech.hypothesis" => SpeechMessagePath::SpeechHypothesis,
            "speech.enddetected" => SpeechMessagePath::SpeechEndDetected,
            "speech.phrase" => SpeechMessagePath::SpeechPhrase,
            // turn.end shares the end-detected variant; kept as observed on the wire
            "turn.end" => SpeechMessagePath::SpeechEndDetected,
            _ => SpeechMessagePath::Unknown,
        }
    }
}

/// Request id: a v4 UUID rendered as 32 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Accept an existing id if it is 32 hex characters (normalised to lowercase)
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Format an `x-timestamp` header value (UTC, millisecond precision, `Z` suffix)
pub fn frame_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `x-timestamp` value for the current instant
pub fn current_timestamp() -> String {
    frame_timestamp(Utc::now())
}

/// JSON body of hypothesis and phrase messages (simple output format)
///
/// Unknown fields such as `Offset` and `Duration` are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionContent {
    #[serde(default, alias = "text")]
    pub text: Option<String>,

    #[serde(default, alias = "displayText")]
    pub display_text: Option<String>,

    #[serde(default, alias = "recognitionStatus")]
    pub recognition_status: Option<String>,
}

/// A decoded inbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundResult {
    pub request_id: Option<String>,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub path: SpeechMessagePath,
    pub body: Option<RecognitionContent>,
}

impl InboundResult {
    /// Best text carried by this message: display text for phrases, text otherwise
    pub fn text(&self) -> Option<&str> {
        let body = self.body.as_ref()?;
        match self.path {
            SpeechMessagePath::SpeechPhrase => body.display_text.as_deref(),
            _ => body.text.as_deref(),
        }
    }
}

// ============================================================================
// speech.config payload
// ============================================================================

/// Body of the `speech.config` message
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeechConfigPayload {
    pub context: SpeechContext,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeechContext {
    pub system: SystemInfo,
    pub os: OsInfo,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            version: "1.0.00000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OsInfo {
    pub platform: String,
    pub name: String,
    pub version: String,
}

impl Default for OsInfo {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            name: "speech-socket".to_string(),
            version: "1.0.00000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub version: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            manufacturer: "speech-socket".to_string(),
            model: "SpeechClient".to_string(),
            version: "1.0.00000".to_string(),
        }
    }
}
