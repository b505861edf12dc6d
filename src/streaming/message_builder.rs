//! Outbound message construction
//!
//! Builds the three message kinds a job sends, all stamped with the job's
//! request id and a fresh timestamp:
//!
//! - `speech.config` text message (once, first)
//! - `audio` binary message carrying a PCM chunk
//! - `audio` binary message with an empty body (terminator, once, last)

use super::frame_codec::{
    check_frame_size, encode_binary_frame, encode_header_block, encode_text_frame,
    OutboundFrame, LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES,
};
use super::protocol::{
    current_timestamp, MessagePath, RequestId, SpeechConfigPayload, AUDIO_CONTENT_TYPE,
    CONFIG_CONTENT_TYPE,
};
use super::SpeechError;
use crate::audio::riff_wav_header;

/// Frames messages for one request id
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    request_id: RequestId,
}

impl MessageBuilder {
    pub fn new(request_id: RequestId) -> Self {
        Self { request_id }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    fn frame(&self, path: MessagePath, content_type: &str, body: Vec<u8>) -> OutboundFrame {
        OutboundFrame {
            path,
            request_id: self.request_id.clone(),
            timestamp: current_timestamp(),
            content_type: content_type.to_string(),
            body,
        }
    }

    /// The `speech.config` text message
    pub fn config_message(&self) -> Result<String, SpeechError> {
        let payload = serde_json::to_vec(&SpeechConfigPayload::default())
            .map_err(|e| SpeechError::SendFailed(e.to_string()))?;
        encode_text_frame(&self.frame(MessagePath::SpeechConfig, CONFIG_CONTENT_TYPE, payload))
    }

    /// An audio message wrapping `pcm`
    ///
    /// The input is never split: a chunk that would push the frame past
    /// [`MAX_FRAME_BYTES`] is rejected.
    pub fn audio_chunk(&self, pcm: &[u8]) -> Result<Vec<u8>, SpeechError> {
        let bytes =
            encode_binary_frame(&self.frame(MessagePath::Audio, AUDIO_CONTENT_TYPE, pcm.to_vec()))?;
        check_frame_size(bytes.len(), MAX_FRAME_BYTES)?;
        Ok(bytes)
    }

    /// The empty-body audio message that ends the utterance
    pub fn terminator(&self) -> Result<Vec<u8>, SpeechError> {
        self.audio_chunk(&[])
    }

    /// First audio message of a live job: a RIFF header with zero samples
    pub fn wav_placeholder(
        &self,
        resolution: u16,
        channels: u16,
        rate: u32,
    ) -> Result<Vec<u8>, SpeechError> {
        self.audio_chunk(&riff_wav_header(0, resolution, channels, rate)?)
    }

    /// Byte length of an audio header block for this request id
    pub fn audio_header_len(&self) -> usize {
        encode_header_block(&self.frame(MessagePath::Audio, AUDIO_CONTENT_TYPE, Vec::new())).len()
    }

    /// Largest PCM payload that keeps an audio frame within `frame_limit`
    pub fn max_audio_payload(&self, frame_limit: usize) -> Result<usize, SpeechError> {
        let overhead = LENGTH_PREFIX_BYTES + self.audio_header_len();
        match frame_limit.min(MAX_FRAME_BYTES).checked_sub(overhead) {
            Some(payload) if payload > 0 => Ok(payload),
            _ => Err(SpeechError::FrameTooLarge {
                size: overhead,
                limit: frame_limit,
            }),
        }
    }
}
