//! Wire framing for the speech WebSocket protocol
//!
//! Pure encode/decode functions, no I/O.
//!
//! # Frame Layout
//!
//! ```text
//! binary (audio):  [u16 BE header length][header block][raw PCM bytes]
//! text (config):   [header block]\r\n[JSON body]
//!
//! header block:    path:<path>\r\n
//!                  x-requestid:<32 hex>\r\n
//!                  x-timestamp:<yyyy-MM-ddTHH:mm:ss.fffZ>\r\n
//!                  content-type:<mime>\r\n
//! ```
//!
//! Inbound text messages are decoded positionally: the first three non-blank
//! lines are `x-requestid`, `content-type[;charset=..]` and `path`, and the body
//! starts at the first later line that opens with `{`.

use super::protocol::{InboundResult, MessagePath, RecognitionContent, RequestId, SpeechMessagePath};
use super::SpeechError;

/// Largest single frame accepted by the service (length prefix + header + payload)
pub const MAX_FRAME_BYTES: usize = 8192;

/// Size of the big-endian header length field of binary frames
pub const LENGTH_PREFIX_BYTES: usize = 2;

const CRLF: &str = "\r\n";

/// A frame sent by this client. Built and consumed within one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub path: MessagePath,
    pub request_id: RequestId,
    pub timestamp: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Render the CRLF-terminated header lines of a frame
pub fn encode_header_block(frame: &OutboundFrame) -> String {
    format!(
        "path:{}{crlf}x-requestid:{}{crlf}x-timestamp:{}{crlf}content-type:{}{crlf}",
        frame.path.as_str(),
        frame.request_id,
        frame.timestamp,
        frame.content_type,
        crlf = CRLF
    )
}

/// Header length field as it must appear on the wire (big-endian)
///
/// `host_little_endian` selects how the value is laid out in memory before
/// normalisation, so both host orders can be exercised.
pub fn length_prefix_for(len: u16, host_little_endian: bool) -> [u8; LENGTH_PREFIX_BYTES] {
    if host_little_endian {
        let native = len.to_le_bytes();
        [native[1], native[0]]
    } else {
        len.to_be_bytes()
    }
}

/// Encode a header length for this host. Fails above `u16::MAX`.
pub fn encode_length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_BYTES], SpeechError> {
    let len = u16::try_from(len).map_err(|_| SpeechError::FrameTooLarge {
        size: len,
        limit: u16::MAX as usize,
    })?;
    Ok(length_prefix_for(len, cfg!(target_endian = "little")))
}

/// Encode a binary frame: length prefix, header block, then the raw body
///
/// The 8192 byte frame limit is not enforced here; see [`check_frame_size`].
pub fn encode_binary_frame(frame: &OutboundFrame) -> Result<Vec<u8>, SpeechError> {
    let header = encode_header_block(frame);
    let prefix = encode_length_prefix(header.len())?;

    let mut bytes = Vec::with_capacity(LENGTH_PREFIX_BYTES + header.len() + frame.body.len());
    bytes.extend_from_slice(&prefix);
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&frame.body);
    Ok(bytes)
}

/// Encode a text frame: header block, blank line, UTF-8 body
pub fn encode_text_frame(frame: &OutboundFrame) -> Result<String, SpeechError> {
    let body = std::str::from_utf8(&frame.body)
        .map_err(|e| SpeechError::SendFailed(format!("text frame body is not UTF-8: {}", e)))?;

    let mut text = encode_header_block(frame);
    text.push_str(CRLF);
    text.push_str(body);
    Ok(text)
}

/// Reject frames larger than `limit`
pub fn check_frame_size(size: usize, limit: usize) -> Result<(), SpeechError> {
    if size > limit {
        return Err(SpeechError::FrameTooLarge { size, limit });
    }
    Ok(())
}

/// Decode a binary frame produced by [`encode_binary_frame`]
///
/// Headers are matched by name here, unlike inbound messages.
pub fn decode_binary_frame(bytes: &[u8]) -> Result<OutboundFrame, SpeechError> {
    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Err(SpeechError::ReceiveFailed(
            "frame shorter than its length prefix".to_string(),
        ));
    }
    let header_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let header_end = LENGTH_PREFIX_BYTES + header_len;
    let header = bytes.get(LENGTH_PREFIX_BYTES..header_end).ok_or_else(|| {
        SpeechError::ReceiveFailed(format!(
            "header length {} exceeds frame of {} bytes",
            header_len,
            bytes.len()
        ))
    })?;
    let header = std::str::from_utf8(header)
        .map_err(|e| SpeechError::ReceiveFailed(format!("header is not UTF-8: {}", e)))?;

    frame_from_headers(header, bytes[header_end..].to_vec())
}

/// Decode a text frame produced by [`encode_text_frame`]
pub fn decode_text_frame(text: &str) -> Result<OutboundFrame, SpeechError> {
    let separator = format!("{}{}", CRLF, CRLF);
    let (header, body) = match text.find(&separator) {
        Some(at) => (&text[..at + CRLF.len()], &text[at + separator.len()..]),
        None => (text, ""),
    };
    frame_from_headers(header, body.as_bytes().to_vec())
}

fn frame_from_headers(header: &str, body: Vec<u8>) -> Result<OutboundFrame, SpeechError> {
    let mut path = None;
    let mut request_id = None;
    let mut timestamp = String::new();
    let mut content_type = String::new();

    for line in header.split(CRLF).filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "path" => path = MessagePath::from_header(value),
            "x-requestid" => request_id = RequestId::parse(value),
            "x-timestamp" => timestamp = value.trim().to_string(),
            "content-type" => content_type = value.trim().to_string(),
            _ => {}
        }
    }

    let path = path.ok_or_else(|| SpeechError::ReceiveFailed("missing path header".to_string()))?;
    let request_id = request_id.ok_or_else(|| {
        SpeechError::ReceiveFailed("missing or malformed x-requestid header".to_string())
    })?;

    Ok(OutboundFrame {
        path,
        request_id,
        timestamp,
        content_type,
        body,
    })
}

/// Decode an inbound text message into an [`InboundResult`]
///
/// Missing or out-of-order headers leave the matching fields unset. Only a
/// body that is present but not valid JSON is an error.
pub fn decode_text_message(text: &str) -> Result<InboundResult, SpeechError> {
    let mut result = InboundResult::default();
    let mut header_index = 0usize;
    let mut body: Option<String> = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match header_index {
            0 => result.request_id = header_value(line, "x-requestid", ':').map(str::to_string),
            1 => {
                let mut parts = line.split(';');
                let first = parts.next().unwrap_or_default().trim();
                if let Some(content_type) = header_value(first, "content-type", ':') {
                    result.content_type = Some(content_type.to_string());
                    result.charset = parts
                        .next()
                        .and_then(|p| header_value(p.trim(), "charset", '='))
                        .map(str::to_string);
                }
            }
            2 => {
                if let Some(path) = header_value(line, "path", ':') {
                    result.path = SpeechMessagePath::from_header(path);
                }
            }
            _ => match body.as_mut() {
                Some(body) => {
                    body.push_str(line);
                    body.push('\n');
                }
                None if line.starts_with('{') => body = Some(format!("{}\n", line)),
                None => {}
            },
        }
        header_index += 1;
    }

    if let Some(body) = body {
        let content: RecognitionContent =
            serde_json::from_str(&body).map_err(|e| SpeechError::ParseFailed(e.to_string()))?;
        result.body = Some(content);
    }

    Ok(result)
}

/// Value of `name<sep>value` if the line starts with `name` (case-insensitive)
fn header_value<'a>(line: &'a str, name: &str, separator: char) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    if !prefix.eq_ignore_ascii_case(name) {
        return None;
    }
    let value = line[name.len()..].trim_start().strip_prefix(separator)?;
    Some(value.trim())
}
