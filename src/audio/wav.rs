//! RIFF/WAVE helpers
//!
//! `riff_wav_header` synthesizes the 44-byte header sent at the start of a live
//! job. `WavCapture` records the PCM a session sends to a WAV file using hound,
//! so the captured audio can be checked against what went over the socket.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};

use crate::streaming::SpeechError;

/// Size of a canonical PCM WAV header
pub const WAV_HEADER_BYTES: usize = 44;

/// Build a canonical PCM WAV header
///
/// # Arguments
/// * `sample_count` - Samples per channel that will follow (0 when streaming)
/// * `resolution` - Bits per sample (8, 16, 24, 32)
/// * `channels` - Number of interleaved channels
/// * `rate` - Sample rate in Hz
///
/// # Returns
/// * `Err(SpeechError::AudioFormat)` - A derived field does not fit its header slot
pub fn riff_wav_header(
    sample_count: u32,
    resolution: u16,
    channels: u16,
    rate: u32,
) -> Result<[u8; WAV_HEADER_BYTES], SpeechError> {
    let overflow = |field: &str| {
        SpeechError::AudioFormat(format!(
            "{} overflows for {} Hz, {} channels, {} bit",
            field, rate, channels, resolution
        ))
    };

    let block_align = u16::try_from(u32::from(resolution / 8) * u32::from(channels))
        .map_err(|_| overflow("block align"))?;
    let byte_rate = rate
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| overflow("byte rate"))?;
    let data_len = sample_count
        .checked_mul(u32::from(block_align))
        .ok_or_else(|| overflow("data length"))?;
    let riff_len = data_len
        .checked_add(36)
        .ok_or_else(|| overflow("RIFF length"))?;

    let mut header = [0u8; WAV_HEADER_BYTES];
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&riff_len.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&resolution.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_len.to_le_bytes());
    Ok(header)
}

/// WAV file sink for raw little-endian PCM bytes
pub struct WavCapture {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    bytes_per_sample: usize,
    /// Trailing bytes of an incomplete sample, kept for the next write
    pending: Vec<u8>,
    bytes_written: u64,
}

impl WavCapture {
    /// Create a capture file. Only integer PCM of 8, 16, 24 or 32 bits is supported.
    pub fn create(
        path: impl AsRef<Path>,
        resolution: u16,
        channels: u16,
        rate: u32,
    ) -> Result<Self, SpeechError> {
        if !matches!(resolution, 8 | 16 | 24 | 32) {
            return Err(SpeechError::AudioFormat(format!(
                "unsupported capture resolution: {} bits",
                resolution
            )));
        }

        let path = path.as_ref().to_path_buf();
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: resolution,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec)
            .map_err(|e| SpeechError::Io(format!("create {:?}: {}", path, e)))?;

        log::info!(
            "Capturing sent audio to {:?} ({} Hz, {} ch, {} bit)",
            path,
            rate,
            channels,
            resolution
        );

        Ok(Self {
            writer,
            path,
            bytes_per_sample: usize::from(resolution / 8),
            pending: Vec::new(),
            bytes_written: 0,
        })
    }

    /// Append PCM bytes exactly as they were framed
    pub fn write_pcm(&mut self, bytes: &[u8]) -> Result<(), SpeechError> {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() - self.pending.len() % self.bytes_per_sample;

        for sample in self.pending[..whole].chunks_exact(self.bytes_per_sample) {
            let result = match sample {
                [b] => self.writer.write_sample((i16::from(*b) - 128) as i8),
                [lo, hi] => self.writer.write_sample(i16::from_le_bytes([*lo, *hi])),
                [a, b, c] => self
                    .writer
                    .write_sample(i32::from_le_bytes([0, *a, *b, *c]) >> 8),
                [a, b, c, d] => self.writer.write_sample(i32::from_le_bytes([*a, *b, *c, *d])),
                _ => Ok(()),
            };
            result.map_err(|e| SpeechError::Io(format!("write {:?}: {}", self.path, e)))?;
        }

        self.pending.drain(..whole);
        self.bytes_written += whole as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Finish the file. A trailing partial sample is dropped.
    pub fn finalize(self) -> Result<PathBuf, SpeechError> {
        if !self.pending.is_empty() {
            log::warn!(
                "Dropping {} trailing bytes of an incomplete sample",
                self.pending.len()
            );
        }
        self.writer
            .finalize()
            .map_err(|e| SpeechError::Io(format!("finalize {:?}: {}", self.path, e)))?;
        log::info!(
            "Capture finalized: {:?} ({} bytes)",
            self.path,
            self.bytes_written
        );
        Ok(self.path)
    }
}
