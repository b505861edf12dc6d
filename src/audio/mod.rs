//! Audio container helpers
//!
//! The session only frames bytes it is given; this module supplies the RIFF
//! header for live jobs and an optional WAV capture of everything sent.

mod wav;

pub use wav::{riff_wav_header, WavCapture, WAV_HEADER_BYTES};
