//! Audio codec
//!
//! Pure conversions between normalized `f32` sample buffers and the 16-bit
//! little-endian PCM payloads the Live API speaks, plus the base64 text form
//! those payloads travel in.

use base64::engine::general_purpose;
use base64::Engine;
use serde::Serialize;

/// Capture rate expected by the service.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Rate of synthesized speech returned by the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

const SCALE: f32 = 32768.0;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A window of mono samples in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration of the frame in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Wire form of an audio frame: base64 text of S16LE bytes plus its MIME type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Quantize normalized samples to 16-bit signed PCM, clamping out-of-range input.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            if s.is_nan() {
                return 0;
            }
            (s * SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

pub fn dequantize(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&q| q as f32 / SCALE).collect()
}

pub fn pcm16_to_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|q| q.to_le_bytes()).collect()
}

pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Root-mean-square loudness of a frame; 0 for an empty frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Extract the `rate=` parameter from a PCM MIME descriptor.
pub fn mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .skip(1)
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

pub fn encode_frame(frame: &AudioFrame) -> EncodedChunk {
    let bytes = pcm16_to_bytes(&quantize(&frame.samples));
    EncodedChunk {
        data: general_purpose::STANDARD.encode(bytes),
        mime_type: pcm_mime(frame.sample_rate),
    }
}

/// Decode a wire chunk back into normalized samples.
pub fn decode_chunk(chunk: &EncodedChunk) -> Result<Vec<f32>, CodecError> {
    let bytes = general_purpose::STANDARD.decode(chunk.data.as_bytes())?;
    Ok(dequantize(&bytes_to_pcm16(&bytes)?))
}
