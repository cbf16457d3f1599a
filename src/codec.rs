//! Audio codec
//!
//! Converts between normalized `f32` sample buffers and the signed 16-bit
//! little-endian PCM carried on the wire. The scale is asymmetric: negative
//! samples are multiplied by 32768 and non-negative ones by 32767, while the
//! inverse always divides by 32768. Counterparts on the other end of the wire
//! rely on this exact mapping.

use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate of captured microphone audio sent to the session.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio returned by the session.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Encode normalized samples as PCM16 LE bytes, clamping to [-1, 1] first.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&to_i16(sample).to_le_bytes());
    }
    bytes
}

/// Decode PCM16 LE bytes into normalized samples. A trailing odd byte is ignored.
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode samples straight to the base64 text form used by JSON transports.
pub fn encode_base64(samples: &[f32]) -> String {
    general_purpose::STANDARD.encode(encode(samples))
}

/// Decode base64 PCM16 text into normalized samples.
pub fn decode_base64(data: &str) -> Result<Vec<f32>, base64::DecodeError> {
    Ok(decode(&general_purpose::STANDARD.decode(data)?))
}

/// MIME type tagging a PCM16 payload with its sample rate.
pub fn mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Root-mean-square level of a block, 0.0 for an empty block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Duration in seconds of `len` samples at `sample_rate`.
pub fn duration_secs(len: usize, sample_rate: u32) -> f64 {
    len as f64 / sample_rate as f64
}

fn to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}
