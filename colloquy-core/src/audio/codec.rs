//! Wire audio encoding: f32 mono ↔ PCM16-LE bytes ↔ base64.
//!
//! The remote service speaks base64-wrapped 16-bit linear PCM in both
//! directions. Conversion happens on pipeline threads, never in the RT
//! capture callback.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{ColloquyError, Result};

/// Convert f32 samples in [-1.0, 1.0] to little-endian PCM16 bytes.
///
/// Out-of-range input is clamped, not wrapped.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Convert little-endian PCM16 bytes to f32 samples in [-1.0, 1.0].
///
/// A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let v = i16::from_le_bytes([pair[0], pair[1]]);
        samples.push(v as f32 / 32768.0);
    }
    samples
}

/// Encode f32 samples as the wire's base64 PCM16 payload.
pub fn encode_chunk(samples: &[f32]) -> String {
    BASE64.encode(f32_to_pcm16(samples))
}

/// Decode a base64 PCM16 wire payload into f32 samples, applying `gain`.
///
/// `gain` is clamped to [0.0, 1.0]; 1.0 is unity.
pub fn decode_chunk(payload: &str, gain: f32) -> Result<Vec<f32>> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| ColloquyError::Protocol(format!("bad base64 audio payload: {e}")))?;
    let mut samples = pcm16_to_f32(&bytes);
    let gain = gain.clamp(0.0, 1.0);
    if gain != 1.0 {
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn round_trip_within_one_lsb() {
        let original: Vec<f32> = (0..480)
            .map(|i| ((i as f32) * 0.013).sin() * 0.8)
            .collect();
        let decoded = decode_chunk(&encode_chunk(&original), 1.0).unwrap();
        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1.0 / 32768.0);
        }
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let bytes = f32_to_pcm16(&[2.0, -2.0]);
        let decoded = pcm16_to_f32(&bytes);
        assert_abs_diff_eq!(decoded[0], 32767.0 / 32768.0, epsilon = 1e-6);
        assert_abs_diff_eq!(decoded[1], -32767.0 / 32768.0, epsilon = 1e-6);
    }

    #[test]
    fn silence_encodes_to_zero_bytes() {
        let bytes = f32_to_pcm16(&[0.0, 0.0, 0.0]);
        assert_eq!(bytes, vec![0u8; 6]);
    }

    #[test]
    fn gain_scales_decoded_samples() {
        let payload = encode_chunk(&[0.5; 8]);
        let attenuated = decode_chunk(&payload, 0.5).unwrap();
        for s in attenuated {
            assert_abs_diff_eq!(s, 0.25, epsilon = 1e-3);
        }
    }

    #[test]
    fn invalid_base64_is_a_protocol_error() {
        let err = decode_chunk("not base64!!!", 1.0).unwrap_err();
        assert!(matches!(err, ColloquyError::Protocol(_)));
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let samples = pcm16_to_f32(&[0x00, 0x40, 0x7f]);
        assert_eq!(samples.len(), 1);
    }
}
