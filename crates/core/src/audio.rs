//! Audio frames exchanged between the transport and the stage adapters.
//!
//! All frames are 16-bit little-endian mono PCM.

use crate::turn::Generation;
use bytes::Bytes;
use std::time::Duration;

/// Sample rate of audio coming from the client.
pub const INBOUND_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio sent back to the client.
pub const OUTBOUND_SAMPLE_RATE: u32 = 24_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pcm: Bytes,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(pcm: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            pcm: pcm.into(),
            sample_rate,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / self.sample_rate as f64)
    }

    /// Root-mean-square level of the frame, normalized to `0.0..=1.0`.
    pub fn energy(&self) -> f32 {
        rms(&decode_pcm16(&self.pcm))
    }
}

/// Synthesized audio tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedFrame {
    pub generation: Generation,
    pub frame: AudioFrame,
}

/// Interprets little-endian PCM16 bytes as normalized f32 samples.
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Converts normalized f32 samples back to little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_has_zero_energy() {
        let frame = AudioFrame::new(vec![0u8; 640], INBOUND_SAMPLE_RATE);
        assert_eq!(frame.energy(), 0.0);
        assert_eq!(frame.sample_count(), 320);
        assert_eq!(frame.duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_constant_signal_energy() {
        let pcm = encode_pcm16(&[0.5; 160]);
        let frame = AudioFrame::new(pcm, INBOUND_SAMPLE_RATE);
        assert!((frame.energy() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        let samples = decode_pcm16(&[0x00, 0x40, 0x01]);
        assert_eq!(samples.len(), 1);
        assert!((samples[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_sample_rate_duration() {
        let frame = AudioFrame::new(vec![0u8; 4], 0);
        assert_eq!(frame.duration(), Duration::ZERO);
    }
}
