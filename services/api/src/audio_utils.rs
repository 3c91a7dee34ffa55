use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use vaani_core::audio::{INBOUND_SAMPLE_RATE, decode_pcm16, encode_pcm16};

// Rates as f64 for rubato.
pub const CLIENT_CAPTURE_SAMPLE_RATE: f64 = INBOUND_SAMPLE_RATE as f64;
pub const OPENAI_REALTIME_API_PCM16_SAMPLE_RATE: f64 = 24000.0;

/// Input chunk of the streaming resampler: 20 ms of client audio.
const RESAMPLER_CHUNK: usize = 320;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Resamples arbitrarily sized PCM16 frames, carrying the remainder of each
/// frame over to the next call.
pub struct StreamResampler {
    inner: FastFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_sampling_rate: f64, out_sampling_rate: f64) -> anyhow::Result<Self> {
        Ok(Self {
            inner: create_resampler(in_sampling_rate, out_sampling_rate, RESAMPLER_CHUNK)?,
            pending: Vec::new(),
        })
    }

    /// Feeds little-endian PCM16 bytes and returns whatever full chunks
    /// produced, as f32 samples.
    pub fn push_pcm16(&mut self, pcm: &[u8]) -> Vec<f32> {
        self.pending.extend(decode_pcm16(pcm));
        let mut out = Vec::new();
        loop {
            let needed = self.inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            match self.inner.process(&[chunk], None) {
                Ok(resampled) => out.extend_from_slice(&resampled[0]),
                Err(e) => {
                    tracing::error!(error = %e, "Resampling failed, dropping chunk");
                }
            }
        }
        out
    }
}

/// Encodes f32 samples as base64 PCM16, the realtime API's input format.
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(encode_pcm16(pcm32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn decode_base64(encoded: &str) -> Vec<f32> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        decode_pcm16(&bytes)
    }

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 24000.0, 1024).is_ok());
    }

    #[test]
    fn test_encode_f32_to_base64_i16() {
        // 0.5 is 16384, little endian.
        let expected = base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40u8]);
        assert_eq!(encode_f32_to_base64_i16(&[0.5]), expected);
        assert_eq!(encode_f32_to_base64_i16(&[]), "");
    }

    #[test]
    fn test_encode_within_quantization() {
        let original = vec![0.5f32, -0.25, 0.0];
        let decoded = decode_base64(&encode_f32_to_base64_i16(&original));
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 0.001);
        }
    }

    #[test]
    fn test_encode_clamps_extremes() {
        let extreme = vec![f32::MAX, f32::MIN, f32::INFINITY, f32::NEG_INFINITY];
        for value in decode_base64(&encode_f32_to_base64_i16(&extreme)) {
            assert!((-1.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_stream_resampler_buffers_partial_chunks() {
        let mut resampler = StreamResampler::new(
            CLIENT_CAPTURE_SAMPLE_RATE,
            OPENAI_REALTIME_API_PCM16_SAMPLE_RATE,
        )
        .unwrap();

        // 100 samples is less than one chunk: nothing comes out yet.
        let frame = vec![0u8; 200];
        assert!(resampler.push_pcm16(&frame).is_empty());

        // One second of audio in 10 ms frames yields roughly 1.5x the samples.
        let mut produced = 0;
        let frame = vec![0u8; 320];
        for _ in 0..100 {
            produced += resampler.push_pcm16(&frame).len();
        }
        let expected = 16_100.0 * 1.5;
        assert!((produced as f64) > expected * 0.9);
        assert!((produced as f64) <= expected * 1.05);
    }
}
