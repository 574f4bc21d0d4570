//! Raw PCM decoding for synthesizer output.
//!
//! Kokoro's `pcm` response format is 24 kHz mono 16-bit signed little-endian.
//! Network chunks can end mid-sample, so decoding carries a leftover byte
//! from one chunk into the next.

use crate::types::Waveform;

/// Kokoro PCM sample rate.
pub const KOKORO_SAMPLE_RATE: u32 = 24_000;

/// Decode little-endian i16 samples, prefixing a byte carried over from the
/// previous chunk. Returns the samples and the new odd byte, if any.
pub fn bytes_to_i16(bytes: &[u8], leftover: Option<u8>) -> (Vec<i16>, Option<u8>) {
    let joined: Vec<u8>;
    let data = match leftover {
        Some(lo) => {
            joined = std::iter::once(lo).chain(bytes.iter().copied()).collect();
            &joined[..]
        }
        None => bytes,
    };

    let pairs = data.chunks_exact(2);
    let remainder = pairs.remainder().first().copied();
    let samples = pairs.map(|p| i16::from_le_bytes([p[0], p[1]])).collect();
    (samples, remainder)
}

/// Scale i16 samples to `f32` in `[-1, 1)`.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Incremental decoder that turns a byte stream into one mono waveform.
#[derive(Debug, Default)]
pub struct PcmAccumulator {
    samples: Vec<f32>,
    leftover: Option<u8>,
}

impl PcmAccumulator {
    pub fn push(&mut self, bytes: &[u8]) {
        let (samples, leftover) = bytes_to_i16(bytes, self.leftover.take());
        self.leftover = leftover;
        self.samples.extend(i16_to_f32(&samples));
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Finish decoding. A dangling odd byte is dropped.
    pub fn finish(self, sample_rate: u32) -> Waveform {
        Waveform::mono(self.samples, sample_rate)
    }
}
