//! Frame encoder: normalized f32 samples to PCM16 frames
//!
//! Pure and allocation-light so it can run inside the audio callback.
//! Samples are clamped to [-1.0, 1.0] before scaling, so out-of-range input
//! from float audio paths saturates instead of wrapping.

/// One fixed-size batch of PCM16 mono samples, ready for the wire.
///
/// Frames are only ever built from a completely filled accumulator, so
/// `len()` always equals the capture session's frame size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Serialize as little-endian PCM16, `len() * 2` bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
    }
}

/// Quantize a single sample.
///
/// Clamps to [-1.0, 1.0], scales by `i16::MAX` and truncates toward zero.
/// NaN maps to 0.
pub fn quantize(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Encode a full buffer of float samples into an [`AudioFrame`]
pub fn encode_frame(samples: &[f32]) -> AudioFrame {
    AudioFrame {
        samples: samples.iter().map(|&s| quantize(s)).collect(),
    }
}
