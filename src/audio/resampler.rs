//! Streaming sample-rate conversion for the capture path
//!
//! Devices that cannot run at the session rate (44.1 kHz and 48 kHz
//! built-in microphones are common) are converted with rubato's
//! `FftFixedIn`. The resampler only accepts whole input chunks, so input
//! left over from one callback is carried into the next. Output length
//! therefore tracks the input length exactly, however the host slices the
//! callbacks.

use rubato::{FftFixedIn, Resampler};

use super::recorder::AudioError;

/// Requested input chunk; rubato rounds it up to a whole number of
/// conversion periods
const CHUNK_SIZE: usize = 1024;

pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_rate: u32,
    out_rate: u32,
    chunk_in: usize,
    in_buf: Vec<f32>,
    out_buf: Vec<Vec<f32>>,
    consumed: u64,
    produced: u64,
}

impl StreamResampler {
    /// Mono converter from `in_rate` to `out_rate`. Equal rates pass through.
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self, AudioError> {
        if in_rate == 0 || out_rate == 0 {
            return Err(AudioError::Resampler(format!(
                "invalid rates {} -> {}",
                in_rate, out_rate
            )));
        }

        let resampler = if in_rate == out_rate {
            None
        } else {
            let resampler =
                FftFixedIn::<f32>::new(in_rate as usize, out_rate as usize, CHUNK_SIZE, 1, 1)
                    .map_err(|e| AudioError::Resampler(e.to_string()))?;
            Some(resampler)
        };

        let (chunk_in, out_len) = match &resampler {
            Some(r) => (r.input_frames_next(), r.output_frames_max()),
            None => (0, 0),
        };

        Ok(Self {
            resampler,
            in_rate,
            out_rate,
            chunk_in,
            in_buf: Vec::with_capacity(chunk_in),
            out_buf: vec![vec![0.0; out_len]; 1],
            consumed: 0,
            produced: 0,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Convert `src`, handing every block of output to `emit`.
    ///
    /// Never allocates: input and output buffers are sized up front.
    pub fn push(&mut self, mut src: &[f32], mut emit: impl FnMut(&[f32])) {
        self.consumed += src.len() as u64;

        if self.resampler.is_none() {
            self.produced += src.len() as u64;
            emit(src);
            return;
        }

        while !src.is_empty() {
            let take = (self.chunk_in - self.in_buf.len()).min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == self.chunk_in {
                self.process_chunk(usize::MAX, &mut emit);
            }
        }
    }

    /// Flush carried input, zero-padded, trimming the output so the total
    /// matches the input length at the output rate.
    pub fn finish(&mut self, mut emit: impl FnMut(&[f32])) {
        if self.resampler.is_none() || self.in_buf.is_empty() {
            return;
        }

        let expected = (self.consumed * self.out_rate as u64 + self.in_rate as u64 / 2)
            / self.in_rate as u64;
        let owed = expected.saturating_sub(self.produced) as usize;

        self.in_buf.resize(self.chunk_in, 0.0);
        self.process_chunk(owed, &mut emit);
    }

    fn process_chunk(&mut self, limit: usize, emit: &mut impl FnMut(&[f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };

        match resampler.process_into_buffer(&[&self.in_buf[..]], &mut self.out_buf, None) {
            Ok((_, out_len)) => {
                let n = out_len.min(limit);
                if n > 0 {
                    self.produced += n as u64;
                    emit(&self.out_buf[0][..n]);
                }
            }
            Err(e) => log::warn!("Resampler: dropped a chunk: {}", e),
        }
        self.in_buf.clear();
    }
}
