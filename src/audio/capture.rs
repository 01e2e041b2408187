//! Capture pipeline: callback-sized chunks in, fixed-size frames out
//!
//! The platform audio callback delivers small, irregular chunks (often 128
//! samples). [`CapturePipeline`] accumulates them into a preallocated
//! buffer of exactly `frame_size` samples and, each time it fills, encodes
//! the buffer and hands the resulting [`AudioFrame`] to a
//! [`FrameDispatcher`]. Partial frames are never emitted.
//!
//! ```text
//! audio callback ──push()──▶ accumulator ──full──▶ encode_frame ──▶ dispatch
//! ```
//!
//! Everything here runs on the real-time audio thread: no locks, no I/O,
//! and the accumulator never reallocates.

use super::encoder::{encode_frame, AudioFrame};

/// Anything the audio callback can feed samples into.
pub trait FrameConsumer: Send {
    fn push(&mut self, samples: &[f32]);
}

impl<C: FrameConsumer + ?Sized> FrameConsumer for Box<C> {
    fn push(&mut self, samples: &[f32]) {
        (**self).push(samples);
    }
}

/// Downstream receiver of encoded frames.
///
/// Implementations must not block. The transport's sender drops frames it
/// cannot accept right away.
pub trait FrameDispatcher: Send {
    fn dispatch(&mut self, frame: AudioFrame);
}

impl FrameDispatcher for Vec<AudioFrame> {
    fn dispatch(&mut self, frame: AudioFrame) {
        self.push(frame);
    }
}

pub struct CapturePipeline<D> {
    buffer: Vec<f32>,
    frame_size: usize,
    dispatcher: D,
    frames_emitted: u64,
}

impl<D: FrameDispatcher> CapturePipeline<D> {
    /// # Panics
    /// If `frame_size` is zero.
    pub fn new(frame_size: usize, dispatcher: D) -> Self {
        assert!(frame_size > 0, "frame_size must be non-zero");
        log::debug!("CapturePipeline: frame size {} samples", frame_size);

        Self {
            buffer: Vec::with_capacity(frame_size),
            frame_size,
            dispatcher,
            frames_emitted: 0,
        }
    }

    /// Feed one callback's worth of input.
    ///
    /// `None` means the host had no input channel for this invocation
    /// (e.g. microphone not yet authorized); nothing is buffered.
    pub fn push_channel(&mut self, input: Option<&[f32]>) {
        if let Some(samples) = input {
            self.push_samples(samples);
        }
    }

    fn push_samples(&mut self, mut samples: &[f32]) {
        while !samples.is_empty() {
            let space = self.frame_size - self.buffer.len();
            let take = space.min(samples.len());
            self.buffer.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.buffer.len() == self.frame_size {
                self.flush_frame();
            }
        }
    }

    fn flush_frame(&mut self) {
        let frame = encode_frame(&self.buffer);
        self.buffer.clear();
        self.frames_emitted += 1;

        if self.frames_emitted % 100 == 0 {
            log::debug!("CapturePipeline: {} frames emitted", self.frames_emitted);
        }

        self.dispatcher.dispatch(frame);
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Discard any partially filled frame
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl<D: FrameDispatcher> FrameConsumer for CapturePipeline<D> {
    fn push(&mut self, samples: &[f32]) {
        self.push_samples(samples);
    }
}
