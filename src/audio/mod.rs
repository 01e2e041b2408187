//! Audio capture module for MonkeyRead
//!
//! Microphone input (CPAL) → resampling to the session rate → fixed-size
//! frame accumulation → PCM16 encoding.
//! Encoded frames leave this module through a [`FrameDispatcher`]; nothing
//! here touches the network.

pub mod capture;
pub mod encoder;
pub mod recorder;
pub mod resampler;

pub use capture::{CapturePipeline, FrameConsumer, FrameDispatcher};
pub use encoder::{encode_frame, quantize, AudioFrame};
pub use recorder::{AudioError, AudioRecorder, RecordingHandle};
pub use resampler::StreamResampler;
