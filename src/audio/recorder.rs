//! Microphone source using CPAL
//!
//! Opens the default input device, downmixes to mono f32, converts to the
//! session sample rate when the device runs at another one, and feeds the
//! result into a [`FrameConsumer`]. The CPAL stream lives
//! on a dedicated audio thread (streams are `!Send` on some hosts), so the
//! returned [`RecordingHandle`] can move freely between tokio tasks.
//!
//! No echo cancellation, noise suppression or gain control is applied: the
//! raw amplitude goes straight to quantization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, Stream, StreamConfig};
use thiserror::Error;

use super::capture::FrameConsumer;
use super::resampler::StreamResampler;

/// Errors that can occur while opening the microphone.
#[derive(Debug, Clone, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("No supported audio configuration for {0} Hz mono capture")]
    NoSupportedConfig(u32),
    #[error("Failed to create audio stream: {0}")]
    StreamCreationFailed(String),
    #[error("Audio thread failed: {0}")]
    ThreadFailed(String),
    #[error("Resampler setup failed: {0}")]
    Resampler(String),
}

/// Handle to a running capture stream.
/// Dropping it stops capture and joins the audio thread.
pub struct RecordingHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    is_recording: Arc<AtomicBool>,
}

impl RecordingHandle {
    /// Stop capture. After this returns no further callback reaches the consumer.
    pub fn stop(mut self) -> Result<(), AudioError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), AudioError> {
        self.is_recording.store(false, Ordering::SeqCst);

        // Dropping the sender also wakes the thread
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }

        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| AudioError::ThreadFailed("audio thread panicked".to_string()))?;
            log::info!("Recorder: capture stopped");
        }
        Ok(())
    }
}

impl Drop for RecordingHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Recorder: {}", e);
        }
    }
}

/// Negotiated input configuration
#[derive(Debug, Clone)]
struct CaptureConfig {
    stream: StreamConfig,
    sample_format: SampleFormat,
}

/// Audio recorder bound to the default input device.
pub struct AudioRecorder {
    device: Device,
    config: CaptureConfig,
    target_rate: u32,
}

impl AudioRecorder {
    /// Open the default input device for mono capture at `target_rate`.
    pub fn new(target_rate: u32) -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Recorder: using input device {:?}", device.name());

        let config = negotiate_config(&device, target_rate)?;

        log::info!(
            "Recorder: {} Hz, {} channel(s), {:?}, session rate {} Hz",
            config.stream.sample_rate.0,
            config.stream.channels,
            config.sample_format,
            target_rate
        );

        Ok(Self {
            device,
            config,
            target_rate,
        })
    }

    /// Start capturing into `consumer`.
    ///
    /// Returns once the stream is playing, or with the error that prevented
    /// it. On error the consumer has received nothing.
    pub fn start<C>(&self, consumer: C) -> Result<RecordingHandle, AudioError>
    where
        C: FrameConsumer + 'static,
    {
        let device_rate = self.config.stream.sample_rate.0;
        let resampler = StreamResampler::new(device_rate, self.target_rate)?;
        if !resampler.is_passthrough() {
            log::info!("Recorder: resampling {} Hz -> {} Hz", device_rate, self.target_rate);
        }
        let sink = Arc::new(Mutex::new(MonoSink {
            channels: self.config.stream.channels.max(1) as usize,
            mono: Vec::with_capacity(4096),
            resampler,
            consumer,
        }));

        let device = self.device.clone();
        let config = self.config.clone();
        let is_recording = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let flag = is_recording.clone();
        let thread = std::thread::Builder::new()
            .name("monkeyread-audio".to_string())
            .spawn(move || {
                let stream = match build_stream(&device, &config, sink.clone(), flag) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }

                let _ = ready_tx.send(Ok(()));

                // Park until stop() or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);

                // No callback can run now; push out what the resampler holds
                lock_sink(&*sink).finish();
            })
            .map_err(|e| AudioError::ThreadFailed(e.to_string()))?;

        let started = ready_rx
            .recv()
            .map_err(|_| AudioError::ThreadFailed("audio thread exited early".to_string()))
            .and_then(|r| r);

        match started {
            Ok(()) => {
                log::info!("Recorder: capture started");
                Ok(RecordingHandle {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                    is_recording,
                })
            }
            Err(e) => {
                is_recording.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(e)
            }
        }
    }
}

/// Prefer a config running at exactly `target_rate`; otherwise use the
/// device default and resample.
fn negotiate_config(device: &Device, target_rate: u32) -> Result<CaptureConfig, AudioError> {
    if let Ok(ranges) = device.supported_input_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| {
                r.min_sample_rate().0 <= target_rate && r.max_sample_rate().0 >= target_rate
            })
            .collect();
        // Mono first, then f32 first
        candidates.sort_by_key(|r| {
            (
                r.channels() != 1,
                r.sample_format() != SampleFormat::F32,
            )
        });

        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(SampleRate(target_rate));
            return Ok(CaptureConfig {
                sample_format: supported.sample_format(),
                stream: supported.into(),
            });
        }
    }

    let default = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig(target_rate))?;

    Ok(CaptureConfig {
        sample_format: default.sample_format(),
        stream: default.into(),
    })
}

/// Everything the callback writes into: downmix buffer, resampler and the
/// downstream consumer. Shared with the audio thread so the resampler tail
/// can be flushed once the stream is gone.
struct MonoSink<C> {
    channels: usize,
    mono: Vec<f32>,
    resampler: StreamResampler,
    consumer: C,
}

impl<C: FrameConsumer> MonoSink<C> {
    /// Keep the first channel of each interleaved frame, convert and forward
    fn push_interleaved<T>(&mut self, data: &[T])
    where
        T: cpal::Sample,
        f32: FromSample<T>,
    {
        self.mono.clear();
        self.mono.extend(
            data.chunks(self.channels)
                .filter_map(|frame| frame.first())
                .map(|&s| f32::from_sample_(s)),
        );

        let consumer = &mut self.consumer;
        self.resampler.push(&self.mono, |out| consumer.push(out));
    }

    fn finish(&mut self) {
        let consumer = &mut self.consumer;
        self.resampler.finish(|out| consumer.push(out));
    }
}

fn lock_sink<C>(sink: &Mutex<MonoSink<C>>) -> MutexGuard<'_, MonoSink<C>> {
    // A panic inside the consumer poisons the lock; the buffers are still usable
    sink.lock().unwrap_or_else(|e| e.into_inner())
}

fn build_stream<C>(
    device: &Device,
    config: &CaptureConfig,
    sink: Arc<Mutex<MonoSink<C>>>,
    is_recording: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    C: FrameConsumer + 'static,
{
    match config.sample_format {
        SampleFormat::F32 => build_stream_typed::<f32, C>(device, config, sink, is_recording),
        SampleFormat::I16 => build_stream_typed::<i16, C>(device, config, sink, is_recording),
        SampleFormat::U16 => build_stream_typed::<u16, C>(device, config, sink, is_recording),
        _ => Err(AudioError::NoSupportedConfig(config.stream.sample_rate.0)),
    }
}

fn build_stream_typed<T, C>(
    device: &Device,
    config: &CaptureConfig,
    sink: Arc<Mutex<MonoSink<C>>>,
    is_recording: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
    C: FrameConsumer + 'static,
{
    let err_fn = |err| log::error!("Recorder: audio stream error: {}", err);

    device
        .build_input_stream(
            &config.stream,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !is_recording.load(Ordering::Relaxed) {
                    return;
                }
                lock_sink(&*sink).push_interleaved(data);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
