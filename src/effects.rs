//! Effect runner for MonkeyRead
//!
//! Executes the effects produced by the recording state machine. Device
//! work happens on blocking threads; completion is reported back to the
//! state loop as events tagged with the recording id.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::audio::{
    AudioError, AudioRecorder, CapturePipeline, FrameConsumer, FrameDispatcher, RecordingHandle,
};
use crate::state_machine::{Effect, Event};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// A capture stream that is currently feeding a pipeline.
pub trait ActiveCapture: Send {
    fn stop(self: Box<Self>) -> Result<(), AudioError>;
}

impl ActiveCapture for RecordingHandle {
    fn stop(self: Box<Self>) -> Result<(), AudioError> {
        RecordingHandle::stop(*self)
    }
}

/// Where samples come from. Called on a blocking thread.
pub trait CaptureSource: Send + Sync + 'static {
    fn start(
        &self,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError>;
}

/// The default input device. The device is opened lazily and reopened
/// after a failure, so a microphone plugged in later is picked up.
pub struct MicrophoneSource {
    sample_rate: u32,
    recorder: StdMutex<Option<AudioRecorder>>,
}

impl MicrophoneSource {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            recorder: StdMutex::new(None),
        }
    }
}

impl CaptureSource for MicrophoneSource {
    fn start(
        &self,
        consumer: Box<dyn FrameConsumer>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        let mut guard = self
            .recorder
            .lock()
            .map_err(|_| AudioError::ThreadFailed("recorder lock poisoned".to_string()))?;

        if guard.is_none() {
            *guard = Some(AudioRecorder::new(self.sample_rate)?);
        }

        let result = match guard.as_ref() {
            Some(recorder) => recorder.start(consumer),
            None => Err(AudioError::NoInputDevice),
        };

        match result {
            Ok(handle) => Ok(Box::new(handle)),
            Err(e) => {
                // Forget the device; the next start renegotiates from scratch
                *guard = None;
                Err(e)
            }
        }
    }
}

#[derive(Default)]
struct Captures {
    running: HashMap<Uuid, Box<dyn ActiveCapture>>,
    /// Stop arrived before the start finished
    stop_requested: HashSet<Uuid>,
}

/// Runs audio effects: each recording gets a fresh [`CapturePipeline`]
/// feeding a clone of `dispatcher`.
pub struct AudioEffectRunner<D> {
    source: Arc<dyn CaptureSource>,
    dispatcher: D,
    frame_size: usize,
    captures: Arc<Mutex<Captures>>,
}

impl<D> AudioEffectRunner<D>
where
    D: FrameDispatcher + Clone + Sync + 'static,
{
    pub fn new(source: Arc<dyn CaptureSource>, dispatcher: D, frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            source,
            dispatcher,
            frame_size,
            captures: Arc::new(Mutex::new(Captures::default())),
        })
    }

    /// Number of capture streams currently running
    pub async fn active_count(&self) -> usize {
        self.captures.lock().await.running.len()
    }
}

impl<D> EffectRunner for AudioEffectRunner<D>
where
    D: FrameDispatcher + Clone + Sync + 'static,
{
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartAudio { id } => {
                let source = self.source.clone();
                let captures = self.captures.clone();
                let pipeline = CapturePipeline::new(self.frame_size, self.dispatcher.clone());

                tokio::spawn(async move {
                    let started = tokio::task::spawn_blocking(move || {
                        source.start(Box::new(pipeline) as Box<dyn FrameConsumer>)
                    })
                    .await
                    .map_err(|e| AudioError::ThreadFailed(e.to_string()))
                    .and_then(|r| r);

                    match started {
                        Ok(capture) => {
                            let late = {
                                let mut guard = captures.lock().await;
                                if guard.stop_requested.remove(&id) {
                                    Some(capture)
                                } else {
                                    guard.running.insert(id, capture);
                                    None
                                }
                            };

                            if let Some(capture) = late {
                                log::info!("Capture {} stopped before it finished starting", id);
                                match tokio::task::spawn_blocking(move || capture.stop()).await {
                                    Ok(Err(e)) => log::warn!("Failed to stop late capture: {}", e),
                                    Err(e) => log::warn!("Capture stop task failed: {}", e),
                                    Ok(Ok(())) => {}
                                }
                                return;
                            }

                            log::info!("Capture started: id={}", id);
                            let _ = tx.send(Event::AudioStartOk { id }).await;
                        }
                        Err(e) => {
                            log::error!("Failed to start capture: {}", e);
                            captures.lock().await.stop_requested.remove(&id);
                            let _ = tx
                                .send(Event::AudioStartFail {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StopAudio { id } => {
                let captures = self.captures.clone();

                tokio::spawn(async move {
                    let capture = {
                        let mut guard = captures.lock().await;
                        let capture = guard.running.remove(&id);
                        if capture.is_none() {
                            guard.stop_requested.insert(id);
                        }
                        capture
                    };

                    let Some(capture) = capture else {
                        log::debug!("StopAudio: capture {} not running yet", id);
                        let _ = tx.send(Event::AudioStopOk { id }).await;
                        return;
                    };

                    let stopped = tokio::task::spawn_blocking(move || capture.stop())
                        .await
                        .map_err(|e| AudioError::ThreadFailed(e.to_string()))
                        .and_then(|r| r);

                    match stopped {
                        Ok(()) => {
                            log::info!("Capture stopped: id={}", id);
                            let _ = tx.send(Event::AudioStopOk { id }).await;
                        }
                        Err(e) => {
                            log::error!("Failed to stop capture: {}", e);
                            let _ = tx
                                .send(Event::AudioStopFail {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::EmitUi => {
                // Handled in the state loop
                log::debug!("EmitUi reached the effect runner; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct Collect(Arc<StdMutex<Vec<AudioFrame>>>);

    impl FrameDispatcher for Collect {
        fn dispatch(&mut self, frame: AudioFrame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    struct NoDevice;

    impl CaptureSource for NoDevice {
        fn start(&self, _: Box<dyn FrameConsumer>) -> Result<Box<dyn ActiveCapture>, AudioError> {
            Err(AudioError::NoInputDevice)
        }
    }

    /// Pushes a fixed block of samples at start, then idles.
    struct Synthetic {
        samples: Vec<f32>,
        stopped: Arc<AtomicBool>,
    }

    struct SyntheticCapture(Arc<AtomicBool>);

    impl ActiveCapture for SyntheticCapture {
        fn stop(self: Box<Self>) -> Result<(), AudioError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl CaptureSource for Synthetic {
        fn start(
            &self,
            mut consumer: Box<dyn FrameConsumer>,
        ) -> Result<Box<dyn ActiveCapture>, AudioError> {
            for chunk in self.samples.chunks(128) {
                consumer.push(chunk);
            }
            Ok(Box::new(SyntheticCapture(self.stopped.clone())))
        }
    }

    #[tokio::test]
    async fn start_failure_reports_event() {
        let runner = AudioEffectRunner::new(Arc::new(NoDevice), Collect::default(), 1024);
        let (tx, mut rx) = mpsc::channel(8);
        let id = Uuid::new_v4();

        runner.spawn(Effect::StartAudio { id }, tx);

        match rx.recv().await {
            Some(Event::AudioStartFail { id: got, err }) => {
                assert_eq!(got, id);
                assert!(err.contains("No audio input device"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(runner.active_count().await, 0);
    }

    #[tokio::test]
    async fn start_feeds_pipeline_then_stop() {
        let frames = Collect::default();
        let stopped = Arc::new(AtomicBool::new(false));
        let source = Synthetic {
            samples: vec![0.5; 2600],
            stopped: stopped.clone(),
        };
        let runner = AudioEffectRunner::new(Arc::new(source), frames.clone(), 1024);
        let (tx, mut rx) = mpsc::channel(8);
        let id = Uuid::new_v4();

        runner.spawn(Effect::StartAudio { id }, tx.clone());
        assert!(matches!(rx.recv().await, Some(Event::AudioStartOk { .. })));
        assert_eq!(runner.active_count().await, 1);

        {
            let got = frames.0.lock().unwrap();
            assert_eq!(got.len(), 2);
            assert!(got.iter().all(|f| f.len() == 1024));
        }

        runner.spawn(Effect::StopAudio { id }, tx);
        assert!(matches!(rx.recv().await, Some(Event::AudioStopOk { .. })));
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(runner.active_count().await, 0);
    }

    #[tokio::test]
    async fn stop_before_start_completes_stops_late_capture() {
        let stopped = Arc::new(AtomicBool::new(false));
        let source = Synthetic {
            samples: Vec::new(),
            stopped: stopped.clone(),
        };
        let runner = AudioEffectRunner::new(Arc::new(source), Collect::default(), 1024);
        let id = Uuid::new_v4();

        // Stop registers first
        let (tx, mut rx) = mpsc::channel(8);
        runner.spawn(Effect::StopAudio { id }, tx.clone());
        assert!(matches!(rx.recv().await, Some(Event::AudioStopOk { .. })));

        runner.spawn(Effect::StartAudio { id }, tx);

        // The start task stops the late capture and exits without reporting
        assert!(rx.recv().await.is_none());
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(runner.active_count().await, 0);
    }
}
