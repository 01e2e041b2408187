pub mod audio;
pub mod cli;
pub mod effects;
pub mod render;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use cli::Args;
use effects::{AudioEffectRunner, EffectRunner, MicrophoneSource};
use session::{ReadingSession, SessionSnapshot};
use state_machine::{reduce, Effect, Event, State};
use streaming::{MessageReceiver, Transport, WebSocketConnector};

/// How long shutdown waits for capture to stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State loop manager - holds the event sender for dispatching events
#[derive(Clone)]
pub struct StateLoopHandle {
    tx: mpsc::Sender<Event>,
}

impl StateLoopHandle {
    /// Send an event to the state machine
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }
}

/// Run the recording state loop until `Exit` has been handled and no
/// capture is left running.
pub async fn run_state_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    ui: watch::Sender<State>,
) {
    let mut state = State::default();
    let mut exiting = false;

    ui.send_replace(state.clone());
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        if matches!(event, Event::Exit) {
            log::info!("Exit requested");
            exiting = true;
        }

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event);
        if old_discriminant != std::mem::discriminant(&next) {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }
        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUi => {
                    ui.send_replace(state.clone());
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }

        if exiting && state.recording_id().is_none() {
            break;
        }
    }

    log::info!("State loop ended");
}

/// Start the state loop on the runtime.
pub fn spawn_state_loop(
    effect_runner: Arc<dyn EffectRunner>,
) -> (StateLoopHandle, watch::Receiver<State>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<Event>(32);
    let (ui_tx, ui_rx) = watch::channel(State::default());
    let task = tokio::spawn(run_state_loop(rx, tx.clone(), effect_runner, ui_tx));
    (StateLoopHandle { tx }, ui_rx, task)
}

/// Feed every inbound server message into `session`.
///
/// Rejected messages are logged and leave the session unchanged. Ends when
/// the transport stops delivering and hands the session back.
pub fn spawn_session_consumer(
    mut session: ReadingSession,
    mut incoming: MessageReceiver,
) -> JoinHandle<ReadingSession> {
    tokio::spawn(async move {
        while let Some(msg) = incoming.recv().await {
            let kind = msg.kind().to_string();
            if let Err(e) = session.apply_message(msg) {
                log::warn!("Session: rejected {}: {}", kind, e);
            }
        }
        log::debug!(
            "Session: inbound stream ended after {} patches",
            session.patches_applied()
        );
        session
    })
}

fn redraw(snapshot: &SessionSnapshot, state: &State, transport: &Transport) {
    let status = render::format_status(state, transport.state(), &transport.stats());
    render::draw(snapshot, &status);
}

/// Application entry: connect, wait for the passage, then let the reader
/// toggle the microphone until they quit.
pub async fn run(args: Args) -> anyhow::Result<()> {
    let settings_path = match &args.settings {
        Some(path) => path.clone(),
        None => settings::default_settings_path()?,
    };
    let mut app_settings = settings::load_settings(&settings_path);
    args.apply(&mut app_settings);
    app_settings.validate()?;

    if args.save {
        settings::save_settings(&settings_path, &app_settings)
            .with_context(|| format!("saving settings to {:?}", settings_path))?;
        log::info!("Settings saved to {:?}", settings_path);
    }

    let connector = Arc::new(WebSocketConnector::new(app_settings.connect_timeout()));
    let mut transport = Transport::new(app_settings.transport_config(), connector);
    let incoming = transport
        .take_incoming_receiver()
        .context("inbound receiver already taken")?;

    let session = ReadingSession::new();
    let mut snapshots = session.subscribe();
    let consumer = spawn_session_consumer(session, incoming);

    transport
        .connect()
        .await
        .with_context(|| format!("connecting to {}", transport.url()))?;

    let source = Arc::new(MicrophoneSource::new(app_settings.sample_rate));
    let runner = AudioEffectRunner::new(source, transport.frame_sender(), app_settings.frame_size);
    let (handle, mut ui_rx, state_task) = spawn_state_loop(runner);

    log::info!("MonkeyRead started");
    redraw(&snapshots.borrow().clone(), &ui_rx.borrow().clone(), &transport);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session_live = true;
    let mut ui_live = true;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "q" | "quit" => break,
                    "r" | "reconnect" => {
                        match transport.connect().await {
                            Ok(()) => log::info!("Connected to {}", transport.url()),
                            Err(e) => log::warn!("Reconnect failed: {}", e),
                        }
                        redraw(&snapshots.borrow().clone(), &ui_rx.borrow().clone(), &transport);
                    }
                    "" => {
                        let ready = snapshots.borrow().ready;
                        if ready {
                            if handle.send(Event::Toggle).await.is_err() {
                                break;
                            }
                        } else {
                            println!("Still waiting for the passage from the server");
                        }
                    }
                    other => log::debug!("Ignoring input {:?}", other),
                },
                Ok(None) => break,
                Err(e) => {
                    log::warn!("stdin: {}", e);
                    break;
                }
            },
            changed = snapshots.changed(), if session_live => {
                if changed.is_err() {
                    log::warn!("Session updates ended (connection lost)");
                    session_live = false;
                }
                redraw(&snapshots.borrow_and_update().clone(), &ui_rx.borrow().clone(), &transport);
            }
            changed = ui_rx.changed(), if ui_live => {
                if changed.is_err() {
                    ui_live = false;
                    continue;
                }
                redraw(&snapshots.borrow().clone(), &ui_rx.borrow_and_update().clone(), &transport);
            }
        }
    }

    log::info!("Shutting down");
    let _ = handle.send(Event::Exit).await;
    if tokio::time::timeout(SHUTDOWN_GRACE, state_task).await.is_err() {
        log::warn!("Capture did not stop within {:?}", SHUTDOWN_GRACE);
    }

    transport.close().await;
    match tokio::time::timeout(SHUTDOWN_GRACE, consumer).await {
        Ok(Ok(session)) => {
            if let Some(passage) = session.passage() {
                let p = passage.progress();
                log::info!(
                    "Final: {} correct, {} incorrect, {} unread",
                    p.correct,
                    p.incorrect,
                    p.unread
                );
            }
        }
        Ok(Err(e)) => log::warn!("Session task failed: {}", e),
        Err(_) => log::warn!("Session task did not finish"),
    }

    let stats = transport.stats();
    log::info!(
        "Transport: {} frames sent, {} dropped, {} reconnect attempts",
        stats.frames_sent,
        stats.frames_dropped,
        stats.reconnect_attempts
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, AudioFrame, FrameConsumer, FrameDispatcher};
    use crate::effects::{ActiveCapture, CaptureSource};

    #[derive(Clone)]
    struct Discard;

    impl FrameDispatcher for Discard {
        fn dispatch(&mut self, _frame: AudioFrame) {}
    }

    struct NoDevice;

    impl CaptureSource for NoDevice {
        fn start(&self, _: Box<dyn FrameConsumer>) -> Result<Box<dyn ActiveCapture>, AudioError> {
            Err(AudioError::NoInputDevice)
        }
    }

    struct Idle;

    impl ActiveCapture for Idle {
        fn stop(self: Box<Self>) -> Result<(), AudioError> {
            Ok(())
        }
    }

    struct AlwaysWorks;

    impl CaptureSource for AlwaysWorks {
        fn start(&self, _: Box<dyn FrameConsumer>) -> Result<Box<dyn ActiveCapture>, AudioError> {
            Ok(Box::new(Idle))
        }
    }

    async fn wait_for(ui: &mut watch::Receiver<State>, pred: impl Fn(&State) -> bool) -> State {
        loop {
            {
                let state = ui.borrow_and_update();
                if pred(&*state) {
                    return state.clone();
                }
            }
            ui.changed().await.expect("state loop alive");
        }
    }

    #[tokio::test]
    async fn device_failure_returns_to_idle_with_error() {
        let runner = AudioEffectRunner::new(Arc::new(NoDevice), Discard, 1024);
        let (handle, mut ui, task) = spawn_state_loop(runner);

        handle.send(Event::StartRecording).await.unwrap();
        let state = wait_for(&mut ui, |s| s.last_error().is_some()).await;
        assert!(matches!(state, State::Idle { .. }));
        assert!(state.last_error().unwrap().contains("input device"));

        handle.send(Event::Exit).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn toggle_records_then_exit_stops_capture() {
        let runner = AudioEffectRunner::new(Arc::new(AlwaysWorks), Discard, 1024);
        let (handle, mut ui, task) = spawn_state_loop(runner.clone());

        handle.send(Event::Toggle).await.unwrap();
        wait_for(&mut ui, State::is_recording).await;
        assert_eq!(runner.active_count().await, 1);

        handle.send(Event::Exit).await.unwrap();
        task.await.unwrap();
        assert_eq!(runner.active_count().await, 0);
    }
}
