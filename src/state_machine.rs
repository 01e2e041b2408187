//! Recording workflow state machine
//!
//! Start/stop of microphone capture goes through a single-writer reducer.
//! `reduce()` never touches devices; it returns the next state plus the
//! effects the runner must execute. Completion events carry the recording
//! id so late replies from an earlier recording are ignored.

use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum State {
    /// Not capturing. `last_error` explains why the previous attempt ended.
    Idle {
        last_error: Option<String>,
    },
    Arming {
        recording_id: Uuid,
    },
    Recording {
        recording_id: Uuid,
        started_at: Instant,
    },
    Stopping {
        recording_id: Uuid,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle { last_error: None }
    }
}

impl State {
    pub fn recording_id(&self) -> Option<Uuid> {
        match self {
            State::Arming { recording_id }
            | State::Recording { recording_id, .. }
            | State::Stopping { recording_id } => Some(*recording_id),
            State::Idle { .. } => None,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, State::Recording { .. })
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            State::Idle { last_error } => last_error.as_deref(),
            _ => None,
        }
    }

    /// Short label for the status line
    pub fn label(&self) -> &'static str {
        match self {
            State::Idle { .. } => "idle",
            State::Arming { .. } => "starting microphone",
            State::Recording { .. } => "recording",
            State::Stopping { .. } => "stopping",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    /// User asked to start streaming the microphone
    StartRecording,
    /// User asked to stop streaming the microphone
    StopRecording,
    /// Start if idle, stop if recording
    Toggle,
    /// Application exit requested
    Exit,

    AudioStartOk { id: Uuid },
    AudioStartFail { id: Uuid, err: String },
    AudioStopOk { id: Uuid },
    AudioStopFail { id: Uuid, err: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartAudio { id: Uuid },
    StopAudio { id: Uuid },
    /// Redraw the status line
    EmitUi,
}

fn arm() -> (State, Vec<Effect>) {
    let id = Uuid::new_v4();
    (
        State::Arming { recording_id: id },
        vec![Effect::StartAudio { id }, Effect::EmitUi],
    )
}

/// Reducer: (state, event) -> (next_state, effects)
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle { .. }, StartRecording | Toggle) => arm(),

        // -----------------
        // Arming
        // -----------------
        (Arming { recording_id }, AudioStartOk { id }) if *recording_id == id => (
            Recording {
                recording_id: id,
                started_at: Instant::now(),
            },
            vec![EmitUi],
        ),
        // Device failure aborts the start; nothing was captured
        (Arming { recording_id }, AudioStartFail { id, err }) if *recording_id == id => (
            Idle {
                last_error: Some(err),
            },
            vec![EmitUi],
        ),
        // Stop while the device is still opening: stop whatever comes up
        (Arming { recording_id }, StopRecording | Toggle | Exit) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopAudio { id: *recording_id }, EmitUi],
        ),

        // -----------------
        // Recording
        // -----------------
        (Recording { recording_id, .. }, StopRecording | Toggle | Exit) => (
            Stopping {
                recording_id: *recording_id,
            },
            vec![StopAudio { id: *recording_id }, EmitUi],
        ),

        // -----------------
        // Stopping
        // -----------------
        (Stopping { recording_id }, AudioStopOk { id }) if *recording_id == id => {
            (State::default(), vec![EmitUi])
        }
        (Stopping { recording_id }, AudioStopFail { id, err }) if *recording_id == id => (
            Idle {
                last_error: Some(err),
            },
            vec![EmitUi],
        ),
        // A start reply racing a stop request: the stop effect is already queued
        (Stopping { recording_id }, AudioStartOk { id } | AudioStartFail { id, .. })
            if *recording_id == id =>
        {
            (state.clone(), vec![])
        }

        // Stale completions, repeated commands and everything else
        _ => (state.clone(), vec![]),
    }
}
