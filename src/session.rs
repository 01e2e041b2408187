//! Reading session state
//!
//! Single writer for the passage and its marks. The session starts
//! `Unready`, becomes `Ready` exactly once when the passage arrives, and
//! from then on only mark codes change, one patch at a time, in arrival
//! order. Presentation gets read-only [`SessionSnapshot`]s through a
//! `watch` channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::streaming::ServerMessage;

/// Reading-progress status of a single word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Mark {
    #[default]
    Unread = 0,
    CorrectlyRead = 1,
    IncorrectlyRead = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown mark code {0}")]
pub struct UnknownMark(pub u8);

impl TryFrom<u8> for Mark {
    type Error = UnknownMark;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Mark::Unread),
            1 => Ok(Mark::CorrectlyRead),
            2 => Ok(Mark::IncorrectlyRead),
            other => Err(UnknownMark(other)),
        }
    }
}

impl From<Mark> for u8 {
    fn from(mark: Mark) -> Self {
        mark as u8
    }
}

/// Overwrite of a contiguous, inclusive range of marks.
///
/// Indices are signed on the wire: the server reports "nothing new" as
/// `end_idx = start_idx - 1` (possibly `-1`) with an empty mark list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPatch {
    pub start_idx: i64,
    pub end_idx: i64,
    pub marks: Vec<Mark>,
}

impl MarkPatch {
    pub fn new(start_idx: i64, end_idx: i64, marks: Vec<Mark>) -> Self {
        Self {
            start_idx,
            end_idx,
            marks,
        }
    }

    fn is_empty_range(&self) -> bool {
        self.end_idx == self.start_idx - 1 && self.marks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session has no passage yet")]
    NotReady,
    #[error("passage has {words} words but {marks} marks")]
    LengthMismatch { words: usize, marks: usize },
    #[error("invalid patch range [{start}, {end}]")]
    InvalidRange { start: i64, end: i64 },
    #[error("patch range [{start}, {end}] out of bounds for {len} words")]
    OutOfBounds { start: i64, end: i64, len: usize },
    #[error("patch range covers {expected} words but carries {actual} marks")]
    MarkCountMismatch { expected: usize, actual: usize },
}

/// Word counts per mark, plus the furthest word with any mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub correct: usize,
    pub incorrect: usize,
    pub unread: usize,
    pub last_marked: Option<usize>,
}

/// Words (write-once) and their marks.
#[derive(Debug, Clone)]
pub struct Passage {
    words: Arc<[String]>,
    marks: Vec<Mark>,
}

impl Passage {
    pub fn new(words: Vec<String>, marks: Vec<Mark>) -> Result<Self, SessionError> {
        if words.len() != marks.len() {
            return Err(SessionError::LengthMismatch {
                words: words.len(),
                marks: marks.len(),
            });
        }
        Ok(Self {
            words: words.into(),
            marks,
        })
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn progress(&self) -> Progress {
        let mut progress = Progress::default();
        for (i, mark) in self.marks.iter().enumerate() {
            match mark {
                Mark::Unread => progress.unread += 1,
                Mark::CorrectlyRead => {
                    progress.correct += 1;
                    progress.last_marked = Some(i);
                }
                Mark::IncorrectlyRead => {
                    progress.incorrect += 1;
                    progress.last_marked = Some(i);
                }
            }
        }
        progress
    }

    /// Validate and apply. Returns whether any mark changed.
    fn apply(&mut self, patch: &MarkPatch) -> Result<bool, SessionError> {
        let len = self.len();

        if patch.is_empty_range() && patch.start_idx >= 0 && patch.start_idx as usize <= len {
            return Ok(false);
        }

        if patch.start_idx < 0 || patch.end_idx < 0 {
            return Err(SessionError::OutOfBounds {
                start: patch.start_idx,
                end: patch.end_idx,
                len,
            });
        }
        if patch.start_idx > patch.end_idx {
            return Err(SessionError::InvalidRange {
                start: patch.start_idx,
                end: patch.end_idx,
            });
        }
        if patch.end_idx as usize >= len {
            return Err(SessionError::OutOfBounds {
                start: patch.start_idx,
                end: patch.end_idx,
                len,
            });
        }

        let start = patch.start_idx as usize;
        let end = patch.end_idx as usize;
        let expected = end - start + 1;
        if patch.marks.len() != expected {
            return Err(SessionError::MarkCountMismatch {
                expected,
                actual: patch.marks.len(),
            });
        }

        let changed = self.marks[start..=end] != patch.marks[..];
        self.marks[start..=end].copy_from_slice(&patch.marks);
        Ok(changed)
    }
}

/// Read-only view handed to presentation.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub ready: bool,
    pub words: Arc<[String]>,
    pub marks: Vec<Mark>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            ready: false,
            words: Arc::from(Vec::new()),
            marks: Vec::new(),
        }
    }
}

impl SessionSnapshot {
    pub fn progress(&self) -> Progress {
        Passage {
            words: self.words.clone(),
            marks: self.marks.clone(),
        }
        .progress()
    }
}

/// Result of [`ReadingSession::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Installed,
    /// Session was already ready; the new passage was dropped
    Ignored,
}

pub struct ReadingSession {
    passage: Option<Passage>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    patches_applied: u64,
}

impl Default for ReadingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingSession {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        Self {
            passage: None,
            snapshot_tx,
            patches_applied: 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.passage.is_some()
    }

    pub fn passage(&self) -> Option<&Passage> {
        self.passage.as_ref()
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied
    }

    /// Install the passage and move to Ready.
    ///
    /// Only the first call takes effect; later calls are ignored.
    pub fn initialize(
        &mut self,
        words: Vec<String>,
        marks: Vec<Mark>,
    ) -> Result<InitOutcome, SessionError> {
        if self.passage.is_some() {
            log::debug!("Session: passage already installed, ignoring re-initialization");
            return Ok(InitOutcome::Ignored);
        }

        let passage = Passage::new(words, marks)?;
        log::info!("Session: ready with {} words", passage.len());
        self.passage = Some(passage);
        self.publish();
        Ok(InitOutcome::Installed)
    }

    /// Overwrite `marks[start_idx..=end_idx]`.
    ///
    /// Invalid ranges are rejected and leave every mark untouched.
    pub fn apply_patch(&mut self, patch: &MarkPatch) -> Result<(), SessionError> {
        let passage = self.passage.as_mut().ok_or(SessionError::NotReady)?;
        let changed = passage.apply(patch)?;
        self.patches_applied += 1;
        if changed {
            self.publish();
        }
        Ok(())
    }

    /// Route one decoded server message to the matching operation.
    pub fn apply_message(&mut self, msg: ServerMessage) -> Result<(), SessionError> {
        match msg {
            ServerMessage::PassageDetails { passage, marks } => {
                self.initialize(passage, marks).map(|_| ())
            }
            ServerMessage::MarkingDetails(patch) => self.apply_patch(&patch),
            ServerMessage::Unknown(kind) => {
                log::debug!("Session: ignoring message kind {:?}", kind);
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Change notifications; the receiver always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        let snapshot = match &self.passage {
            Some(p) => SessionSnapshot {
                ready: true,
                words: p.words.clone(),
                marks: p.marks.clone(),
            },
            None => SessionSnapshot::default(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn ready_session() -> ReadingSession {
        let mut session = ReadingSession::new();
        session
            .initialize(words(&["the", "cat", "sat"]), vec![Mark::Unread; 3])
            .unwrap();
        session
    }

    #[test]
    fn test_new_session_is_unready() {
        let session = ReadingSession::new();
        assert!(!session.is_ready());
        assert!(!session.snapshot().ready);
        assert!(session.snapshot().words.is_empty());
    }

    #[test]
    fn test_initialize_then_patch() {
        let mut session = ready_session();
        assert!(session.is_ready());
        assert_eq!(session.snapshot().marks, vec![Mark::Unread; 3]);

        session
            .apply_patch(&MarkPatch::new(
                1,
                2,
                vec![Mark::CorrectlyRead, Mark::IncorrectlyRead],
            ))
            .unwrap();

        assert_eq!(
            session.snapshot().marks,
            vec![Mark::Unread, Mark::CorrectlyRead, Mark::IncorrectlyRead]
        );
    }

    #[test]
    fn test_reinitialize_is_ignored() {
        let mut session = ready_session();
        let outcome = session
            .initialize(words(&["other"]), vec![Mark::CorrectlyRead])
            .unwrap();
        assert_eq!(outcome, InitOutcome::Ignored);
        assert_eq!(session.passage().unwrap().words(), &words(&["the", "cat", "sat"])[..]);
    }

    #[test]
    fn test_initialize_rejects_length_mismatch() {
        let mut session = ReadingSession::new();
        let err = session
            .initialize(words(&["a", "b"]), vec![Mark::Unread])
            .unwrap_err();
        assert_eq!(err, SessionError::LengthMismatch { words: 2, marks: 1 });
        assert!(!session.is_ready());
    }

    #[test]
    fn test_patch_before_ready_fails() {
        let mut session = ReadingSession::new();
        let err = session
            .apply_patch(&MarkPatch::new(0, 0, vec![Mark::CorrectlyRead]))
            .unwrap_err();
        assert_eq!(err, SessionError::NotReady);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let patch = MarkPatch::new(0, 1, vec![Mark::CorrectlyRead, Mark::IncorrectlyRead]);

        let mut once = ready_session();
        once.apply_patch(&patch).unwrap();

        let mut twice = ready_session();
        twice.apply_patch(&patch).unwrap();
        twice.apply_patch(&patch).unwrap();

        assert_eq!(once.snapshot().marks, twice.snapshot().marks);
    }

    #[test]
    fn test_out_of_bounds_patch_leaves_marks_unchanged() {
        let mut session = ready_session();
        session
            .apply_patch(&MarkPatch::new(0, 0, vec![Mark::CorrectlyRead]))
            .unwrap();
        let before = session.snapshot().marks;

        let err = session
            .apply_patch(&MarkPatch::new(
                2,
                3,
                vec![Mark::CorrectlyRead, Mark::CorrectlyRead],
            ))
            .unwrap_err();

        assert!(matches!(err, SessionError::OutOfBounds { len: 3, .. }));
        assert_eq!(session.snapshot().marks, before);
    }

    #[test]
    fn test_negative_and_inverted_ranges_rejected() {
        let mut session = ready_session();
        assert!(matches!(
            session.apply_patch(&MarkPatch::new(-1, 0, vec![Mark::Unread])),
            Err(SessionError::OutOfBounds { .. })
        ));
        assert!(matches!(
            session.apply_patch(&MarkPatch::new(2, 0, vec![])),
            Err(SessionError::InvalidRange { start: 2, end: 0 })
        ));
    }

    #[test]
    fn test_mark_count_mismatch_rejected() {
        let mut session = ready_session();
        let err = session
            .apply_patch(&MarkPatch::new(0, 2, vec![Mark::CorrectlyRead]))
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::MarkCountMismatch {
                expected: 3,
                actual: 1
            }
        );
        assert_eq!(session.snapshot().marks, vec![Mark::Unread; 3]);
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let mut session = ready_session();
        session.apply_patch(&MarkPatch::new(0, -1, vec![])).unwrap();
        session
            .apply_patch(&MarkPatch::new(0, 2, vec![Mark::CorrectlyRead; 3]))
            .unwrap();
        // Everything read; server reports start past the end
        session.apply_patch(&MarkPatch::new(3, 2, vec![])).unwrap();
        assert_eq!(session.snapshot().marks, vec![Mark::CorrectlyRead; 3]);
        assert_eq!(session.patches_applied(), 3);
    }

    #[test]
    fn test_overlapping_patches_apply_in_order() {
        let mut session = ready_session();
        session
            .apply_patch(&MarkPatch::new(
                0,
                1,
                vec![Mark::IncorrectlyRead, Mark::IncorrectlyRead],
            ))
            .unwrap();
        session
            .apply_patch(&MarkPatch::new(
                1,
                2,
                vec![Mark::CorrectlyRead, Mark::CorrectlyRead],
            ))
            .unwrap();
        assert_eq!(
            session.snapshot().marks,
            vec![Mark::IncorrectlyRead, Mark::CorrectlyRead, Mark::CorrectlyRead]
        );
    }

    #[test]
    fn test_progress_counts() {
        let passage = Passage::new(
            words(&["a", "b", "c", "d"]),
            vec![
                Mark::CorrectlyRead,
                Mark::IncorrectlyRead,
                Mark::CorrectlyRead,
                Mark::Unread,
            ],
        )
        .unwrap();
        let progress = passage.progress();
        assert_eq!(progress.correct, 2);
        assert_eq!(progress.incorrect, 1);
        assert_eq!(progress.unread, 1);
        assert_eq!(progress.last_marked, Some(2));
    }

    #[test]
    fn test_mark_codes() {
        assert_eq!(Mark::try_from(2u8), Ok(Mark::IncorrectlyRead));
        assert_eq!(Mark::try_from(7u8), Err(UnknownMark(7)));
        assert_eq!(u8::from(Mark::CorrectlyRead), 1);

        let marks: Vec<Mark> = serde_json::from_str("[0,1,2]").unwrap();
        assert_eq!(
            marks,
            vec![Mark::Unread, Mark::CorrectlyRead, Mark::IncorrectlyRead]
        );
        assert!(serde_json::from_str::<Vec<Mark>>("[3]").is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let mut session = ReadingSession::new();
        let mut rx = session.subscribe();
        assert!(!rx.borrow().ready);

        session
            .initialize(words(&["hi"]), vec![Mark::Unread])
            .unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().ready);

        session
            .apply_patch(&MarkPatch::new(0, 0, vec![Mark::CorrectlyRead]))
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().marks, vec![Mark::CorrectlyRead]);
    }

    #[test]
    fn test_apply_message_dispatches_by_kind() {
        let mut session = ReadingSession::new();
        session
            .apply_message(ServerMessage::PassageDetails {
                passage: words(&["the", "cat", "sat"]),
                marks: vec![Mark::Unread; 3],
            })
            .unwrap();
        session
            .apply_message(ServerMessage::MarkingDetails(MarkPatch::new(
                1,
                2,
                vec![Mark::CorrectlyRead, Mark::IncorrectlyRead],
            )))
            .unwrap();
        session
            .apply_message(ServerMessage::Unknown("score".to_string()))
            .unwrap();
        assert_eq!(
            session.snapshot().marks,
            vec![Mark::Unread, Mark::CorrectlyRead, Mark::IncorrectlyRead]
        );
    }
}
