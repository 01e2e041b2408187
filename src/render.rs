//! Terminal presentation of the reading session

use std::io::{self, Write};

use colored::*;

use crate::session::{Mark, SessionSnapshot};
use crate::state_machine::State;
use crate::streaming::{ConnectionState, TransportStats};

fn paint(word: &str, mark: Mark) -> ColoredString {
    match mark {
        Mark::Unread => word.normal(),
        Mark::CorrectlyRead => word.green(),
        Mark::IncorrectlyRead => word.red().underline(),
    }
}

/// Passage text with every word colored by its mark.
pub fn render_passage(snapshot: &SessionSnapshot) -> String {
    if !snapshot.ready {
        return "Waiting for passage...".dimmed().to_string();
    }

    snapshot
        .words
        .iter()
        .zip(snapshot.marks.iter())
        .map(|(word, mark)| paint(word, *mark).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One-line summary: correct/incorrect/unread counts.
pub fn format_progress(snapshot: &SessionSnapshot) -> String {
    let p = snapshot.progress();
    let total = snapshot.words.len();
    let percent = if total > 0 {
        (p.correct + p.incorrect) * 100 / total
    } else {
        0
    };

    format!(
        "{} correct, {} incorrect, {} unread ({}% read)",
        p.correct.to_string().green(),
        p.incorrect.to_string().red(),
        p.unread,
        percent
    )
}

pub fn format_status(state: &State, connection: ConnectionState, stats: &TransportStats) -> String {
    let dot = match connection {
        ConnectionState::Open => "●".green(),
        ConnectionState::Connecting => "●".yellow(),
        ConnectionState::Closed => "●".red(),
    };

    let mut line = format!(
        "{} {:?} | {} | {} frames sent, {} dropped",
        dot, connection, state.label(), stats.frames_sent, stats.frames_dropped
    );
    if let Some(err) = state.last_error() {
        line.push_str(&format!(" | {}", err.red()));
    }
    line
}

/// Print passage, progress and status to stdout.
pub fn draw(snapshot: &SessionSnapshot, status: &str) {
    let mut out = io::stdout().lock();
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", render_passage(snapshot));
    if snapshot.ready {
        let _ = writeln!(out, "{}", format_progress(snapshot));
    }
    let _ = writeln!(out, "{}", status);
    let _ = writeln!(
        out,
        "{}",
        "[Enter] start/stop reading   [r] reconnect   [q] quit".dimmed()
    );
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snapshot(words: &[&str], marks: Vec<Mark>) -> SessionSnapshot {
        let words: Vec<String> = words.iter().map(|w| w.to_string()).collect();
        SessionSnapshot {
            ready: true,
            words: Arc::from(words),
            marks,
        }
    }

    #[test]
    fn passage_keeps_word_order() {
        let snap = snapshot(
            &["the", "cat", "sat"],
            vec![Mark::CorrectlyRead, Mark::IncorrectlyRead, Mark::Unread],
        );
        let text = render_passage(&snap);
        let the = text.find("the").unwrap();
        let cat = text.find("cat").unwrap();
        let sat = text.find("sat").unwrap();
        assert!(the < cat && cat < sat);
    }

    #[test]
    fn not_ready_shows_waiting() {
        let text = render_passage(&SessionSnapshot::default());
        assert!(text.contains("Waiting for passage"));
    }

    #[test]
    fn progress_counts() {
        let snap = snapshot(
            &["a", "b", "c", "d"],
            vec![
                Mark::CorrectlyRead,
                Mark::CorrectlyRead,
                Mark::IncorrectlyRead,
                Mark::Unread,
            ],
        );
        let line = format_progress(&snap);
        assert!(line.contains("correct"));
        assert!(line.contains("1 unread"));
        assert!(line.contains("75% read"));
    }

    #[test]
    fn status_shows_error_message() {
        let state = State::Idle {
            last_error: Some("No audio input device found".to_string()),
        };
        let line = format_status(&state, ConnectionState::Open, &TransportStats::default());
        assert!(line.contains("No audio input device found"));
        assert!(line.contains("Open"));
    }
}
