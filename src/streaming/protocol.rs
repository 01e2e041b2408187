//! Reading-server wire protocol
//!
//! # Outbound
//!
//! Binary WebSocket messages, one per audio frame: `frame_size` PCM16
//! samples, little-endian, `frame_size * 2` bytes. Never fragmented across
//! messages.
//!
//! # Inbound
//!
//! Text messages carrying a JSON envelope:
//!
//! ```text
//! {"ws_msg_type": "passage_details", "content": {"passage": [...], "marks": [...]}}
//! {"ws_msg_type": "marking_details", "content": {"start_idx": 1, "end_idx": 2, "marks": [1, 2]}}
//! ```
//!
//! Unrecognized `ws_msg_type` values decode to [`ServerMessage::Unknown`].

use serde::Deserialize;
use serde_json::json;

use super::StreamingError;
use crate::audio::AudioFrame;
use crate::session::{Mark, MarkPatch};

/// Default reading-server endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8012/ws";

pub const MSG_PASSAGE_DETAILS: &str = "passage_details";
pub const MSG_MARKING_DETAILS: &str = "marking_details";

/// Bytes per PCM16 sample on the wire
pub const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Deserialize)]
struct Envelope {
    ws_msg_type: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PassageContent {
    passage: Vec<String>,
    marks: Vec<Mark>,
}

/// Messages received from the reading server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Passage to read plus baseline marks
    PassageDetails {
        passage: Vec<String>,
        marks: Vec<Mark>,
    },
    /// Incremental mark update
    MarkingDetails(MarkPatch),
    /// Any other discriminant; carries the tag for logging
    Unknown(String),
}

impl ServerMessage {
    /// Decode one text frame.
    ///
    /// Fails only for undecodable JSON or a known kind with a malformed body.
    pub fn parse(text: &str) -> Result<Self, StreamingError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| StreamingError::ProtocolError(format!("bad envelope: {}", e)))?;

        match envelope.ws_msg_type.as_str() {
            MSG_PASSAGE_DETAILS => {
                let content: PassageContent = serde_json::from_value(envelope.content)
                    .map_err(|e| {
                        StreamingError::ProtocolError(format!("bad {}: {}", MSG_PASSAGE_DETAILS, e))
                    })?;
                Ok(ServerMessage::PassageDetails {
                    passage: content.passage,
                    marks: content.marks,
                })
            }
            MSG_MARKING_DETAILS => {
                let patch: MarkPatch = serde_json::from_value(envelope.content).map_err(|e| {
                    StreamingError::ProtocolError(format!("bad {}: {}", MSG_MARKING_DETAILS, e))
                })?;
                Ok(ServerMessage::MarkingDetails(patch))
            }
            _ => Ok(ServerMessage::Unknown(envelope.ws_msg_type)),
        }
    }

    /// Wire discriminant of this message
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::PassageDetails { .. } => MSG_PASSAGE_DETAILS,
            ServerMessage::MarkingDetails(_) => MSG_MARKING_DETAILS,
            ServerMessage::Unknown(kind) => kind,
        }
    }

    /// Encode as the server would send it
    pub fn to_json(&self) -> String {
        let value = match self {
            ServerMessage::PassageDetails { passage, marks } => json!({
                "ws_msg_type": MSG_PASSAGE_DETAILS,
                "content": { "passage": passage, "marks": marks },
            }),
            ServerMessage::MarkingDetails(patch) => json!({
                "ws_msg_type": MSG_MARKING_DETAILS,
                "content": patch,
            }),
            ServerMessage::Unknown(kind) => json!({ "ws_msg_type": kind, "content": null }),
        };
        value.to_string()
    }
}

/// Binary payload for one audio frame
pub fn frame_payload(frame: &AudioFrame) -> Vec<u8> {
    frame.to_le_bytes()
}

/// Decode a binary payload back into samples (odd trailing byte ignored)
pub fn decode_frame_payload(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
