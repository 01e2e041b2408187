//! Streaming transport to the reading server
//!
//! One WebSocket per recording session. Audio frames go out as binary
//! messages; passage and marking updates come back as JSON text.
//!
//! # Architecture
//!
//! ```text
//! audio thread                       tokio runtime
//! ┌──────────────────┐               ┌───────────────────────────┐
//! │ CapturePipeline  │──try_send──▶  │ connection task           │──▶ server
//! │ FrameSender      │  (drop if     │  ├─ write binary frames   │
//! └──────────────────┘   not open)   │  ├─ parse text messages   │◀── server
//!                                    │  └─ bounded reconnect     │
//!                                    └────────────┬──────────────┘
//!                                                 ▼
//!                                          MessageReceiver
//! ```
//!
//! # Failure strategy
//!
//! - Unexpected closure: up to 5 reconnect attempts, 1 s apart, then give up
//!   quietly (capture keeps running, frames are dropped)
//! - Frames are never buffered across a disconnect
//! - Malformed inbound messages are logged and discarded

mod connector;
mod protocol;
mod reconnect;
mod transport;

pub use connector::{
    Connector, InboundStream, Link, LoopbackConnector, LoopbackServer, Message, OutboundSink,
    WebSocketConnector, DEFAULT_CONNECT_TIMEOUT,
};
pub use protocol::{
    decode_frame_payload, frame_payload, ServerMessage, BYTES_PER_SAMPLE, DEFAULT_SERVER_URL,
    MSG_MARKING_DETAILS, MSG_PASSAGE_DETAILS,
};
pub use reconnect::{
    ReconnectDecision, ReconnectPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL,
};
pub use transport::{
    ConnectionState, FrameSender, MessageReceiver, Transport, TransportConfig, TransportStats,
};

use thiserror::Error;

/// Errors that can occur on the streaming connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    /// Failed to establish the WebSocket connection
    #[error("Failed to connect to reading server: {0}")]
    ConnectionFailed(String),
    /// An operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),
    /// Inbound message could not be decoded
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    /// Connection was closed unexpectedly
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    /// Failed to write to the socket
    #[error("Failed to send: {0}")]
    SendFailed(String),
    /// Transport was closed by its owner
    #[error("Transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = StreamingError::Timeout("WebSocket handshake".to_string());
        assert!(err.to_string().contains("handshake"));

        assert_eq!(StreamingError::Closed.to_string(), "Transport closed");
    }
}
