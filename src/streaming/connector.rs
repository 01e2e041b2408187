//! Connection establishment
//!
//! [`Connector`] is the seam between the transport and the socket: the
//! transport only sees a [`Link`] (a boxed sink of outbound messages plus a
//! boxed stream of inbound ones). [`WebSocketConnector`] dials the reading
//! server with tokio-tungstenite; [`LoopbackConnector`] hands out in-memory
//! links whose far ends can be driven directly, which is how the transport
//! is exercised without a network.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async_with_config, tungstenite::client::IntoClientRequest};

pub use tokio_tungstenite::tungstenite::Message;

use super::protocol::ServerMessage;
use super::StreamingError;

/// Timeout for the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type OutboundSink = Pin<Box<dyn Sink<Message, Error = StreamingError> + Send>>;
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Message, StreamingError>> + Send>>;

/// An open, bidirectional message stream
pub struct Link {
    pub outbound: OutboundSink,
    pub inbound: InboundStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link. Resolves once the peer reports the connection open.
    async fn connect(&self, url: &str) -> Result<Link, StreamingError>;
}

/// Dials a `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Link, StreamingError> {
        let request = url
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Connector: connecting to {}", url);

        let (ws_stream, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(
                request, None, true, // disable_nagle: frames are small and latency-sensitive
            ),
        )
        .await
        .map_err(|_| StreamingError::Timeout("WebSocket handshake".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Connector: WebSocket open");

        let (write, read) = ws_stream.split();
        let outbound = write.sink_map_err(|e| StreamingError::SendFailed(e.to_string()));
        let inbound = read.map(|r| r.map_err(|e| StreamingError::Disconnected(e.to_string())));

        Ok(Link {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}

// ============================================================================
// In-memory loopback
// ============================================================================

/// Far end of a loopback link.
///
/// Dropping it (or calling [`LoopbackServer::close`]) ends the client's
/// inbound stream, which the transport sees as an unexpected closure.
pub struct LoopbackServer {
    to_client: mpsc::UnboundedSender<Result<Message, StreamingError>>,
    from_client: mpsc::UnboundedReceiver<Message>,
}

impl LoopbackServer {
    /// Returns false if the client side is gone
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(Message::Text(text.into()))).is_ok()
    }

    pub fn send_message(&self, msg: &ServerMessage) -> bool {
        self.send_text(msg.to_json())
    }

    /// Next message the client sent
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.from_client.try_recv().ok()
    }

    /// Send a close frame, then hang up
    pub fn close(self) {
        let _ = self.to_client.send(Ok(Message::Close(None)));
    }
}

#[derive(Default)]
struct LoopbackState {
    refuse_next: usize,
    refuse_all: bool,
    attempts: Vec<Instant>,
}

/// Connector producing in-memory links.
///
/// Every accepted connection delivers its [`LoopbackServer`] on the
/// receiver returned by [`LoopbackConnector::new`].
pub struct LoopbackConnector {
    state: Mutex<LoopbackState>,
    servers: mpsc::UnboundedSender<LoopbackServer>,
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoopbackServer>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            state: Mutex::new(LoopbackState::default()),
            servers,
        });
        (connector, server_rx)
    }

    /// Refuse the next `n` connection attempts
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse_next = n;
    }

    /// Refuse every attempt until switched off
    pub fn refuse_all(&self, refuse: bool) {
        self.lock().refuse_all = refuse;
    }

    /// Initiation instant of every attempt so far
    pub fn attempts(&self) -> Vec<Instant> {
        self.lock().attempts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        // A poisoned lock only means a test thread panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Link, StreamingError> {
        {
            let mut state = self.lock();
            state.attempts.push(Instant::now());
            if state.refuse_all {
                return Err(StreamingError::ConnectionFailed(format!("{} refused", url)));
            }
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(StreamingError::ConnectionFailed(format!("{} refused", url)));
            }
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel::<Message>();

        let outbound = futures_util::sink::unfold(client_tx, |tx, msg: Message| async move {
            tx.send(msg)
                .map_err(|_| StreamingError::SendFailed("loopback peer gone".to_string()))?;
            Ok::<_, StreamingError>(tx)
        });
        let inbound = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.servers
            .send(LoopbackServer {
                to_client,
                from_client,
            })
            .map_err(|_| StreamingError::ConnectionFailed("loopback listener gone".to_string()))?;

        Ok(Link {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}
