//! Connection manager for the reading server
//!
//! # Lifecycle
//!
//! 1. `Transport::new()` - nothing is dialed yet; take the message receiver
//!    and frame senders up front
//! 2. `connect()` - dial once; resolves when the link is open, fails if it
//!    never opens. After the reconnect policy has given up, calling it
//!    again dials a fresh link on the same channels
//! 3. `send()` / [`FrameSender::send`] - non-blocking, dropped unless open
//! 4. `close()` - idempotent teardown; nothing is sent or delivered after it
//!
//! A background task owns the link. On an unexpected closure it follows the
//! [`ReconnectPolicy`]: fixed-interval attempts measured from the previous
//! initiation, counter reset on success, silent give-up when exhausted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::connector::{Connector, Link, Message};
use super::protocol::{frame_payload, ServerMessage, DEFAULT_SERVER_URL};
use super::reconnect::{
    ReconnectDecision, ReconnectPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL,
};
use super::StreamingError;
use crate::audio::{AudioFrame, FrameDispatcher};

/// How long `close()` waits for the connection task to say goodbye
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Capacity of the inbound message queue
const INCOMING_QUEUE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Connecting => 0,
            ConnectionState::Open => 1,
            ConnectionState::Closed => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Reading-server endpoint, fixed for the session
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    /// Outbound frames allowed in flight before new ones are dropped
    pub outbound_queue_frames: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SERVER_URL.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_interval: DEFAULT_RETRY_INTERVAL,
            outbound_queue_frames: 32,
        }
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub reconnect_attempts: u64,
    pub messages_dispatched: u64,
    pub messages_discarded: u64,
}

/// State shared between the owner, frame senders and the connection task
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    closed_by_owner: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_dispatched: AtomicU64,
    messages_discarded: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let shared = Self::default();
        shared.set_state(ConnectionState::Closed);
        shared
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move `from` -> `to` only if nobody changed the state in between.
    /// The connection task goes through here so it can never overwrite the
    /// `Closed` written by `close()`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_closed_by_owner(&self) -> bool {
        self.closed_by_owner.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_discarded: self.messages_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable, non-blocking handle for pushing frames at the transport.
///
/// Safe to call from the audio thread: it never awaits and never blocks.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<AudioFrame>,
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Queue one frame for sending. Returns false if the frame was dropped
    /// (connection not open, or the outbound queue is full).
    ///
    /// The frame moves into the queue as is; the connection task does the
    /// wire serialization.
    pub fn send(&self, frame: AudioFrame) -> bool {
        if self.shared.state() != ConnectionState::Open {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl FrameDispatcher for FrameSender {
    fn dispatch(&mut self, frame: AudioFrame) {
        self.send(frame);
    }
}

/// The single consumer of inbound messages.
///
/// Yields nothing once the transport has been closed, even if messages
/// were still queued.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<ServerMessage>,
    shared: Arc<Shared>,
}

impl MessageReceiver {
    /// Next message in arrival order; `None` once the transport is closed.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        let msg = self.rx.recv().await?;
        if self.shared.is_closed_by_owner() {
            self.rx.close();
            return None;
        }
        Some(msg)
    }
}

/// Owner of the one connection for a recording session
pub struct Transport {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    frames: FrameSender,
    frame_rx: Option<mpsc::Receiver<AudioFrame>>,
    incoming_tx: Option<mpsc::Sender<ServerMessage>>,
    incoming_rx: Option<MessageReceiver>,
    cancel: CancellationToken,
    task: Option<JoinHandle<ChannelEnds>>,
}

impl Transport {
    pub fn new(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(Shared::new());
        let (frame_tx, frame_rx) = mpsc::channel(config.outbound_queue_frames.max(1));
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        Self {
            frames: FrameSender {
                tx: frame_tx,
                shared: shared.clone(),
            },
            incoming_rx: Some(MessageReceiver {
                rx: incoming_rx,
                shared: shared.clone(),
            }),
            frame_rx: Some(frame_rx),
            incoming_tx: Some(incoming_tx),
            config,
            connector,
            shared,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Establish the connection.
    ///
    /// Resolves once the link is open; fails if it never opens. Calling it
    /// again while connected (or reconnecting) is a no-op. Once reconnection
    /// has given up it dials again.
    pub async fn connect(&mut self) -> Result<(), StreamingError> {
        if self.shared.is_closed_by_owner() {
            return Err(StreamingError::Closed);
        }
        if self.task.is_some() && self.shared.state() != ConnectionState::Closed {
            log::debug!("Transport: connect() while already connected, ignoring");
            return Ok(());
        }
        if let Some(task) = self.task.take() {
            // The task only sets Closed right before returning the channels
            let ends = task.await.map_err(|e| {
                self.shared.set_state(ConnectionState::Closed);
                StreamingError::Disconnected(format!("connection task failed: {}", e))
            })?;
            self.frame_rx = Some(ends.frame_rx);
            self.incoming_tx = Some(ends.incoming_tx);
            log::info!("Transport: restarting after reconnection gave up");
        }

        self.shared.set_state(ConnectionState::Connecting);
        let link = match self.connector.connect(&self.config.url).await {
            Ok(link) => link,
            Err(e) => {
                self.shared.set_state(ConnectionState::Closed);
                log::warn!("Transport: connection to {} failed: {}", self.config.url, e);
                return Err(e);
            }
        };

        let (Some(frame_rx), Some(incoming_tx)) = (self.frame_rx.take(), self.incoming_tx.take())
        else {
            self.shared.set_state(ConnectionState::Closed);
            return Err(StreamingError::Closed);
        };

        self.shared.set_state(ConnectionState::Open);
        log::info!("Transport: open ({})", self.config.url);

        let task = ConnectionTask {
            url: self.config.url.clone(),
            connector: self.connector.clone(),
            policy: ReconnectPolicy::new(
                self.config.max_reconnect_attempts,
                self.config.reconnect_interval,
            ),
            shared: self.shared.clone(),
            frame_rx,
            incoming_tx,
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(task.run(link)));
        Ok(())
    }

    /// Non-blocking send; the frame is dropped unless the connection is open.
    pub fn send(&self, frame: AudioFrame) -> bool {
        self.frames.send(frame)
    }

    /// Handle for the capture side
    pub fn frame_sender(&self) -> FrameSender {
        self.frames.clone()
    }

    /// Register the single inbound consumer.
    ///
    /// Returns `None` if the receiver was already taken.
    pub fn take_incoming_receiver(&mut self) -> Option<MessageReceiver> {
        self.incoming_rx.take()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Tear down the connection. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.shared.closed_by_owner.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("Transport: closing");
        self.shared.set_state(ConnectionState::Closed);
        self.cancel.cancel();
        self.frame_rx = None;
        self.incoming_tx = None;

        if let Some(mut task) = self.task.take() {
            if timeout(CLOSE_GRACE, &mut task).await.is_err() {
                log::warn!("Transport: connection task did not exit in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shared.closed_by_owner.store(true, Ordering::Release);
        self.shared.set_state(ConnectionState::Closed);
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Channels the connection task hands back when it exits
struct ChannelEnds {
    frame_rx: mpsc::Receiver<AudioFrame>,
    incoming_tx: mpsc::Sender<ServerMessage>,
}

/// Why the pump loop returned
enum PumpExit {
    Cancelled,
    Closed(String),
}

/// Owns the link and everything that runs on it
struct ConnectionTask {
    url: String,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
    frame_rx: mpsc::Receiver<AudioFrame>,
    incoming_tx: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    async fn run(mut self, mut link: Link) -> ChannelEnds {
        loop {
            match self.pump(&mut link).await {
                PumpExit::Cancelled => {
                    let _ = timeout(Duration::from_millis(500), link.outbound.close()).await;
                    log::debug!("Transport: connection task exiting (closed by owner)");
                    return self.into_ends();
                }
                PumpExit::Closed(reason) => {
                    log::warn!("Transport: connection lost: {}", reason);
                }
            }

            let closed_at = Instant::now();
            self.shared
                .transition(ConnectionState::Open, ConnectionState::Connecting);
            drop(link);
            self.drop_stale_frames();

            match self.reconnect(closed_at).await {
                Some(new_link) => link = new_link,
                None => {
                    self.shared
                        .transition(ConnectionState::Connecting, ConnectionState::Closed);
                    return self.into_ends();
                }
            }
        }
    }

    fn into_ends(self) -> ChannelEnds {
        ChannelEnds {
            frame_rx: self.frame_rx,
            incoming_tx: self.incoming_tx,
        }
    }

    /// Move frames out and messages in until the link ends or we are cancelled
    async fn pump(&mut self, link: &mut Link) -> PumpExit {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return PumpExit::Cancelled,

                frame = self.frame_rx.recv() => {
                    let Some(frame) = frame else {
                        return PumpExit::Cancelled;
                    };
                    let payload = frame_payload(&frame);
                    if let Err(e) = link.outbound.send(Message::Binary(payload)).await {
                        return PumpExit::Closed(e.to_string());
                    }
                    let sent = self.shared.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;
                    if sent % 100 == 0 {
                        log::debug!("Transport: sent {} frames", sent);
                    }
                }

                inbound = link.inbound.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !self.dispatch(&text).await {
                            return PumpExit::Cancelled;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("server closed ({})", u16::from(f.code)))
                            .unwrap_or_else(|| "server closed".to_string());
                        return PumpExit::Closed(reason);
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                    Some(Err(e)) => return PumpExit::Closed(e.to_string()),
                    None => return PumpExit::Closed("stream ended".to_string()),
                },
            }
        }
    }

    /// Decode and forward one text message. Returns false if cancelled
    /// while waiting on the consumer.
    async fn dispatch(&self, text: &str) -> bool {
        let msg = match ServerMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Transport: discarding inbound message: {}", e);
                self.shared.messages_discarded.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        if let ServerMessage::Unknown(kind) = &msg {
            log::debug!("Transport: ignoring message kind {:?}", kind);
            self.shared.messages_discarded.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.incoming_tx.send(msg) => {
                if result.is_ok() {
                    self.shared.messages_dispatched.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.shared.messages_discarded.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
        }
    }

    /// Stale audio has no value after a reconnect
    fn drop_stale_frames(&mut self) {
        let mut dropped = 0u64;
        while self.frame_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            self.shared
                .frames_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            log::debug!("Transport: dropped {} queued frames", dropped);
        }
    }

    async fn reconnect(&mut self, closed_at: Instant) -> Option<Link> {
        let mut last_initiation = closed_at;

        loop {
            let (attempt, delay) = match self.policy.on_unexpected_close() {
                ReconnectDecision::Retry { attempt, delay } => (attempt, delay),
                ReconnectDecision::GiveUp { attempts } => {
                    log::warn!(
                        "Transport: giving up after {} reconnect attempts; frames will be dropped",
                        attempts
                    );
                    return None;
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = sleep_until(last_initiation + delay) => {}
            }

            last_initiation = Instant::now();
            self.shared.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "Transport: reconnect attempt {}/{} to {}",
                attempt,
                self.policy.max_attempts(),
                self.url
            );

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.connector.connect(&self.url) => result,
            };

            match result {
                Ok(link) => {
                    self.policy.on_connected();
                    self.drop_stale_frames();
                    if !self
                        .shared
                        .transition(ConnectionState::Connecting, ConnectionState::Open)
                    {
                        // close() got in after the handshake
                        return None;
                    }
                    log::info!("Transport: reconnected after {} attempt(s)", attempt);
                    return Some(link);
                }
                Err(e) => {
                    log::warn!("Transport: reconnect attempt {} failed: {}", attempt, e);
                }
            }
        }
    }
}
