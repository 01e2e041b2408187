//! Integration tests: transport + session + capture over an in-memory link
//!
//! Everything runs against `LoopbackConnector`, so no server or microphone
//! is needed:
//! ```bash
//! cargo test --test session_streaming
//! ```

use std::sync::Arc;
use std::time::Duration;

use monkeyread_lib::audio::{quantize, AudioError, CapturePipeline, FrameConsumer};
use monkeyread_lib::effects::{ActiveCapture, AudioEffectRunner, CaptureSource, EffectRunner};
use monkeyread_lib::session::{Mark, MarkPatch, ReadingSession, SessionSnapshot};
use monkeyread_lib::spawn_session_consumer;
use monkeyread_lib::state_machine::{Effect, Event};
use monkeyread_lib::streaming::{
    decode_frame_payload, ConnectionState, LoopbackConnector, LoopbackServer, Message,
    ServerMessage, Transport, TransportConfig,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> TransportConfig {
    TransportConfig {
        url: "ws://loopback/ws".to_string(),
        reconnect_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn passage(words: &[&str]) -> ServerMessage {
    ServerMessage::PassageDetails {
        passage: words.iter().map(|w| w.to_string()).collect(),
        marks: vec![Mark::Unread; words.len()],
    }
}

fn patch(start: i64, end: i64, marks: Vec<Mark>) -> ServerMessage {
    ServerMessage::MarkingDetails(MarkPatch::new(start, end, marks))
}

async fn wait_for_snapshot(
    rx: &mut watch::Receiver<SessionSnapshot>,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    timeout(WAIT, async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if pred(&*snap) {
                    return snap.clone();
                }
            }
            rx.changed().await.expect("session alive");
        }
    })
    .await
    .expect("snapshot condition not reached")
}

async fn next_server(servers: &mut mpsc::UnboundedReceiver<LoopbackServer>) -> LoopbackServer {
    timeout(WAIT, servers.recv())
        .await
        .expect("no connection attempt")
        .expect("connector dropped")
}

async fn next_binary(server: &mut LoopbackServer) -> Vec<u8> {
    loop {
        match timeout(WAIT, server.recv()).await.expect("no frame").expect("link closed") {
            Message::Binary(bytes) => return bytes,
            _ => continue,
        }
    }
}

// ============================================================================
// Session over the transport
// ============================================================================

#[tokio::test]
async fn reading_session_follows_server_updates() {
    let (connector, mut servers) = LoopbackConnector::new();
    let mut transport = Transport::new(config(), connector);
    let incoming = transport.take_incoming_receiver().unwrap();
    assert!(transport.take_incoming_receiver().is_none());

    let session = ReadingSession::new();
    let mut snapshots = session.subscribe();
    let consumer = spawn_session_consumer(session, incoming);

    transport.connect().await.unwrap();
    let server = next_server(&mut servers).await;

    server.send_message(&passage(&["the", "cat", "sat"]));
    let snap = wait_for_snapshot(&mut snapshots, |s| s.ready).await;
    assert_eq!(snap.marks, vec![Mark::Unread; 3]);

    server.send_message(&patch(
        0,
        1,
        vec![Mark::CorrectlyRead, Mark::IncorrectlyRead],
    ));
    let snap = wait_for_snapshot(&mut snapshots, |s| s.marks[0] != Mark::Unread).await;
    assert_eq!(
        snap.marks,
        vec![Mark::CorrectlyRead, Mark::IncorrectlyRead, Mark::Unread]
    );

    // Noise the session must survive: garbage, unknown kind, empty patch,
    // out-of-range patch, a second passage
    server.send_text("{not json");
    server.send_text(r#"{"ws_msg_type":"heartbeat","content":{}}"#);
    server.send_message(&patch(2, 1, vec![]));
    server.send_message(&patch(1, 5, vec![Mark::CorrectlyRead; 5]));
    server.send_message(&passage(&["a", "different", "text"]));

    server.send_message(&patch(1, 2, vec![Mark::CorrectlyRead, Mark::CorrectlyRead]));
    let snap = wait_for_snapshot(&mut snapshots, |s| s.marks[2] != Mark::Unread).await;
    assert_eq!(&snap.words[..], ["the", "cat", "sat"]);
    assert_eq!(snap.marks, vec![Mark::CorrectlyRead; 3]);

    let progress = snap.progress();
    assert_eq!(progress.correct, 3);
    assert_eq!(progress.last_marked, Some(2));

    let stats = transport.stats();
    assert_eq!(stats.messages_discarded, 2);

    transport.close().await;
    let session = timeout(WAIT, consumer).await.unwrap().unwrap();
    assert_eq!(session.passage().map(|p| p.len()), Some(3));
}

#[tokio::test]
async fn session_survives_reconnect() {
    let (connector, mut servers) = LoopbackConnector::new();
    let mut transport = Transport::new(config(), connector);
    let incoming = transport.take_incoming_receiver().unwrap();
    let session = ReadingSession::new();
    let mut snapshots = session.subscribe();
    let _consumer = spawn_session_consumer(session, incoming);

    transport.connect().await.unwrap();
    let first = next_server(&mut servers).await;
    first.send_message(&passage(&["one", "two"]));
    first.send_message(&patch(0, 0, vec![Mark::CorrectlyRead]));
    wait_for_snapshot(&mut snapshots, |s| s.ready && s.marks[0] == Mark::CorrectlyRead).await;

    // Server drops the link; the transport dials again on its own
    first.close();
    let second = next_server(&mut servers).await;
    second.send_message(&patch(1, 1, vec![Mark::IncorrectlyRead]));

    let snap = wait_for_snapshot(&mut snapshots, |s| s.marks[1] != Mark::Unread).await;
    assert_eq!(snap.marks, vec![Mark::CorrectlyRead, Mark::IncorrectlyRead]);
    assert_eq!(transport.stats().reconnect_attempts, 1);
    assert_eq!(transport.state(), ConnectionState::Open);

    transport.close().await;
}

// ============================================================================
// Capture into the transport
// ============================================================================

#[tokio::test]
async fn captured_audio_arrives_as_pcm16_frames() {
    let (connector, mut servers) = LoopbackConnector::new();
    let mut transport = Transport::new(config(), connector);
    transport.connect().await.unwrap();
    let mut server = next_server(&mut servers).await;

    let mut pipeline = CapturePipeline::new(1024, transport.frame_sender());
    for chunk in vec![0.5_f32; 2600].chunks(128) {
        pipeline.push(chunk);
    }
    assert_eq!(pipeline.pending(), 552);

    for _ in 0..2 {
        let bytes = next_binary(&mut server).await;
        assert_eq!(bytes.len(), 2048);
        let samples = decode_frame_payload(&bytes);
        assert!(samples.iter().all(|&s| s == quantize(0.5)));
    }
    assert_eq!(transport.stats().frames_sent, 2);

    transport.close().await;
}

#[tokio::test]
async fn frames_before_connect_are_dropped() {
    let (connector, mut servers) = LoopbackConnector::new();
    let mut transport = Transport::new(config(), connector);

    let mut pipeline = CapturePipeline::new(256, transport.frame_sender());
    pipeline.push(&[0.1_f32; 512]);
    assert_eq!(transport.stats().frames_dropped, 2);

    transport.connect().await.unwrap();
    let mut server = next_server(&mut servers).await;
    pipeline.push(&[0.1_f32; 256]);

    let bytes = next_binary(&mut server).await;
    assert_eq!(bytes.len(), 512);
    assert!(server.try_recv().is_none());

    transport.close().await;
}

/// Pushes one second of a constant tone, then idles until stopped.
struct Tone;

struct ToneCapture;

impl ActiveCapture for ToneCapture {
    fn stop(self: Box<Self>) -> Result<(), AudioError> {
        Ok(())
    }
}

impl CaptureSource for Tone {
    fn start(
        &self,
        mut consumer: Box<dyn FrameConsumer>,
    ) -> Result<Box<dyn ActiveCapture>, AudioError> {
        for chunk in vec![-0.25_f32; 16000].chunks(160) {
            consumer.push(chunk);
        }
        Ok(Box::new(ToneCapture))
    }
}

#[tokio::test]
async fn effect_runner_streams_through_transport() {
    let (connector, mut servers) = LoopbackConnector::new();
    let mut transport = Transport::new(
        TransportConfig {
            outbound_queue_frames: 64,
            ..config()
        },
        connector,
    );
    transport.connect().await.unwrap();
    let mut server = next_server(&mut servers).await;

    let runner = AudioEffectRunner::new(Arc::new(Tone), transport.frame_sender(), 1024);
    let (tx, mut rx) = mpsc::channel(8);
    let id = uuid::Uuid::new_v4();
    runner.spawn(Effect::StartAudio { id }, tx);
    assert!(matches!(
        timeout(WAIT, rx.recv()).await.unwrap(),
        Some(Event::AudioStartOk { .. })
    ));

    // 16000 samples / 1024 = 15 whole frames
    for _ in 0..15 {
        let bytes = next_binary(&mut server).await;
        assert_eq!(decode_frame_payload(&bytes)[0], quantize(-0.25));
    }
    assert_eq!(transport.stats().frames_sent, 15);

    transport.close().await;
}
