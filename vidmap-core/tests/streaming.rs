//! Integration tests — full session lifecycle, live reconfiguration,
//! cancellation, replacement, and fan-out to framed TCP viewers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use vidmap_core::decode::{DecodeBackend, Timebase};
use vidmap_core::protocol::registry;
use vidmap_core::{
    Clientbound, SessionConfig, SessionEvent, SessionKey, SessionManager, StopReason,
    SubscriberSet, TILE_BYTES, TileGrid, VidmapError, ViewerConnection,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Backend driven by a prerecorded PTS script. Fills the output buffer
/// with the 1-based frame number so tests can identify frames.
#[derive(Default)]
struct ScriptedBackend {
    timebase: Timebase,
    frames: Vec<i64>,
    cursor: usize,
    /// Fail the read at this frame index with a decode error.
    fail_at: Option<usize>,
    /// Incremented when the foreign context is released.
    freed: Option<Arc<AtomicUsize>>,
    /// Shared lifecycle log for ordering assertions.
    log: Option<(Arc<Mutex<Vec<String>>>, &'static str)>,
}

impl ScriptedBackend {
    fn boxed(timebase: Timebase, frames: Vec<i64>) -> Box<Self> {
        Box::new(Self {
            timebase,
            frames,
            ..Self::default()
        })
    }

    fn push_log(&self, what: &str) {
        if let Some((log, name)) = &self.log {
            log.lock().unwrap().push(format!("{name} {what}"));
        }
    }
}

impl DecodeBackend for ScriptedBackend {
    fn open(&mut self, _source: &Path) -> Result<Timebase, VidmapError> {
        self.push_log("opened");
        Ok(self.timebase)
    }

    fn read_frame(&mut self, output: &mut [u8]) -> Result<Option<i64>, VidmapError> {
        if self.fail_at == Some(self.cursor) {
            return Err(VidmapError::DecodeRead(-1));
        }
        match self.frames.get(self.cursor) {
            Some(&pts) => {
                self.cursor += 1;
                output.fill(self.cursor as u8);
                Ok(Some(pts))
            }
            None => Ok(None),
        }
    }

    fn resize(&mut self, _grid: TileGrid, _output: &mut [u8]) -> Result<(), VidmapError> {
        Ok(())
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.push_log("closed");
        if let Some(freed) = &self.freed {
            freed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn grid(w: u16, h: u16) -> TileGrid {
    TileGrid::new(w, h).unwrap()
}

fn sink() -> (mpsc::Sender<Clientbound>, mpsc::Receiver<Clientbound>) {
    mpsc::channel(4096)
}

/// Drain a subscriber channel to completion (the sender drops when the
/// session stops).
async fn drain(mut rx: mpsc::Receiver<Clientbound>) -> Vec<Clientbound> {
    let mut out = Vec::new();
    while let Some(msg) = rx.recv().await {
        out.push(msg);
    }
    out
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event channel closed")
}

fn tile_ids(messages: &[Clientbound]) -> Vec<i32> {
    messages
        .iter()
        .map(|msg| match msg {
            Clientbound::TileData(tile) => tile.display_id(),
            other => panic!("expected TileData, got {other:?}"),
        })
        .collect()
}

// ── Streaming lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn broadcast_session_streams_every_frame_to_every_subscriber() {
    let (manager, mut events) = SessionManager::new(SessionConfig::default());
    let (tx_a, rx_a) = sink();
    let (tx_b, rx_b) = sink();

    let key = SessionKey::Broadcast("all".into());
    manager
        .start(
            key.clone(),
            ScriptedBackend::boxed(0.001, vec![0, 33, 67]),
            grid(2, 2),
            Path::new("clip.mkv"),
            SubscriberSet::broadcast(vec![tx_a, tx_b]),
        )
        .await
        .unwrap();

    match next_event(&mut events).await {
        SessionEvent::FirstFrame { key: k, .. } => assert_eq!(k, key),
        other => panic!("expected FirstFrame, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::Stopped { reason, .. } => {
            assert!(matches!(reason, StopReason::EndOfStream));
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
    assert!(!manager.is_active(&key));

    // 3 frames × 4 tiles for both subscribers, ids cycling 0..=3.
    for rx in [rx_a, rx_b] {
        let messages = drain(rx).await;
        assert_eq!(messages.len(), 12);
        let ids = tile_ids(&messages);
        assert_eq!(&ids[..4], &[0, 1, 2, 3]);
        assert_eq!(&ids[8..], &[0, 1, 2, 3]);
    }
}

#[tokio::test]
async fn tile_payloads_carry_the_partitioned_frame() {
    let (manager, _events) = SessionManager::new(SessionConfig::default());
    let (tx, rx) = sink();

    manager
        .start(
            SessionKey::Viewer(1),
            ScriptedBackend::boxed(0.001, vec![0]),
            grid(1, 2),
            Path::new("clip.mkv"),
            SubscriberSet::single(tx),
        )
        .await
        .unwrap();

    let messages = drain(rx).await;
    assert_eq!(messages.len(), 2);
    for msg in &messages {
        let Clientbound::TileData(tile) = msg else {
            panic!("expected TileData");
        };
        assert_eq!(tile.data().len(), TILE_BYTES);
        // First frame fills with 1.
        assert!(tile.data().iter().all(|&b| b == 1));
    }
}

// ── Live reconfiguration ─────────────────────────────────────────

#[tokio::test]
async fn resize_applies_before_the_next_batch() {
    let (manager, mut events) = SessionManager::new(SessionConfig::default());
    let (tx, mut rx) = sink();

    let key = SessionKey::Viewer(7);
    manager
        .start(
            key.clone(),
            // Generous spacing so the resize request lands between
            // ticks, not after the stream already ended.
            ScriptedBackend::boxed(0.001, vec![0, 250, 500]),
            grid(4, 4),
            Path::new("clip.mkv"),
            SubscriberSet::single(tx),
        )
        .await
        .unwrap();

    // First frame: the full 4×4 batch.
    let mut first = Vec::new();
    for _ in 0..16 {
        first.push(rx.recv().await.expect("first batch"));
    }
    assert_eq!(tile_ids(&first).len(), 16);

    // Request (4,4) → (2,2) mid-stream; every later batch is 4 tiles.
    assert!(manager.request_resize(&key, grid(2, 2)));

    let rest = drain(rx).await;
    assert_eq!(rest.len(), 8, "two more frames of 4 tiles each");
    let ids = tile_ids(&rest);
    assert!(ids.iter().all(|&id| (0..4).contains(&id)));

    match next_event(&mut events).await {
        SessionEvent::FirstFrame { .. } => {}
        other => panic!("expected FirstFrame, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::Stopped { reason, .. } => {
            assert!(matches!(reason, StopReason::EndOfStream));
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
}

#[tokio::test]
async fn resize_for_unknown_key_is_reported() {
    let (manager, _events) = SessionManager::new(SessionConfig::default());
    assert!(!manager.request_resize(&SessionKey::Viewer(99), grid(2, 2)));
}

// ── Cancellation ─────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_takes_effect_at_the_next_tick_boundary() {
    let (manager, mut events) = SessionManager::new(SessionConfig::default());
    let (tx, mut rx) = sink();

    let key = SessionKey::Viewer(3);
    let frames: Vec<i64> = (0..1000).map(|i| i * 50).collect();
    manager
        .start(
            key.clone(),
            ScriptedBackend::boxed(0.001, frames),
            grid(2, 2),
            Path::new("clip.mkv"),
            SubscriberSet::single(tx),
        )
        .await
        .unwrap();

    // Let at least one full batch through, then cancel.
    for _ in 0..4 {
        rx.recv().await.expect("first batch");
    }
    assert!(manager.stop(&key).await.unwrap());
    assert!(!manager.is_active(&key));

    // In-flight sends are never interrupted: whatever arrived is a
    // whole number of 4-tile batches.
    let rest = drain(rx).await;
    assert_eq!(rest.len() % 4, 0, "no partial batch after cancellation");

    match next_event(&mut events).await {
        SessionEvent::FirstFrame { .. } => {}
        other => panic!("expected FirstFrame, got {other:?}"),
    }
    match next_event(&mut events).await {
        SessionEvent::Stopped { reason, .. } => {
            assert!(matches!(reason, StopReason::Cancelled));
        }
        other => panic!("expected Stopped, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_for_unknown_key_reports_not_found() {
    let (manager, _events) = SessionManager::new(SessionConfig::default());
    assert!(!manager.stop(&SessionKey::Viewer(42)).await.unwrap());
}

// ── Replacement ──────────────────────────────────────────────────

#[tokio::test]
async fn replacement_closes_the_old_context_before_opening_the_new() {
    let (manager, _events) = SessionManager::new(SessionConfig::default());
    let key = SessionKey::Broadcast("theatre".into());
    let log = Arc::new(Mutex::new(Vec::new()));
    let freed_a = Arc::new(AtomicUsize::new(0));

    let mut backend_a = ScriptedBackend::boxed(0.001, (0..1000).map(|i| i * 50).collect());
    backend_a.freed = Some(freed_a.clone());
    backend_a.log = Some((log.clone(), "A"));

    let (tx_a, _rx_a) = sink();
    manager
        .start(
            key.clone(),
            backend_a,
            grid(1, 1),
            Path::new("first.mkv"),
            SubscriberSet::single(tx_a),
        )
        .await
        .unwrap();

    let mut backend_b = ScriptedBackend::boxed(0.001, vec![0]);
    backend_b.log = Some((log.clone(), "B"));

    let (tx_b, rx_b) = sink();
    manager
        .start(
            key.clone(),
            backend_b,
            grid(1, 1),
            Path::new("second.mkv"),
            SubscriberSet::single(tx_b),
        )
        .await
        .unwrap();

    // A's context was released exactly once, strictly before B opened.
    assert_eq!(freed_a.load(Ordering::SeqCst), 1);
    let order = log.lock().unwrap().clone();
    let a_closed = order.iter().position(|e| e == "A closed").unwrap();
    let b_opened = order.iter().position(|e| e == "B opened").unwrap();
    assert!(a_closed < b_opened, "teardown must precede replacement: {order:?}");

    // B streams normally.
    assert_eq!(drain(rx_b).await.len(), 1);
    assert_eq!(freed_a.load(Ordering::SeqCst), 1, "no double close");
}

// ── Failure isolation ────────────────────────────────────────────

#[tokio::test]
async fn decode_error_terminates_only_its_own_session() {
    let (manager, mut events) = SessionManager::new(SessionConfig::default());

    let mut failing = ScriptedBackend::boxed(0.001, vec![0, 40, 80]);
    failing.fail_at = Some(1);
    let (tx_bad, rx_bad) = sink();
    let bad_key = SessionKey::Viewer(1);
    manager
        .start(
            bad_key.clone(),
            failing,
            grid(1, 1),
            Path::new("broken.mkv"),
            SubscriberSet::single(tx_bad),
        )
        .await
        .unwrap();

    let (tx_ok, rx_ok) = sink();
    let ok_key = SessionKey::Viewer(2);
    manager
        .start(
            ok_key.clone(),
            ScriptedBackend::boxed(0.001, vec![0, 30, 60]),
            grid(1, 1),
            Path::new("fine.mkv"),
            SubscriberSet::single(tx_ok),
        )
        .await
        .unwrap();

    // The failing session got one frame out, then died on the second.
    assert_eq!(drain(rx_bad).await.len(), 1);
    // Its sibling is unaffected.
    assert_eq!(drain(rx_ok).await.len(), 3);

    let mut reasons = Vec::new();
    for _ in 0..4 {
        match next_event(&mut events).await {
            SessionEvent::Stopped { key, reason, .. } => reasons.push((key, reason)),
            SessionEvent::FirstFrame { .. } => {}
        }
    }
    for (key, reason) in reasons {
        if key == bad_key {
            assert!(matches!(reason, StopReason::Error(VidmapError::DecodeRead(-1))));
        } else {
            assert_eq!(key, ok_key);
            assert!(matches!(reason, StopReason::EndOfStream));
        }
    }
}

// ── Fan-out over real TCP ────────────────────────────────────────

/// Read one `[varint len][varint id][body]` frame off a raw client
/// socket.
async fn read_wire_frame(stream: &mut TcpStream) -> (i32, Vec<u8>) {
    async fn read_varint(stream: &mut TcpStream) -> (i32, usize) {
        let mut value: u32 = 0;
        for shift in 0..5 {
            let byte = stream.read_u8().await.expect("read varint byte");
            value |= ((byte & 0x7F) as u32) << (shift * 7);
            if byte & 0x80 == 0 {
                return (value as i32, shift + 1);
            }
        }
        panic!("malformed varint from server");
    }

    let (len, _) = read_varint(stream).await;
    let (wire_id, id_len) = read_varint(stream).await;
    let mut body = vec![0u8; len as usize - id_len];
    stream.read_exact(&mut body).await.expect("read frame body");
    (wire_id, body)
}

#[tokio::test]
async fn tiles_reach_every_viewer_over_tcp() {
    registry::install();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client_a = TcpStream::connect(addr).await.unwrap();
    let (server_a, _) = listener.accept().await.unwrap();
    let mut client_b = TcpStream::connect(addr).await.unwrap();
    let (server_b, _) = listener.accept().await.unwrap();

    let viewer_a = ViewerConnection::new(server_a);
    let viewer_b = ViewerConnection::new(server_b);

    let (manager, _events) = SessionManager::new(SessionConfig::default());
    manager
        .start(
            SessionKey::Broadcast("tcp".into()),
            ScriptedBackend::boxed(0.001, vec![0]),
            grid(1, 1),
            Path::new("clip.mkv"),
            SubscriberSet::broadcast(vec![viewer_a.sender(), viewer_b.sender()]),
        )
        .await
        .unwrap();

    for client in [&mut client_a, &mut client_b] {
        // Skip keep-alives until the tile frame arrives.
        let body = loop {
            let (wire_id, body) = read_wire_frame(client).await;
            if wire_id == registry::DISPLAY_UPDATE_ID {
                break body;
            }
            assert_eq!(wire_id, registry::KEEP_ALIVE_ID);
        };

        // Compact layout: display id 0, constant header, full payload.
        assert_eq!(body[0], 0); // varint display id
        assert_eq!(&body[1..8], &[0, 0, 0, 128, 128, 0, 0]);
        // varint 16384 == [0x80, 0x80, 0x01]
        assert_eq!(&body[8..11], &[0x80, 0x80, 0x01]);
        assert_eq!(body.len(), 11 + TILE_BYTES);
        assert!(body[11..].iter().all(|&b| b == 1));
    }

    drop(viewer_a);
    drop(viewer_b);
}
