//! Session lifecycle and fan-out management.
//!
//! Maps a requester key to at most one live streaming session. Starting
//! a session over a key that already has one first cancels and fully
//! tears down the old session; two decode contexts must never be alive
//! for the same key. Delivery is a snapshot of subscriber sinks taken
//! at session start: a single viewer and a broadcast group are the same
//! capability with different snapshot sizes.
//!
//! Teardown is cooperative and bounded: callers wait up to the
//! graceful-shutdown budget and must treat
//! [`VidmapError::TeardownTimeout`] as fatal to the host process, since
//! a stuck native context cannot be reclaimed safely.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::decode::{DecodeBackend, DecodeHandle};
use crate::error::VidmapError;
use crate::network::ViewerSender;
use crate::protocol::Clientbound;
use crate::tile::TileGrid;

pub mod worker;

pub use worker::{ResizeMailbox, StreamState};

use worker::StreamWorker;

// ── Keys and ids ─────────────────────────────────────────────────

/// Requester identity a session is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// One viewer connection.
    Viewer(u64),
    /// A named broadcast group.
    Broadcast(String),
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKey::Viewer(id) => write!(f, "viewer:{id}"),
            SessionKey::Broadcast(group) => write!(f, "broadcast:{group}"),
        }
    }
}

/// Monotonic id of one session instance (keys are reused, ids are not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Subscriber fan-out ───────────────────────────────────────────

/// Snapshot of transport sinks a session pushes frames to.
///
/// The set is fixed at session start (a broadcast group is not
/// re-evaluated mid-stream); sinks whose viewer disconnected are
/// dropped from the snapshot on first failed delivery and never pin
/// the session.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    sinks: Vec<ViewerSender>,
}

impl SubscriberSet {
    /// Single-subscriber delivery, tied to one connection.
    pub fn single(sink: ViewerSender) -> Self {
        Self { sinks: vec![sink] }
    }

    /// Broadcast delivery over a snapshot of sinks.
    pub fn broadcast(sinks: Vec<ViewerSender>) -> Self {
        Self { sinks }
    }

    /// Number of live sinks in the snapshot.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Best-effort delivery of one frame batch to every sink.
    ///
    /// A full queue drops the remainder of this frame for that sink
    /// (the next tick supersedes it); a closed sink is removed from
    /// the snapshot. Returns the number of sinks still live.
    pub(crate) fn deliver(&mut self, batch: &[Clientbound]) -> usize {
        use mpsc::error::TrySendError;

        self.sinks.retain(|sink| {
            for msg in batch {
                match sink.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("viewer queue full; dropping rest of frame");
                        break;
                    }
                    Err(TrySendError::Closed(_)) => return false,
                }
            }
            true
        });
        self.sinks.len()
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Why a session stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The decoder reported a clean end of stream.
    EndOfStream,
    /// Cancellation was requested and observed at a tick boundary.
    Cancelled,
    /// A terminal decode or resize-read failure.
    Error(VidmapError),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfStream => f.write_str("end of stream"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Notifications emitted by running sessions.
#[derive(Debug)]
pub enum SessionEvent {
    /// First frame of a session was delivered. Fired exactly once per
    /// session, asynchronously to the tick that produced the frame;
    /// hosts hook companion side effects (audio cue start) here.
    FirstFrame { id: SessionId, key: SessionKey },
    /// The session released its resources and left the registry.
    Stopped {
        id: SessionId,
        key: SessionKey,
        reason: StopReason,
    },
}

// ── Configuration ────────────────────────────────────────────────

/// Tuning knobs shared by every session of one manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Floor below which a presentation delay clamps to zero.
    pub minimum_delay: Duration,
    /// Graceful-shutdown budget for cancel-and-wait teardown.
    pub teardown_budget: Duration,
    /// Display id assigned to tile index 0.
    pub start_display_id: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            minimum_delay: Duration::from_millis(3),
            teardown_budget: Duration::from_secs(5),
            start_display_id: 0,
        }
    }
}

// ── Control block ────────────────────────────────────────────────

/// Shared control surface between the manager and one worker.
#[derive(Debug, Default)]
pub(crate) struct SessionCtrl {
    cancelled: AtomicBool,
    pub(crate) mailbox: ResizeMailbox,
}

impl SessionCtrl {
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct SessionEntry {
    id: SessionId,
    ctrl: Arc<SessionCtrl>,
    join: JoinHandle<()>,
}

pub(crate) struct Inner {
    sessions: Mutex<HashMap<SessionKey, SessionEntry>>,
    pub(crate) events: mpsc::Sender<SessionEvent>,
    pub(crate) config: SessionConfig,
    next_id: AtomicU64,
}

impl Inner {
    /// Remove the registry entry if it still belongs to session `id`.
    /// Called by workers on their way out; a replacement session under
    /// the same key must not be evicted.
    pub(crate) fn deregister(&self, key: &SessionKey, id: SessionId) {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        if sessions.get(key).is_some_and(|entry| entry.id == id) {
            sessions.remove(key);
        }
    }
}

// ── SessionManager ───────────────────────────────────────────────

/// Registry of live sessions plus their lifecycle operations.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Queue depth for session events; FirstFrame dispatches must not
/// block a tick, so the channel is buffered generously.
const EVENT_QUEUE: usize = 64;

impl SessionManager {
    /// Create a manager and the receiving end of its event stream.
    pub fn new(config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let manager = Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                events,
                config,
                next_id: AtomicU64::new(1),
            }),
        };
        (manager, events_rx)
    }

    /// Start streaming `source` to `subscribers` under `key`.
    ///
    /// Any session already registered for the key is cancelled and
    /// fully torn down (old decode context closed) before the new
    /// context is opened. Open/alloc failures abort before anything is
    /// registered. Two racing starts for one key: the loser gets
    /// [`VidmapError::SessionConflict`].
    pub async fn start(
        &self,
        key: SessionKey,
        backend: Box<dyn DecodeBackend>,
        grid: TileGrid,
        source: &Path,
        subscribers: SubscriberSet,
    ) -> Result<SessionId, VidmapError> {
        // Displace the previous holder of this key, waiting out its
        // teardown so the two contexts never coexist.
        let displaced = self.take_entry(&key);
        if let Some(entry) = displaced {
            debug!(key = %key, old = %entry.id, "displacing existing session");
            entry.ctrl.cancel();
            self.await_teardown(entry.join).await?;
        }

        // `Initializing`: context was allocated by the backend
        // constructor; open the input now.
        let handle = DecodeHandle::open(backend, grid, source)?;

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let ctrl = Arc::new(SessionCtrl::default());
        let (registered_tx, registered_rx) = oneshot::channel();
        let worker = StreamWorker::new(
            id,
            key.clone(),
            handle,
            ctrl.clone(),
            subscribers,
            self.inner.clone(),
        );
        let join = tokio::spawn(worker.run(registered_rx));

        {
            let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
            match sessions.entry(key.clone()) {
                MapEntry::Occupied(_) => {
                    // A concurrent start won the key while we were
                    // opening; cancel our worker (it closes the fresh
                    // context on its first tick) and report the race.
                    drop(sessions);
                    ctrl.cancel();
                    let _ = registered_tx.send(());
                    return Err(VidmapError::SessionConflict(key.to_string()));
                }
                MapEntry::Vacant(slot) => {
                    slot.insert(SessionEntry { id, ctrl, join });
                }
            }
        }
        let _ = registered_tx.send(());

        info!(session = %id, key = %key, %grid, source = %source.display(), "session started");
        Ok(id)
    }

    /// Post a tile-grid reconfiguration for the key's session.
    ///
    /// Applied atomically at the session's next tick; an unapplied
    /// earlier request is overwritten. Returns `false` when no session
    /// is registered for the key.
    pub fn request_resize(&self, key: &SessionKey, grid: TileGrid) -> bool {
        let sessions = self.inner.sessions.lock().expect("session registry poisoned");
        match sessions.get(key) {
            Some(entry) => {
                entry.ctrl.mailbox.request(grid);
                true
            }
            None => false,
        }
    }

    /// Cancel the key's session and wait for its teardown.
    ///
    /// Returns `Ok(false)` when no session is registered for the key.
    pub async fn stop(&self, key: &SessionKey) -> Result<bool, VidmapError> {
        match self.take_entry(key) {
            None => Ok(false),
            Some(entry) => {
                entry.ctrl.cancel();
                self.await_teardown(entry.join).await?;
                Ok(true)
            }
        }
    }

    /// Whether a session is currently registered for the key.
    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .contains_key(key)
    }

    /// Keys of all currently registered sessions.
    pub fn active_keys(&self) -> Vec<SessionKey> {
        self.inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Cancel every session and wait for each teardown in turn.
    pub async fn shutdown_all(&self) -> Result<(), VidmapError> {
        let entries: Vec<SessionEntry> = {
            let mut sessions = self.inner.sessions.lock().expect("session registry poisoned");
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.ctrl.cancel();
        }
        for entry in entries {
            self.await_teardown(entry.join).await?;
        }
        Ok(())
    }

    fn take_entry(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.inner
            .sessions
            .lock()
            .expect("session registry poisoned")
            .remove(key)
    }

    async fn await_teardown(&self, join: JoinHandle<()>) -> Result<(), VidmapError> {
        let budget = self.inner.config.teardown_budget;
        match tokio::time::timeout(budget, join).await {
            Err(_) => Err(VidmapError::TeardownTimeout(budget)),
            Ok(Err(e)) => Err(VidmapError::Other(format!("session task failed: {e}"))),
            Ok(Ok(())) => Ok(()),
        }
    }
}
