//! Per-session streaming worker: the frame scheduler.
//!
//! Each session is one self-rescheduling task:
//!
//! ```text
//! Initializing ──► Streaming ──► (EndOfStream | Error | Cancelled) ──► Stopped
//!       │                                                                ▲
//!       └───────────── Error (open failed) ──────────────────────────────┘
//! ```
//!
//! A `Streaming` tick runs, in order: cancellation check, pending
//! reconfiguration (consume-and-apply, non-fatal on rejection), frame
//! read, tile-batch build and fan-out, the one-time first-frame side
//! effect (dispatched, never awaited), then sleep for the suggested
//! presentation delay. Two ticks of one session can never overlap; the
//! next tick only exists once the previous one finished sleeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info, trace, warn};

use crate::decode::DecodeHandle;
use crate::protocol::{Clientbound, TileData};
use crate::session::{
    Inner, SessionCtrl, SessionEvent, SessionId, SessionKey, StopReason, SubscriberSet,
};
use crate::tile::TileGrid;

// ── ResizeMailbox ────────────────────────────────────────────────

/// Single-slot, overwritable reconfiguration request.
///
/// Packed `width << 16 | height`; zero means empty (both axes are
/// validated to be nonzero before they get here). Last writer wins and
/// there is no backlog: an unapplied request is silently replaced.
#[derive(Debug, Default)]
pub struct ResizeMailbox(AtomicU32);

impl ResizeMailbox {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Post a request, replacing any request still pending.
    pub fn request(&self, grid: TileGrid) {
        let packed = (grid.width() as u32) << 16 | grid.height() as u32;
        self.0.store(packed, Ordering::Release);
    }

    /// Atomically consume the pending request, if any.
    pub fn take(&self) -> Option<TileGrid> {
        match self.0.swap(0, Ordering::AcqRel) {
            0 => None,
            packed => TileGrid::new((packed >> 16) as u16, packed as u16).ok(),
        }
    }
}

// ── StreamState ──────────────────────────────────────────────────

/// Lifecycle state of one streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Decode source being opened; no tick has run yet.
    Initializing,
    /// Ticks are running at presentation cadence.
    Streaming,
    /// The decoder reported a clean end of stream.
    EndOfStream,
    /// A terminal decode error; the context is not trusted anymore.
    Error,
    /// Cooperative cancellation observed at a tick boundary.
    Cancelled,
    /// Resources released, session deregistered. Terminal.
    Stopped,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamState::Initializing => "Initializing",
            StreamState::Streaming => "Streaming",
            StreamState::EndOfStream => "EndOfStream",
            StreamState::Error => "Error",
            StreamState::Cancelled => "Cancelled",
            StreamState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

// ── StreamWorker ─────────────────────────────────────────────────

pub(crate) struct StreamWorker {
    id: SessionId,
    key: SessionKey,
    handle: DecodeHandle,
    ctrl: Arc<SessionCtrl>,
    subscribers: SubscriberSet,
    inner: Arc<Inner>,
    state: StreamState,
    first_frame_seen: bool,
}

impl StreamWorker {
    pub(crate) fn new(
        id: SessionId,
        key: SessionKey,
        handle: DecodeHandle,
        ctrl: Arc<SessionCtrl>,
        subscribers: SubscriberSet,
        inner: Arc<Inner>,
    ) -> Self {
        Self {
            id,
            key,
            handle,
            ctrl,
            subscribers,
            inner,
            state: StreamState::Initializing,
            first_frame_seen: false,
        }
    }

    /// Drive the session to completion, then release everything.
    ///
    /// `registered` is fired by the manager once the session entry is
    /// in the registry, so self-deregistration cannot race insertion.
    pub(crate) async fn run(mut self, registered: tokio::sync::oneshot::Receiver<()>) {
        let _ = registered.await;
        self.transition(StreamState::Streaming);

        let reason = self.stream_loop().await;

        // All terminal states converge here: release the decode context
        // exactly once, deregister, report.
        self.transition(StreamState::Stopped);
        let Self {
            id,
            key,
            handle,
            inner,
            ..
        } = self;
        handle.close();
        inner.deregister(&key, id);
        info!(session = %id, key = %key, %reason, "session stopped");
        let _ = inner.events.send(SessionEvent::Stopped { id, key, reason }).await;
    }

    async fn stream_loop(&mut self) -> StopReason {
        loop {
            // (1) Cancellation is observed only at tick boundaries.
            if self.ctrl.is_cancelled() {
                self.transition(StreamState::Cancelled);
                return StopReason::Cancelled;
            }

            // (2) Consume-and-apply any pending reconfiguration.
            // Rejection keeps the old geometry and is not fatal.
            if let Some(grid) = self.ctrl.mailbox.take() {
                match self.handle.resize_output(grid) {
                    Ok(()) => debug!(session = %self.id, %grid, "applied reconfiguration"),
                    Err(e) => {
                        warn!(session = %self.id, error = %e, "reconfiguration rejected");
                    }
                }
            }

            // (3) Advance the decoder.
            match self.handle.read_frame() {
                Ok(true) => {}
                Ok(false) => {
                    self.transition(StreamState::EndOfStream);
                    return StopReason::EndOfStream;
                }
                Err(e) => {
                    self.transition(StreamState::Error);
                    return StopReason::Error(e);
                }
            }

            // (4) Build this frame's tile batch and fan it out.
            let batch = self.build_batch();
            let live = self.subscribers.deliver(&batch);
            trace!(
                session = %self.id,
                tiles = batch.len(),
                viewers = live,
                pts = self.handle.last_pts(),
                "frame delivered",
            );

            // (5) One-time side effect, dispatched without blocking.
            if !self.first_frame_seen {
                self.first_frame_seen = true;
                let event = SessionEvent::FirstFrame {
                    id: self.id,
                    key: self.key.clone(),
                };
                if self.inner.events.try_send(event).is_err() {
                    debug!(session = %self.id, "first-frame event dropped");
                }
            }

            // (6) Self-reschedule at presentation cadence.
            let delay = self.handle.suggest_delay(self.inner.config.minimum_delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One fresh message per tile, derived from the current buffer
    /// partition (re-derived every tick, so a mid-stream resize changes
    /// the batch size before the next frame ships).
    fn build_batch(&self) -> Vec<Clientbound> {
        let start_id = self.inner.config.start_display_id;
        self.handle
            .views()
            .iter()
            .map(|view| Clientbound::TileData(TileData::copy_from(view, start_id)))
            .collect()
    }

    fn transition(&mut self, to: StreamState) {
        trace!(session = %self.id, from = %self.state, %to, "state transition");
        self.state = to;
    }
}

// ── Tests ────────────────────────────────────────────────────────
