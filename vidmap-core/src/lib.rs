//! # vidmap-core
//!
//! Core library for streaming decoded video onto a grid of fixed-size
//! display tiles over a real-time wire protocol.
//!
//! This crate contains:
//! - **Decode**: `DecodeBackend` boundary and the owning `DecodeHandle`
//!   (timing anchor, buffer, single close)
//! - **Tiles**: fixed 128×128 geometry and the zero-copy partitioner
//! - **Protocol**: clientbound messages, the dispatch-table tile patch,
//!   and the `DisplayCodec` framing for `tokio_util`
//! - **Network**: managed viewer connections with background I/O tasks
//! - **Session**: the frame-scheduler worker and the session/fan-out
//!   manager with bounded teardown
//! - **Asset**: the companion audio-bundle announcement
//! - **Error**: `VidmapError`, the typed `thiserror`-based error hierarchy
//!
//! ```text
//! DecodeHandle ──► partition ──► TileData batch ──► dispatch table ──► viewers
//!        ▲                                                               │
//!        └────────────── StreamWorker tick (per session) ◄───────────────┘
//! ```

pub mod asset;
pub mod decode;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod tile;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use asset::AudioBundle;
pub use decode::{DecodeBackend, DecodeHandle, Timebase};
pub use error::VidmapError;
pub use network::{ViewerConnection, ViewerSender};
pub use protocol::{Clientbound, DisplayCodec, DisplayUpdate, TileData};
pub use session::{
    SessionConfig, SessionEvent, SessionId, SessionKey, SessionManager, StopReason, StreamState,
    SubscriberSet,
};
pub use tile::{TILE_BYTES, TILE_HEIGHT, TILE_WIDTH, TileGrid, TileView};
