//! Domain-specific error types for the vidmap pipeline.
//!
//! All fallible operations return `Result<T, VidmapError>`.
//! No panics on invalid input: every error is typed and recoverable
//! at the boundary that chooses to recover.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the vidmap streaming core.
#[derive(Debug, Error)]
pub enum VidmapError {
    // ── Decode boundary ──────────────────────────────────────────
    /// The foreign decode context could not be allocated. Always fatal
    /// to the attempted session.
    #[error("decode context allocation failed: {0}")]
    ContextAlloc(String),

    /// The decode source could not be opened (missing file, unsupported
    /// codec, foreign-library fault).
    #[error("failed to open decode source: {0}")]
    DecodeOpen(String),

    /// The foreign library surfaced a negative status while reading a
    /// frame. Terminal for the owning session.
    #[error("frame decode failed with status {0}")]
    DecodeRead(i32),

    /// The foreign library rejected a new output geometry.
    #[error("output resize to {width}x{height} rejected: {reason}")]
    Resize {
        width: u16,
        height: u16,
        reason: String,
    },

    // ── Protocol dispatch ────────────────────────────────────────
    /// A message was handed to the send path before the dispatch-table
    /// patch was installed.
    #[error("protocol dispatch table patch not installed")]
    DispatchNotReady,

    /// An inbound frame arrived bearing the patched display wire id.
    /// This direction is never legitimate.
    #[error("unexpected inbound frame with wire id {0:#04x}")]
    UnexpectedInbound(i32),

    /// A message kind has no wire id registered for it.
    #[error("no wire id registered for {0}")]
    Unregistered(&'static str),

    // ── Sessions ─────────────────────────────────────────────────
    /// Two starts raced for the same requester key.
    #[error("session already starting for key {0}")]
    SessionConflict(String),

    /// A session failed to tear down within the graceful-shutdown
    /// budget. Callers must treat this as fatal to the host process.
    #[error("session teardown exceeded budget of {0:?}")]
    TeardownTimeout(Duration),

    // ── Geometry ─────────────────────────────────────────────────
    /// A tile-grid dimension was outside the supported range.
    #[error("invalid tile grid {width}x{height} (each axis must be 1..=100)")]
    InvalidGrid { width: u16, height: u16 },

    // ── Wire / framing ───────────────────────────────────────────
    /// A frame exceeded the codec size limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A varint ran past its maximum width or the buffer end.
    #[error("malformed varint")]
    MalformedVarint,

    /// A tile payload had the wrong length.
    #[error("tile payload of {0} bytes is not exactly one tile")]
    BadTilePayload(usize),

    // ── Connection ───────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for VidmapError {
    fn from(s: String) -> Self {
        VidmapError::Other(s)
    }
}

impl From<&str> for VidmapError {
    fn from(s: &str) -> Self {
        VidmapError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VidmapError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VidmapError::ChannelClosed
    }
}
