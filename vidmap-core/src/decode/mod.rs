//! Foreign decode-library boundary.
//!
//! The video/audio decoding engine is an external collaborator: this
//! module specifies only its contract. [`DecodeBackend`] is the
//! open/read-frame/resize/free surface the pipeline drives; the library's
//! codecs, demuxing, and resampling stay opaque behind it.
//!
//! | Module   | Purpose                                               |
//! |----------|-------------------------------------------------------|
//! | `handle` | Owning handle: buffer, timing anchor, single close    |
//! | `libav`  | Native libav backend (feature `libav`)                |
//!
//! The backend is trusted regarding buffer layout once opened and
//! untrusted regarding negative-status failures, which surface as typed
//! errors.

use std::path::Path;

use crate::error::VidmapError;
use crate::tile::TileGrid;

pub mod handle;
#[cfg(feature = "libav")]
pub mod libav;

pub use handle::DecodeHandle;

/// Stream timebase: seconds per presentation-timestamp unit, reported
/// once at stream open.
pub type Timebase = f64;

/// The foreign decode-library contract.
///
/// Constructing a backend allocates the foreign context with its output
/// geometry fixed; dropping it releases the context. Implementations
/// write decoded frames tile-major into the buffer the caller provides
/// (tile `i` at byte offset `i * TILE_BYTES`).
pub trait DecodeBackend: Send {
    /// Open the input source. Returns the stream timebase on success.
    fn open(&mut self, source: &Path) -> Result<Timebase, VidmapError>;

    /// Decode the next frame into `output`.
    ///
    /// Returns `Some(pts)` when a frame was produced, `None` at clean
    /// end-of-stream. Any negative foreign status surfaces as
    /// [`VidmapError::DecodeRead`].
    fn read_frame(&mut self, output: &mut [u8]) -> Result<Option<i64>, VidmapError>;

    /// Renegotiate the output geometry with the foreign library.
    ///
    /// `output` is the already-reallocated buffer for the new grid.
    fn resize(&mut self, grid: TileGrid, output: &mut [u8]) -> Result<(), VidmapError>;
}

/// Extract the companion audio track of `source` into `dest`.
///
/// Used by the host to build the audio asset bundle served over the
/// external side-channel. Returns `false` when the source carries no
/// audio stream.
#[cfg(feature = "libav")]
pub fn extract_audio(source: &Path, dest: &Path) -> Result<bool, VidmapError> {
    libav::extract_audio(source, dest)
}
