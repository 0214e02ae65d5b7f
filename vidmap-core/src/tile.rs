//! Tile geometry and the decode-buffer partitioner.
//!
//! The display transport addresses small square bitmaps ("tiles") by
//! numeric id. A decoded frame occupies one contiguous buffer laid out
//! tile-major: tile `i` owns bytes `[i * TILE_BYTES, (i + 1) * TILE_BYTES)`.
//! [`partition`] slices that buffer into non-owning views without copying;
//! the borrow ties every view to the buffer generation that produced it,
//! so views cannot survive a resize reallocation.

use serde::{Deserialize, Serialize};

use crate::error::VidmapError;

// ── Constants ────────────────────────────────────────────────────

/// Tile width in pixels.
pub const TILE_WIDTH: usize = 128;
/// Tile height in pixels.
pub const TILE_HEIGHT: usize = 128;
/// Bytes per tile (one byte per pixel).
pub const TILE_BYTES: usize = TILE_WIDTH * TILE_HEIGHT;

/// Largest supported grid axis (matches the host command surface).
pub const MAX_GRID_AXIS: u16 = 100;

// ── TileGrid ─────────────────────────────────────────────────────

/// Output geometry in tile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    width: u16,
    height: u16,
}

impl TileGrid {
    /// Validated constructor; each axis must be `1..=100`.
    pub fn new(width: u16, height: u16) -> Result<Self, VidmapError> {
        if width == 0 || height == 0 || width > MAX_GRID_AXIS || height > MAX_GRID_AXIS {
            return Err(VidmapError::InvalidGrid { width, height });
        }
        Ok(Self { width, height })
    }

    /// Grid width in tiles.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Grid height in tiles.
    pub fn height(&self) -> u16 {
        self.height
    }

    /// Number of tiles (and messages per frame).
    pub fn tile_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of the decode buffer for this grid.
    pub fn buffer_len(&self) -> usize {
        self.tile_count() * TILE_BYTES
    }
}

impl std::fmt::Display for TileGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ── TileView ─────────────────────────────────────────────────────

/// A non-owning view of one tile inside a decode buffer.
///
/// Valid only for the buffer generation it was derived from; resizing
/// the output discards all outstanding views (enforced by the borrow).
#[derive(Debug, Clone, Copy)]
pub struct TileView<'a> {
    index: usize,
    data: &'a [u8],
}

impl<'a> TileView<'a> {
    /// Zero-based tile index in row-major grid order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of this tile inside the decode buffer.
    pub fn offset(&self) -> usize {
        self.index * TILE_BYTES
    }

    /// The display-unit id this tile is addressed to.
    pub fn display_id(&self, start_id: i32) -> i32 {
        start_id + self.index as i32
    }

    /// The tile's pixel bytes (exactly [`TILE_BYTES`]).
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

// ── Partitioner ──────────────────────────────────────────────────

/// Slice `buffer` into exactly `count` fixed-length, non-overlapping,
/// contiguous tile views in index order.
///
/// The buffer must be exactly `count * TILE_BYTES` long; the decode
/// handle maintains that invariant across resizes.
pub fn partition(buffer: &[u8], count: usize) -> Vec<TileView<'_>> {
    debug_assert_eq!(buffer.len(), count * TILE_BYTES);
    buffer
        .chunks_exact(TILE_BYTES)
        .take(count)
        .enumerate()
        .map(|(index, data)| TileView { index, data })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_validation() {
        assert!(TileGrid::new(1, 1).is_ok());
        assert!(TileGrid::new(100, 100).is_ok());
        assert!(TileGrid::new(0, 4).is_err());
        assert!(TileGrid::new(4, 0).is_err());
        assert!(TileGrid::new(101, 1).is_err());
    }

    #[test]
    fn partition_covers_buffer_without_gaps() {
        for (w, h) in [(1u16, 1u16), (2, 3), (4, 4), (7, 1)] {
            let grid = TileGrid::new(w, h).unwrap();
            let buffer = vec![0u8; grid.buffer_len()];
            let views = partition(&buffer, grid.tile_count());

            assert_eq!(views.len(), grid.tile_count());
            for (i, view) in views.iter().enumerate() {
                assert_eq!(view.index(), i);
                assert_eq!(view.offset(), i * TILE_BYTES);
                assert_eq!(view.data().len(), TILE_BYTES);
            }
            // Contiguous coverage: the last view ends at the buffer end.
            let last = views.last().unwrap();
            assert_eq!(last.offset() + TILE_BYTES, buffer.len());
        }
    }

    #[test]
    fn views_see_their_own_bytes() {
        let grid = TileGrid::new(2, 2).unwrap();
        let mut buffer = vec![0u8; grid.buffer_len()];
        for i in 0..grid.tile_count() {
            buffer[i * TILE_BYTES..(i + 1) * TILE_BYTES].fill(i as u8);
        }

        let views = partition(&buffer, grid.tile_count());
        for view in &views {
            assert!(view.data().iter().all(|&b| b == view.index() as u8));
        }
    }

    #[test]
    fn display_ids_offset_from_start() {
        let buffer = vec![0u8; 3 * TILE_BYTES];
        let views = partition(&buffer, 3);
        assert_eq!(views[0].display_id(0), 0);
        assert_eq!(views[2].display_id(0), 2);
        assert_eq!(views[2].display_id(10), 12);
    }
}
