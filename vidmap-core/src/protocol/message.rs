//! Clientbound message types and their wire encodings.
//!
//! The stock protocol (what unmodified clients speak) carries
//! [`KeepAlive`], [`AssetAnnounce`], and [`DisplayUpdate`], the legacy
//! display message with scale/lock/marker fields and an optional patch
//! rectangle. [`TileData`] is the injected variant: it reuses
//! `DisplayUpdate`'s wire id (see [`registry`](crate::protocol::registry))
//! and always encodes one full 128×128 tile with constant flags:
//!
//! ```text
//! varint display_id
//! u8     scale      = 0      (unscaled)
//! bool   locked     = false
//! bool   markers    = false
//! u8     width      = 128
//! u8     height     = 128
//! u8     origin_x   = 0
//! u8     origin_y   = 0
//! varint payload_len = 16384
//! [u8; 16384] payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::VidmapError;
use crate::protocol::wire;
use crate::tile::{TILE_BYTES, TILE_HEIGHT, TILE_WIDTH, TileView};

// ── MessageKind ──────────────────────────────────────────────────

/// Runtime classification used by the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    KeepAlive,
    AssetAnnounce,
    DisplayUpdate,
    /// The injected tile-payload variant.
    TileData,
}

impl MessageKind {
    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::KeepAlive => "KeepAlive",
            MessageKind::AssetAnnounce => "AssetAnnounce",
            MessageKind::DisplayUpdate => "DisplayUpdate",
            MessageKind::TileData => "TileData",
        }
    }
}

// ── Clientbound ──────────────────────────────────────────────────

/// Any message the server can put on the wire.
#[derive(Debug, Clone)]
pub enum Clientbound {
    KeepAlive(KeepAlive),
    AssetAnnounce(AssetAnnounce),
    DisplayUpdate(DisplayUpdate),
    TileData(TileData),
}

impl Clientbound {
    pub fn kind(&self) -> MessageKind {
        match self {
            Clientbound::KeepAlive(_) => MessageKind::KeepAlive,
            Clientbound::AssetAnnounce(_) => MessageKind::AssetAnnounce,
            Clientbound::DisplayUpdate(_) => MessageKind::DisplayUpdate,
            Clientbound::TileData(_) => MessageKind::TileData,
        }
    }
}

// ── KeepAlive ────────────────────────────────────────────────────

/// Periodic liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub id: u64,
}

impl KeepAlive {
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.id);
    }
}

// ── AssetAnnounce ────────────────────────────────────────────────

/// Tells viewers a companion asset bundle is ready to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetAnnounce {
    /// Where the bundle is served (external side-channel).
    pub url: String,
    /// Content hash viewers use to decide whether to re-fetch.
    pub hash: String,
    /// Whether the client must accept the bundle to keep playing.
    pub required: bool,
}

impl AssetAnnounce {
    pub fn encode(&self, dst: &mut BytesMut) {
        wire::put_string(dst, &self.url);
        wire::put_string(dst, &self.hash);
        wire::put_bool(dst, self.required);
    }
}

// ── DisplayUpdate ────────────────────────────────────────────────

/// A tracked marker on a legacy display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMarker {
    pub kind: u8,
    pub x: i8,
    pub y: i8,
    pub rotation: u8,
}

/// Partial bitmap update for a legacy display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayPatch {
    pub width: u8,
    pub height: u8,
    pub origin_x: u8,
    pub origin_y: u8,
    pub data: Bytes,
}

/// The stock display-update message, exactly as unmodified clients
/// already decode it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayUpdate {
    pub display_id: i32,
    pub scale: u8,
    pub locked: bool,
    pub markers: Option<Vec<DisplayMarker>>,
    pub patch: Option<DisplayPatch>,
}

impl DisplayUpdate {
    pub fn encode(&self, dst: &mut BytesMut) {
        wire::put_varint(dst, self.display_id);
        dst.put_u8(self.scale);
        wire::put_bool(dst, self.locked);
        wire::put_bool(dst, self.markers.is_some());
        if let Some(markers) = &self.markers {
            wire::put_varint(dst, markers.len() as i32);
            for marker in markers {
                wire::put_varint(dst, marker.kind as i32);
                dst.put_i8(marker.x);
                dst.put_i8(marker.y);
                dst.put_u8(marker.rotation);
            }
        }
        match &self.patch {
            Some(patch) => {
                dst.put_u8(patch.width);
                dst.put_u8(patch.height);
                dst.put_u8(patch.origin_x);
                dst.put_u8(patch.origin_y);
                wire::put_varint(dst, patch.data.len() as i32);
                dst.put_slice(&patch.data);
            }
            // Width 0 means "no bitmap attached" to a stock decoder.
            None => dst.put_u8(0),
        }
    }
}

// ── TileData ─────────────────────────────────────────────────────

/// The injected per-tile message: one full 128×128 bitmap refresh with
/// constant flags. Built fresh each scheduling tick, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileData {
    display_id: i32,
    data: Bytes,
}

impl TileData {
    /// Wrap an owned payload; the length must be exactly one tile.
    pub fn new(display_id: i32, data: Bytes) -> Result<Self, VidmapError> {
        if data.len() != TILE_BYTES {
            return Err(VidmapError::BadTilePayload(data.len()));
        }
        Ok(Self { display_id, data })
    }

    /// Copy a partitioned view into an owned message.
    pub fn copy_from(view: &TileView<'_>, start_id: i32) -> Self {
        Self {
            display_id: view.display_id(start_id),
            data: Bytes::copy_from_slice(view.data()),
        }
    }

    pub fn display_id(&self) -> i32 {
        self.display_id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The compact fixed-layout encoding (module docs above).
    pub fn encode(&self, dst: &mut BytesMut) {
        wire::put_varint(dst, self.display_id);
        dst.put_u8(0); // scale
        wire::put_bool(dst, false); // locked
        wire::put_bool(dst, false); // markers present
        dst.put_u8(TILE_WIDTH as u8);
        dst.put_u8(TILE_HEIGHT as u8);
        dst.put_u8(0); // origin x
        dst.put_u8(0); // origin y
        wire::put_varint(dst, self.data.len() as i32);
        dst.put_slice(&self.data);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use crate::protocol::wire::get_varint;

    #[test]
    fn tile_payload_length_is_enforced() {
        assert!(TileData::new(0, Bytes::from(vec![0u8; TILE_BYTES])).is_ok());
        let err = TileData::new(0, Bytes::from(vec![0u8; 16]));
        assert!(matches!(err, Err(VidmapError::BadTilePayload(16))));
    }

    #[test]
    fn tile_encoding_layout() {
        let payload = Bytes::from(vec![0x5Au8; TILE_BYTES]);
        let msg = TileData::new(300, payload).unwrap();
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);

        let mut cursor = buf.freeze();
        assert_eq!(get_varint(&mut cursor).unwrap(), 300);
        assert_eq!(cursor.get_u8(), 0); // scale
        assert_eq!(cursor.get_u8(), 0); // locked
        assert_eq!(cursor.get_u8(), 0); // markers
        assert_eq!(cursor.get_u8(), 128); // width
        assert_eq!(cursor.get_u8(), 128); // height
        assert_eq!(cursor.get_u8(), 0); // origin x
        assert_eq!(cursor.get_u8(), 0); // origin y
        assert_eq!(get_varint(&mut cursor).unwrap(), TILE_BYTES as i32);
        assert_eq!(cursor.len(), TILE_BYTES);
        assert!(cursor.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn display_update_without_patch_writes_zero_width() {
        let msg = DisplayUpdate {
            display_id: 7,
            scale: 2,
            locked: true,
            markers: None,
            patch: None,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(&buf[..], &[7, 2, 1, 0, 0]);
    }

    #[test]
    fn display_update_with_patch_and_markers() {
        let msg = DisplayUpdate {
            display_id: 1,
            scale: 0,
            locked: false,
            markers: Some(vec![DisplayMarker {
                kind: 4,
                x: -2,
                y: 3,
                rotation: 8,
            }]),
            patch: Some(DisplayPatch {
                width: 2,
                height: 1,
                origin_x: 10,
                origin_y: 20,
                data: Bytes::from_static(&[0xAA, 0xBB]),
            }),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(
            &buf[..],
            &[
                1, 0, 0, 1, // id, scale, locked, markers present
                1, 4, 0xFE, 3, 8, // marker count + one marker
                2, 1, 10, 20, // patch w/h/x/y
                2, 0xAA, 0xBB, // payload len + bytes
            ]
        );
    }
}
