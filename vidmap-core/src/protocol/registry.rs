//! Clientbound dispatch table and the tile-message patch.
//!
//! The transport keeps two lookup structures: message kind → numeric
//! wire id, and wire id → encoder. [`DispatchTable::stock`] builds the
//! tables an unmodified peer expects. The patch makes the injected
//! [`TileData`] kind wire-compatible without renumbering anything:
//!
//! 1. register `TileData` under the clientbound classification;
//! 2. alias it to the *identical* wire id as `DisplayUpdate`;
//! 3. swap that id's encoder for a proxy that picks the compact tile
//!    encoding for `TileData` values and delegates every other value
//!    unchanged to the stock encoder.
//!
//! The process-wide table is installed once, before any session exists,
//! and is read-only afterwards (single writer, then many readers).
//! Sending before installation is a programming error surfaced as
//! [`VidmapError::DispatchNotReady`]; inbound frames bearing the shared
//! wire id fail loudly, since this side never legitimately receives
//! them.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::BytesMut;

use crate::error::VidmapError;
use crate::protocol::message::{Clientbound, MessageKind};
use crate::protocol::wire;

// ── Wire ids (clientbound) ───────────────────────────────────────

pub const KEEP_ALIVE_ID: i32 = 0x26;
pub const DISPLAY_UPDATE_ID: i32 = 0x2D;
pub const ASSET_ANNOUNCE_ID: i32 = 0x46;

// ── DispatchTable ────────────────────────────────────────────────

type EncodeFn = fn(&Clientbound, &mut BytesMut) -> Result<(), VidmapError>;

struct Slot {
    kind: MessageKind,
    encode: EncodeFn,
}

/// Kind → id and id → encoder lookup for one protocol direction
/// (outbound/clientbound only).
pub struct DispatchTable {
    to_id: HashMap<MessageKind, i32>,
    by_id: Vec<Option<Slot>>,
    patched: bool,
}

impl DispatchTable {
    /// The tables an unmodified client already agrees on.
    pub fn stock() -> Self {
        let mut table = Self {
            to_id: HashMap::new(),
            by_id: Vec::new(),
            patched: false,
        };
        table.register(MessageKind::KeepAlive, KEEP_ALIVE_ID, encode_keep_alive);
        table.register(
            MessageKind::DisplayUpdate,
            DISPLAY_UPDATE_ID,
            encode_display_update,
        );
        table.register(
            MessageKind::AssetAnnounce,
            ASSET_ANNOUNCE_ID,
            encode_asset_announce,
        );
        table
    }

    fn register(&mut self, kind: MessageKind, id: i32, encode: EncodeFn) {
        self.to_id.insert(kind, id);
        let index = id as usize;
        if self.by_id.len() <= index {
            self.by_id.resize_with(index + 1, || None);
        }
        self.by_id[index] = Some(Slot { kind, encode });
    }

    /// Install the tile patch. Idempotent: a second application leaves
    /// the table exactly as the first did.
    pub fn apply_tile_patch(&mut self) {
        if self.patched {
            return;
        }
        // Step 1+2: same classification, identical wire id as the
        // legacy display-update message.
        let id = self.to_id[&MessageKind::DisplayUpdate];
        self.to_id.insert(MessageKind::TileData, id);
        // Step 3: proxy encoder dispatching on the runtime kind.
        self.by_id[id as usize]
            .as_mut()
            .expect("display slot registered in stock()")
            .encode = encode_display_or_tile;
        self.patched = true;
    }

    /// Whether the tile patch has been applied to this table.
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// The wire id `kind` is registered under.
    pub fn wire_id(&self, kind: MessageKind) -> Result<i32, VidmapError> {
        self.to_id
            .get(&kind)
            .copied()
            .ok_or(VidmapError::Unregistered(kind.name()))
    }

    /// Encode `[varint wire_id][body]` into `dst`.
    pub fn encode(&self, msg: &Clientbound, dst: &mut BytesMut) -> Result<(), VidmapError> {
        let id = self.wire_id(msg.kind())?;
        let slot = self.by_id[id as usize]
            .as_ref()
            .ok_or(VidmapError::Unregistered(msg.kind().name()))?;
        wire::put_varint(dst, id);
        (slot.encode)(msg, dst)
    }

}

/// Guard for the inbound path: the shared display id must never arrive
/// from a peer, patched or not.
pub fn check_inbound(wire_id: i32) -> Result<(), VidmapError> {
    if wire_id == DISPLAY_UPDATE_ID {
        return Err(VidmapError::UnexpectedInbound(wire_id));
    }
    Ok(())
}

// ── Encoder slots ────────────────────────────────────────────────

fn encode_keep_alive(msg: &Clientbound, dst: &mut BytesMut) -> Result<(), VidmapError> {
    match msg {
        Clientbound::KeepAlive(m) => {
            m.encode(dst);
            Ok(())
        }
        other => Err(mismatch(MessageKind::KeepAlive, other)),
    }
}

fn encode_asset_announce(msg: &Clientbound, dst: &mut BytesMut) -> Result<(), VidmapError> {
    match msg {
        Clientbound::AssetAnnounce(m) => {
            m.encode(dst);
            Ok(())
        }
        other => Err(mismatch(MessageKind::AssetAnnounce, other)),
    }
}

/// The original display codec; stays the delegate after patching.
fn encode_display_update(msg: &Clientbound, dst: &mut BytesMut) -> Result<(), VidmapError> {
    match msg {
        Clientbound::DisplayUpdate(m) => {
            m.encode(dst);
            Ok(())
        }
        other => Err(mismatch(MessageKind::DisplayUpdate, other)),
    }
}

/// Proxy installed by the patch: compact encoding for tile values,
/// unchanged delegation for everything else on this id.
fn encode_display_or_tile(msg: &Clientbound, dst: &mut BytesMut) -> Result<(), VidmapError> {
    match msg {
        Clientbound::TileData(m) => {
            m.encode(dst);
            Ok(())
        }
        other => encode_display_update(other, dst),
    }
}

fn mismatch(slot: MessageKind, got: &Clientbound) -> VidmapError {
    VidmapError::Other(format!(
        "{} dispatched to the {} encoder",
        got.kind().name(),
        slot.name(),
    ))
}

// ── Process-wide installation ────────────────────────────────────

static GLOBAL: OnceLock<DispatchTable> = OnceLock::new();

/// Install the patched table process-wide. Must run during startup,
/// before any message is sent. Idempotent.
pub fn install() -> &'static DispatchTable {
    GLOBAL.get_or_init(|| {
        let mut table = DispatchTable::stock();
        table.apply_tile_patch();
        table
    })
}

/// The installed table, or [`VidmapError::DispatchNotReady`] when a
/// send path runs before startup installed the patch.
pub fn global() -> Result<&'static DispatchTable, VidmapError> {
    GLOBAL.get().ok_or(VidmapError::DispatchNotReady)
}

// ── Tests ────────────────────────────────────────────────────────
