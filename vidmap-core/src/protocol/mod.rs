//! Display transport protocol: message types, dispatch tables, codec.
//!
//! | Module     | Purpose                                            |
//! |------------|----------------------------------------------------|
//! | `wire`     | Varint / string / bool primitives                  |
//! | `message`  | Clientbound message types and their encodings      |
//! | `registry` | Kind→id / id→encoder tables and the tile patch     |
//! | `codec`    | Length-delimited framing for `tokio_util::codec`   |
//!
//! The tile patch ([`registry::install`]) must run once at startup,
//! before the first send; see the registry module docs for the exact
//! procedure and its compatibility argument.

pub mod codec;
pub mod message;
pub mod registry;
pub mod wire;

pub use codec::{DisplayCodec, InboundFrame, MAX_FRAME_SIZE};
pub use message::{
    AssetAnnounce, Clientbound, DisplayMarker, DisplayPatch, DisplayUpdate, KeepAlive, MessageKind,
    TileData,
};
pub use registry::DispatchTable;
