//! Framed TCP codec for viewer connections.
//!
//! ## Frame layout
//!
//! ```text
//! varint frame_len      length of everything after this field
//! varint wire_id
//! [u8]   body           frame_len - varint_len(wire_id) bytes
//! ```
//!
//! Outbound messages are encoded through the process-wide dispatch
//! table; sending before the patch is installed surfaces as
//! [`VidmapError::DispatchNotReady`]. Inbound frames are handed to the
//! caller raw, except the patched display wire id, which this side
//! never legitimately receives and therefore fails loudly.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::VidmapError;
use crate::protocol::message::Clientbound;
use crate::protocol::{registry, wire};

/// Upper bound for a single frame; a tile message is ~16 KiB.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// An inbound frame this system does not itself interpret.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub wire_id: i32,
    pub body: Bytes,
}

/// Length-delimited codec speaking the display transport's framing.
#[derive(Debug, Default)]
pub struct DisplayCodec;

impl Encoder<Clientbound> for DisplayCodec {
    type Error = VidmapError;

    fn encode(&mut self, item: Clientbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let table = registry::global()?;

        let mut body = BytesMut::new();
        table.encode(&item, &mut body)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(VidmapError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(wire::MAX_VARINT_LEN + body.len());
        wire::put_varint(dst, body.len() as i32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for DisplayCodec {
    type Item = InboundFrame;
    type Error = VidmapError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Parse the length prefix without consuming on a partial frame.
        let mut peek = &src[..];
        let frame_len = match wire::get_varint(&mut peek) {
            Ok(len) => len,
            // Tolerate an incomplete prefix, reject a corrupt one.
            Err(_) if src.len() < wire::MAX_VARINT_LEN => return Ok(None),
            Err(e) => return Err(e),
        };
        if frame_len < 0 || frame_len as usize > MAX_FRAME_SIZE {
            return Err(VidmapError::FrameTooLarge {
                size: frame_len.max(0) as usize,
                max: MAX_FRAME_SIZE,
            });
        }
        let prefix_len = src.len() - peek.len();
        if src.len() < prefix_len + frame_len as usize {
            src.reserve(prefix_len + frame_len as usize - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let mut body = src.split_to(frame_len as usize).freeze();
        let wire_id = wire::get_varint(&mut body)?;
        registry::check_inbound(wire_id)?;

        Ok(Some(InboundFrame { wire_id, body }))
    }
}

// ── Tests ────────────────────────────────────────────────────────
