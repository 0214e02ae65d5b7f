//! Native decode backend over libav (FFmpeg).
//!
//! Decodes the source video frame-by-frame, scales each frame to the
//! grid's pixel dimensions, maps RGB through the display palette LUT,
//! and packs the result tile-major into the caller's buffer.
//!
//! # Feature
//!
//! This module is compiled only with the `libav` feature and requires
//! the system FFmpeg libraries. All foreign-library interaction is
//! confined to this module; the rest of the pipeline sees only
//! [`DecodeBackend`].

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::media::Type;
use ffmpeg::software::scaling;
use ffmpeg::{codec, decoder, format, frame};

use crate::decode::{DecodeBackend, Timebase};
use crate::error::VidmapError;
use crate::tile::{TILE_HEIGHT, TILE_WIDTH, TileGrid};

// ── Global initialization ────────────────────────────────────────

/// RGB555 → display-palette lookup table (32768 entries, one byte each).
static PALETTE_LUT: OnceLock<Vec<u8>> = OnceLock::new();

const LUT_LEN: usize = 1 << 15;

/// One-time global initializer for the foreign library.
///
/// Registers libav and loads the palette lookup table from `lut_path`.
/// Idempotent; subsequent calls are no-ops.
pub fn init_native(lut_path: &Path) -> Result<(), VidmapError> {
    if PALETTE_LUT.get().is_some() {
        return Ok(());
    }

    ffmpeg::init().map_err(|e| VidmapError::Other(format!("libav init failed: {e}")))?;

    let lut = fs::read(lut_path)?;
    if lut.len() != LUT_LEN {
        return Err(VidmapError::Other(format!(
            "palette LUT {} has {} bytes (expected {LUT_LEN})",
            lut_path.display(),
            lut.len(),
        )));
    }
    let _ = PALETTE_LUT.set(lut);
    Ok(())
}

fn lut() -> Result<&'static [u8], VidmapError> {
    PALETTE_LUT
        .get()
        .map(Vec::as_slice)
        .ok_or_else(|| VidmapError::ContextAlloc("native library not initialized".into()))
}

// ── LibavBackend ─────────────────────────────────────────────────

/// Decode context backed by libav.
pub struct LibavBackend {
    ictx: Option<format::context::Input>,
    video: Option<decoder::Video>,
    scaler: Option<scaling::Context>,
    rgb: frame::Video,
    stream_index: usize,
    grid: TileGrid,
    eof_sent: bool,
}

impl LibavBackend {
    /// Allocate the decode context for `grid`.
    ///
    /// Output geometry is fixed at construction (until a resize); the
    /// scaled-frame buffer is allocated here so allocation failure
    /// surfaces before any open attempt.
    pub fn create(grid: TileGrid) -> Result<Box<Self>, VidmapError> {
        lut()?;
        let (w, h) = pixel_dims(grid);
        let rgb = frame::Video::new(Pixel::RGB24, w, h);

        Ok(Box::new(Self {
            ictx: None,
            video: None,
            scaler: None,
            rgb,
            stream_index: 0,
            grid,
            eof_sent: false,
        }))
    }

    /// Scale the decoded frame and pack it tile-major into `output`.
    fn pack_frame(&mut self, decoded: &frame::Video, output: &mut [u8]) -> Result<(), VidmapError> {
        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| VidmapError::Other("scaler missing before first frame".into()))?;
        scaler
            .run(decoded, &mut self.rgb)
            .map_err(|e| VidmapError::DecodeRead(e.into()))?;

        let lut = lut()?;
        let (w, h) = pixel_dims(self.grid);
        let grid_w = self.grid.width() as usize;
        let stride = self.rgb.stride(0);
        let data = self.rgb.data(0);

        for y in 0..h as usize {
            let row = &data[y * stride..y * stride + w as usize * 3];
            let tile_row = (y / TILE_HEIGHT) * grid_w;
            let y_in_tile = y % TILE_HEIGHT;
            for x in 0..w as usize {
                let r = row[x * 3] as usize;
                let g = row[x * 3 + 1] as usize;
                let b = row[x * 3 + 2] as usize;
                let index = (r >> 3) << 10 | (g >> 3) << 5 | (b >> 3);
                let tile = tile_row + x / TILE_WIDTH;
                let offset =
                    tile * TILE_WIDTH * TILE_HEIGHT + y_in_tile * TILE_WIDTH + x % TILE_WIDTH;
                output[offset] = lut[index];
            }
        }
        Ok(())
    }

    fn build_scaler(&mut self, grid: TileGrid) -> Result<scaling::Context, VidmapError> {
        let video = self
            .video
            .as_ref()
            .ok_or_else(|| VidmapError::Other("decoder missing".into()))?;
        let (w, h) = pixel_dims(grid);
        scaling::Context::get(
            video.format(),
            video.width(),
            video.height(),
            Pixel::RGB24,
            w,
            h,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| VidmapError::Resize {
            width: grid.width(),
            height: grid.height(),
            reason: e.to_string(),
        })
    }
}

impl DecodeBackend for LibavBackend {
    fn open(&mut self, source: &Path) -> Result<Timebase, VidmapError> {
        let ictx = format::input(&source).map_err(|e| VidmapError::DecodeOpen(e.to_string()))?;

        let stream = ictx
            .streams()
            .best(Type::Video)
            .ok_or_else(|| VidmapError::DecodeOpen("no video stream".into()))?;
        self.stream_index = stream.index();

        let timebase = {
            let tb = stream.time_base();
            tb.numerator() as f64 / tb.denominator() as f64
        };

        let context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(|e| VidmapError::DecodeOpen(e.to_string()))?;
        let video = context
            .decoder()
            .video()
            .map_err(|e| VidmapError::DecodeOpen(e.to_string()))?;

        self.ictx = Some(ictx);
        self.video = Some(video);
        self.scaler = Some(self.build_scaler(self.grid).map_err(|e| match e {
            VidmapError::Resize { reason, .. } => VidmapError::DecodeOpen(reason),
            other => other,
        })?);
        Ok(timebase)
    }

    fn read_frame(&mut self, output: &mut [u8]) -> Result<Option<i64>, VidmapError> {
        enum Step {
            Frame(i64),
            Eof,
            NeedInput,
        }
        fn not_open() -> VidmapError {
            VidmapError::Other("read_frame before open".into())
        }

        let mut decoded = frame::Video::empty();

        loop {
            let step = {
                let video = self.video.as_mut().ok_or_else(not_open)?;
                match video.receive_frame(&mut decoded) {
                    Ok(()) => Step::Frame(decoded.pts().unwrap_or(0)),
                    Err(ffmpeg::Error::Eof) => Step::Eof,
                    Err(ffmpeg::Error::Other {
                        errno: ffmpeg::util::error::EAGAIN,
                    }) => Step::NeedInput,
                    Err(e) => return Err(VidmapError::DecodeRead(e.into())),
                }
            };
            match step {
                Step::Frame(pts) => {
                    self.pack_frame(&decoded, output)?;
                    return Ok(Some(pts));
                }
                Step::Eof => return Ok(None),
                Step::NeedInput => {}
            }

            if self.eof_sent {
                return Ok(None);
            }

            // Feed the next packet for our stream (or signal EOF). The
            // packet is detached from the iterator before the decoder
            // is borrowed again.
            let packet = {
                let ictx = self.ictx.as_mut().ok_or_else(not_open)?;
                ictx.packets()
                    .find(|(stream, _)| stream.index() == self.stream_index)
                    .map(|(_, packet)| packet)
            };
            let video = self.video.as_mut().ok_or_else(not_open)?;
            match packet {
                Some(packet) => video
                    .send_packet(&packet)
                    .map_err(|e| VidmapError::DecodeRead(e.into()))?,
                None => {
                    video
                        .send_eof()
                        .map_err(|e| VidmapError::DecodeRead(e.into()))?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn resize(&mut self, grid: TileGrid, _output: &mut [u8]) -> Result<(), VidmapError> {
        let (w, h) = pixel_dims(grid);
        let scaler = self.build_scaler(grid)?;
        self.rgb = frame::Video::new(Pixel::RGB24, w, h);
        self.scaler = Some(scaler);
        self.grid = grid;
        Ok(())
    }
}

fn pixel_dims(grid: TileGrid) -> (u32, u32) {
    (
        grid.width() as u32 * TILE_WIDTH as u32,
        grid.height() as u32 * TILE_HEIGHT as u32,
    )
}

// ── Audio extraction ─────────────────────────────────────────────

/// Remux the best audio stream of `source` into `dest` (container
/// chosen from the destination extension). Returns `false` when the
/// source has no audio stream. The packaged file feeds the external
/// asset-bundle side channel.
pub fn extract_audio(source: &Path, dest: &Path) -> Result<bool, VidmapError> {
    let mut ictx = format::input(&source).map_err(|e| VidmapError::DecodeOpen(e.to_string()))?;

    let Some(stream) = ictx.streams().best(Type::Audio) else {
        return Ok(false);
    };
    let in_index = stream.index();
    let in_tb = stream.time_base();

    let mut octx = format::output(&dest).map_err(|e| VidmapError::Other(e.to_string()))?;
    let mut ost = octx
        .add_stream(ffmpeg::encoder::find(codec::Id::None))
        .map_err(|e| VidmapError::Other(e.to_string()))?;
    ost.set_parameters(stream.parameters());

    octx.write_header()
        .map_err(|e| VidmapError::Other(e.to_string()))?;
    // The muxer may rewrite the stream time base during write_header.
    let out_tb = octx
        .stream(0)
        .map(|s| s.time_base())
        .ok_or_else(|| VidmapError::Other("output stream missing".into()))?;

    for (stream, mut packet) in ictx.packets() {
        if stream.index() != in_index {
            continue;
        }
        packet.rescale_ts(in_tb, out_tb);
        packet.set_stream(0);
        packet
            .write_interleaved(&mut octx)
            .map_err(|e| VidmapError::Other(e.to_string()))?;
    }

    octx.write_trailer()
        .map_err(|e| VidmapError::Other(e.to_string()))?;
    Ok(true)
}
