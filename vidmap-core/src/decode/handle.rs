//! Owning handle around one foreign decode context.
//!
//! The handle owns the backend (and with it the foreign context) plus
//! the tile-major output buffer the backend decodes into. It adds what
//! the foreign library does not provide:
//!
//! - the wall-clock anchor captured at the first successful frame read,
//!   from which every presentation delay is derived;
//! - buffer reallocation across output resizes;
//! - structurally-enforced single close ([`close`](DecodeHandle::close)
//!   consumes the handle, so a second close does not typecheck).

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::decode::{DecodeBackend, Timebase};
use crate::error::VidmapError;
use crate::tile::{self, TileGrid, TileView};

// ── DecodeHandle ─────────────────────────────────────────────────

/// One open decode session: foreign context, output buffer, timing.
///
/// Exactly one scheduling tick reads or writes a handle at a time; the
/// handle is `Send` but deliberately not `Sync`.
pub struct DecodeHandle {
    backend: Box<dyn DecodeBackend>,
    buffer: Vec<u8>,
    grid: TileGrid,
    timebase: Timebase,
    last_pts: i64,
    /// Fixed at the first successful frame read; never moves afterwards,
    /// so delays self-correct for dispatch jitter instead of drifting.
    anchor: Option<Instant>,
}

impl DecodeHandle {
    /// Open `source` on an already-allocated backend context.
    ///
    /// The backend must have been constructed for `grid` (context
    /// allocation precedes open; an allocation failure never reaches
    /// this call). Open failure releases the context via drop.
    pub fn open(
        backend: Box<dyn DecodeBackend>,
        grid: TileGrid,
        source: &Path,
    ) -> Result<Self, VidmapError> {
        let mut backend = backend;
        let timebase = backend.open(source)?;
        debug!(source = %source.display(), %grid, timebase, "decode source opened");

        Ok(Self {
            backend,
            buffer: vec![0u8; grid.buffer_len()],
            grid,
            timebase,
            last_pts: 0,
            anchor: None,
        })
    }

    /// Advance the decoder by one frame.
    ///
    /// Returns `true` when a frame was decoded into the buffer, `false`
    /// at clean end-of-stream. Errors are terminal for the session.
    pub fn read_frame(&mut self) -> Result<bool, VidmapError> {
        match self.backend.read_frame(&mut self.buffer)? {
            Some(pts) => {
                self.last_pts = pts;
                if self.anchor.is_none() {
                    self.anchor = Some(Instant::now());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Renegotiate the tile grid with the foreign library.
    ///
    /// On success the buffer is reallocated and all previously derived
    /// [`TileView`]s are gone (the borrow ended). On failure the old
    /// geometry and buffer are kept untouched.
    ///
    /// The wall-clock anchor is deliberately *not* reset here; the
    /// original pipeline keeps the first-frame anchor across mid-stream
    /// resizes even though that can show as a one-frame stutter.
    pub fn resize_output(&mut self, grid: TileGrid) -> Result<(), VidmapError> {
        let mut next = vec![0u8; grid.buffer_len()];
        self.backend.resize(grid, &mut next)?;
        debug!(old = %self.grid, new = %grid, "output grid resized");
        self.buffer = next;
        self.grid = grid;
        Ok(())
    }

    /// Release the foreign context.
    ///
    /// Consumes the handle; calling close twice is unrepresentable.
    pub fn close(self) {
        debug!(grid = %self.grid, "decode context released");
        // Dropping the backend frees the foreign context.
    }

    /// Delay until the last-read frame's presentation time, relative to
    /// the fixed anchor: `anchor + pts * timebase − now`, clamped to
    /// zero whenever the result falls below `minimum_floor`. Never
    /// negative, so a late tick cannot starve the scheduler.
    pub fn suggest_delay(&self, minimum_floor: Duration) -> Duration {
        let Some(anchor) = self.anchor else {
            return Duration::ZERO;
        };
        let offset = Duration::from_secs_f64(self.last_pts.max(0) as f64 * self.timebase);
        let delay = (anchor + offset).saturating_duration_since(Instant::now());
        if delay < minimum_floor {
            Duration::ZERO
        } else {
            delay
        }
    }

    /// Current output geometry.
    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    /// Number of tiles (and therefore messages) per frame.
    pub fn tile_count(&self) -> usize {
        self.grid.tile_count()
    }

    /// The decode buffer for the current grid generation.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Partition the current buffer into per-tile views.
    pub fn views(&self) -> Vec<TileView<'_>> {
        tile::partition(&self.buffer, self.grid.tile_count())
    }

    /// Presentation timestamp of the most recently read frame.
    pub fn last_pts(&self) -> i64 {
        self.last_pts
    }

    /// Seconds per timestamp unit, as reported at open.
    pub fn timebase(&self) -> Timebase {
        self.timebase
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend driven by a prerecorded PTS script.
    struct ScriptedBackend {
        timebase: Timebase,
        frames: Vec<i64>,
        cursor: usize,
        fail_open: bool,
        fail_resize: bool,
        freed: Arc<AtomicUsize>,
    }

    impl ScriptedBackend {
        fn new(timebase: Timebase, frames: Vec<i64>, freed: Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                timebase,
                frames,
                cursor: 0,
                fail_open: false,
                fail_resize: false,
                freed,
            })
        }
    }

    impl DecodeBackend for ScriptedBackend {
        fn open(&mut self, _source: &Path) -> Result<Timebase, VidmapError> {
            if self.fail_open {
                return Err(VidmapError::DecodeOpen("scripted failure".into()));
            }
            Ok(self.timebase)
        }

        fn read_frame(&mut self, output: &mut [u8]) -> Result<Option<i64>, VidmapError> {
            match self.frames.get(self.cursor) {
                Some(&pts) => {
                    self.cursor += 1;
                    output.fill(self.cursor as u8);
                    Ok(Some(pts))
                }
                None => Ok(None),
            }
        }

        fn resize(&mut self, _grid: TileGrid, _output: &mut [u8]) -> Result<(), VidmapError> {
            if self.fail_resize {
                return Err(VidmapError::Resize {
                    width: _grid.width(),
                    height: _grid.height(),
                    reason: "scripted failure".into(),
                });
            }
            Ok(())
        }
    }

    impl Drop for ScriptedBackend {
        fn drop(&mut self) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn grid(w: u16, h: u16) -> TileGrid {
        TileGrid::new(w, h).unwrap()
    }

    #[test]
    fn open_failure_releases_context() {
        let freed = Arc::new(AtomicUsize::new(0));
        let mut backend = ScriptedBackend::new(0.001, vec![], freed.clone());
        backend.fail_open = true;

        let err = DecodeHandle::open(backend, grid(1, 1), Path::new("missing.mkv"));
        assert!(matches!(err, Err(VidmapError::DecodeOpen(_))));
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_releases_exactly_once() {
        let freed = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend::new(0.001, vec![0], freed.clone());
        let handle = DecodeHandle::open(backend, grid(1, 1), Path::new("a.mkv")).unwrap();

        handle.close();
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_frame_reports_clean_end_of_stream() {
        let freed = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend::new(0.001, vec![0, 33], freed);
        let mut handle = DecodeHandle::open(backend, grid(1, 1), Path::new("a.mkv")).unwrap();

        assert!(handle.read_frame().unwrap());
        assert!(handle.read_frame().unwrap());
        assert!(!handle.read_frame().unwrap());
        assert_eq!(handle.last_pts(), 33);
    }

    #[test]
    fn suggest_delay_clamps_below_floor_and_never_exceeds_gap() {
        let freed = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend::new(0.001, vec![0, 10_000], freed);
        let mut handle = DecodeHandle::open(backend, grid(1, 1), Path::new("a.mkv")).unwrap();
        let floor = Duration::from_millis(3);

        // First frame: pts 0, target equals the anchor, clamps to zero.
        assert!(handle.read_frame().unwrap());
        assert_eq!(handle.suggest_delay(floor), Duration::ZERO);

        // Second frame sits 10 s out; the suggestion never exceeds the
        // true wall-clock-to-presentation gap.
        assert!(handle.read_frame().unwrap());
        let delay = handle.suggest_delay(floor);
        assert!(delay <= Duration::from_secs(10));
        assert!(delay > Duration::from_millis(9_900), "got {delay:?}");
    }

    #[test]
    fn scheduling_scenario_three_frames() {
        // Timestamps [0, 33, 67] at timebase 0.001 with a 3 ms floor:
        // delays come out [0, ~33, ~34] when each suggestion is slept.
        let freed = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend::new(0.001, vec![0, 33, 67], freed);
        let mut handle = DecodeHandle::open(backend, grid(1, 1), Path::new("a.mkv")).unwrap();
        let floor = Duration::from_millis(3);

        assert!(handle.read_frame().unwrap());
        let d1 = handle.suggest_delay(floor);
        assert_eq!(d1, Duration::ZERO);
        std::thread::sleep(d1);

        assert!(handle.read_frame().unwrap());
        let d2 = handle.suggest_delay(floor);
        assert!(d2 > Duration::from_millis(20) && d2 <= Duration::from_millis(33), "{d2:?}");
        std::thread::sleep(d2);

        assert!(handle.read_frame().unwrap());
        let d3 = handle.suggest_delay(floor);
        // Anchor-relative: ~67 ms minus the ~33 ms already elapsed.
        assert!(d3 > Duration::from_millis(15) && d3 <= Duration::from_millis(45), "{d3:?}");

        assert!(!handle.read_frame().unwrap());
    }

    #[test]
    fn resize_reallocates_buffer_and_views() {
        let freed = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend::new(0.001, vec![0, 33], freed);
        let mut handle = DecodeHandle::open(backend, grid(2, 2), Path::new("a.mkv")).unwrap();

        assert!(handle.read_frame().unwrap());
        assert_eq!(handle.views().len(), 4);

        handle.resize_output(grid(1, 2)).unwrap();
        assert_eq!(handle.tile_count(), 2);
        assert_eq!(handle.buffer().len(), grid(1, 2).buffer_len());
        assert_eq!(handle.views().len(), 2);
    }

    #[test]
    fn resize_failure_keeps_old_geometry() {
        let freed = Arc::new(AtomicUsize::new(0));
        let mut backend = ScriptedBackend::new(0.001, vec![0], freed);
        backend.fail_resize = true;
        let mut handle = DecodeHandle::open(backend, grid(3, 3), Path::new("a.mkv")).unwrap();

        let err = handle.resize_output(grid(2, 2));
        assert!(matches!(err, Err(VidmapError::Resize { .. })));
        assert_eq!(handle.grid(), grid(3, 3));
        assert_eq!(handle.buffer().len(), grid(3, 3).buffer_len());
    }
}
