//! Position cursors: coordinate-to-address resolution and traversal.
//!
//! A cursor binds to one buffer, an iteration range and a wrap policy, and
//! turns (x, y, z, channel) into a readable (or writable) location:
//!
//! - Local/external storage resolves by pointer arithmetic - O(1), no
//!   locking on the hot path (strides are fixed once pixels are valid).
//! - Cache-backed storage resolves through the tile cache, holding on to
//!   the most recently acquired tile so sequential scans re-resolve only
//!   at tile boundaries.
//! - Coordinates outside the data window go through the wrap policy,
//!   evaluated against the *full (display) window*; anything still outside
//!   the data window afterwards reads as the shared black pixel.
//!
//! Tile fetch failures are non-fatal per pixel: the cursor substitutes the
//! black pixel, records the message on the owning buffer and keeps going;
//! check [`Cursor::had_read_error`] after the loop.
//!
//! # Example
//!
//! ```ignore
//! let mut it = buf.cursor(WrapMode::Black);
//! let mut sum = 0.0;
//! while !it.done() {
//!     sum += it.get(0);
//!     it.next();
//! }
//! ```

use raster_core::Roi;

use crate::convert;

use super::{CursorSnapshot, ImageBuf, Storage};
use crate::cache::TileHandle;

/// Wrap policy for pixel access outside the data window.
///
/// Remapping is evaluated against the full (display) window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    /// Use the default policy (black).
    #[default]
    Default,
    /// Out-of-window reads yield the shared all-zero pixel.
    Black,
    /// Coordinates clamp per axis into the full window.
    Clamp,
    /// Coordinates wrap modulo the full-window extent.
    Periodic,
    /// Coordinates reflect at the full-window boundary.
    Mirror,
}

impl WrapMode {
    #[inline]
    fn resolved(self) -> WrapMode {
        match self {
            WrapMode::Default => WrapMode::Black,
            other => other,
        }
    }
}

/// Remaps one coordinate into `[begin, end)` under a wrap policy.
fn wrap_axis(mode: WrapMode, c: i32, begin: i32, end: i32) -> i32 {
    let n = end - begin;
    if n <= 0 || (c >= begin && c < end) {
        return c;
    }
    match mode {
        WrapMode::Clamp => c.clamp(begin, end - 1),
        WrapMode::Periodic => begin + (c - begin).rem_euclid(n),
        WrapMode::Mirror => {
            let mut p = (c - begin).rem_euclid(2 * n);
            if p >= n {
                p = 2 * n - 1 - p;
            }
            begin + p
        }
        WrapMode::Default | WrapMode::Black => c,
    }
}

const EMPTY_ROI: Roi = Roi::new(0, 0, 0, 0, 0, 0, 0, 0);

/// Read cursor over a buffer region.
pub struct Cursor<'a> {
    buf: &'a ImageBuf,
    snap: CursorSnapshot,
    rng: Roi,
    wrap: WrapMode,
    x: i32,
    y: i32,
    z: i32,
    valid: bool,
    exists: bool,
    finished: bool,
    ptr: *const u8,
    tile: Option<TileHandle>,
    tile_roi: Roi,
    read_error: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a ImageBuf, roi: Roi, wrap: WrapMode) -> Self {
        let pixels_ok = buf.validate_pixels();
        let snap = buf.snapshot();
        let rng = if roi.defined() { roi } else { snap.img };
        let start_broken = !pixels_ok || rng.npixels() == 0;
        let black = snap.black;
        let mut cursor = Self {
            buf,
            snap,
            rng,
            wrap: wrap.resolved(),
            x: rng.xbegin,
            y: rng.ybegin,
            z: rng.zbegin,
            valid: false,
            exists: false,
            finished: start_broken,
            ptr: black,
            tile: None,
            tile_roi: EMPTY_ROI,
            read_error: !pixels_ok,
        };
        if !start_broken {
            cursor.pos(rng.xbegin, rng.ybegin, rng.zbegin);
        }
        cursor
    }

    /// Current x position.
    #[inline]
    pub fn x(&self) -> i32 {
        self.x
    }

    /// Current y position.
    #[inline]
    pub fn y(&self) -> i32 {
        self.y
    }

    /// Current z position.
    #[inline]
    pub fn z(&self) -> i32 {
        self.z
    }

    /// Is the current position within the iteration range?
    #[inline]
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Is the current position within the image's data window?
    #[inline]
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Has the traversal run off the end of the range?
    #[inline]
    pub fn done(&self) -> bool {
        self.finished
    }

    /// The iteration range.
    #[inline]
    pub fn range(&self) -> Roi {
        self.rng
    }

    /// The wrap policy in effect.
    #[inline]
    pub fn wrap(&self) -> WrapMode {
        self.wrap
    }

    /// True if any resolution failure (tile fetch error) happened during
    /// this cursor's traversal. The substituted pixels read as black.
    #[inline]
    pub fn had_read_error(&self) -> bool {
        self.read_error
    }

    #[inline]
    fn pixel_addr(&self, x: i32, y: i32, z: i32) -> *const u8 {
        let (xs, ys, zs) = self.snap.strides;
        let dx = (x - self.snap.img.xbegin) as usize;
        let dy = (y - self.snap.img.ybegin) as usize;
        let dz = (z - self.snap.img.zbegin) as usize;
        unsafe { self.snap.base.add(dz * zs + dy * ys + dx * xs) }
    }

    fn retile(&mut self, x: i32, y: i32, z: i32) {
        // Release the held tile before acquiring the next.
        self.tile = None;
        self.tile_roi = EMPTY_ROI;
        let Some(cache) = self.snap.cache.clone() else {
            self.read_error = true;
            return;
        };
        match cache.acquire_tile(&self.snap.name, self.snap.subimage, self.snap.miplevel, x, y, z)
        {
            Ok(handle) => {
                self.tile_roi = handle.roi();
                self.tile = Some(handle);
            }
            Err(e) => {
                tracing::warn!(file = %self.snap.name.display(), "tile fetch failed: {e}");
                self.buf.set_error(e.to_string());
                self.read_error = true;
            }
        }
    }

    fn addr_or_tile(&mut self, x: i32, y: i32, z: i32) -> *const u8 {
        match self.snap.storage {
            Storage::Local | Storage::External => self.pixel_addr(x, y, z),
            Storage::Cache => {
                if self.tile.is_none() || !self.tile_roi.contains(x, y, z) {
                    self.retile(x, y, z);
                }
                match &self.tile {
                    Some(handle) => {
                        let tile = handle.tile();
                        unsafe { tile.data().as_ptr().add(tile.pixel_offset(x, y, z)) }
                    }
                    None => self.snap.black,
                }
            }
            Storage::Uninitialized => self.snap.black,
        }
    }

    fn resolve_wrapped(&mut self, x: i32, y: i32, z: i32) {
        match self.wrap {
            WrapMode::Default | WrapMode::Black => {
                self.ptr = self.snap.black;
            }
            mode => {
                let full = self.snap.full;
                let wx = wrap_axis(mode, x, full.xbegin, full.xend);
                let wy = wrap_axis(mode, y, full.ybegin, full.yend);
                let wz = wrap_axis(mode, z, full.zbegin, full.zend);
                // The remapped coordinate must land in the data window;
                // otherwise the result is still black.
                if self.snap.img.contains(wx, wy, wz) {
                    self.ptr = self.addr_or_tile(wx, wy, wz);
                } else {
                    self.ptr = self.snap.black;
                }
            }
        }
    }

    /// Explicitly points the cursor at (x, y, z), applying the wrap policy
    /// when the location is outside the data window.
    pub fn pos(&mut self, x: i32, y: i32, z: i32) {
        if x == self.x + 1 && x < self.rng.xend && y == self.y && z == self.z
            && self.valid
            && self.exists
        {
            // Just incrementing x within the range.
            self.x = x;
            self.pos_xincr();
            return;
        }
        let v = self.rng.contains(x, y, z);
        let e = self.snap.img.contains(x, y, z);
        self.x = x;
        self.y = y;
        self.z = z;
        self.valid = v;
        self.exists = e;
        self.finished = false;
        if self.snap.deep {
            return;
        }
        if e {
            self.ptr = self.addr_or_tile(x, y, z);
        } else {
            self.resolve_wrapped(x, y, z);
        }
    }

    /// The O(1) step after `x` was incremented while the previous position
    /// was inside both the range and the data window.
    fn pos_xincr(&mut self) {
        if self.snap.deep {
            self.exists = self.x < self.snap.img.xend;
            return;
        }
        if self.x < self.snap.img.xend {
            match self.snap.storage {
                Storage::Local | Storage::External => {
                    self.ptr = unsafe { self.ptr.add(self.snap.strides.0) };
                }
                Storage::Cache => {
                    if self.x < self.tile_roi.xend {
                        self.ptr = unsafe { self.ptr.add(self.snap.pixel_bytes) };
                    } else {
                        let (x, y, z) = (self.x, self.y, self.z);
                        self.ptr = self.addr_or_tile(x, y, z);
                    }
                }
                Storage::Uninitialized => {}
            }
        } else {
            self.exists = false;
            let (x, y, z) = (self.x, self.y, self.z);
            self.resolve_wrapped(x, y, z);
        }
    }

    /// Advances to the next pixel of the range in raster order.
    pub fn next(&mut self) {
        if self.finished {
            return;
        }
        let nx = self.x + 1;
        if nx < self.rng.xend {
            if self.valid && self.exists {
                self.x = nx;
                self.pos_xincr();
            } else {
                self.pos(nx, self.y, self.z);
            }
            return;
        }
        let mut ny = self.y + 1;
        let mut nz = self.z;
        if ny >= self.rng.yend {
            ny = self.rng.ybegin;
            nz += 1;
            if nz >= self.rng.zend {
                self.valid = false;
                self.finished = true;
                return;
            }
        }
        self.pos(self.rng.xbegin, ny, nz);
    }

    /// Value of channel `c` at the current position (0.0 for deep images
    /// or out-of-range channels).
    #[inline]
    pub fn get(&self, c: usize) -> f32 {
        if self.snap.deep || c >= self.snap.nchannels {
            return 0.0;
        }
        let fmt = self.snap.channel_formats[c];
        let off = self.snap.channel_offsets[c];
        let bytes =
            unsafe { std::slice::from_raw_parts(self.ptr.add(off), fmt.bytes_per_channel()) };
        convert::read_as_f32(fmt, bytes)
    }

    /// All channels at the current position; excess output entries zero.
    pub fn pixel(&self, out: &mut [f32]) {
        if self.snap.deep {
            out.fill(0.0);
            return;
        }
        let n = out.len().min(self.snap.nchannels);
        for (c, v) in out.iter_mut().take(n).enumerate() {
            *v = self.get(c);
        }
        out[n..].fill(0.0);
    }

    /// Number of deep samples at the current position.
    pub fn deep_samples(&self) -> u32 {
        self.buf.deep_samples(self.x, self.y, self.z)
    }

    /// One deep sample value at the current position.
    pub fn deep_value(&self, channel: usize, sample: usize) -> f32 {
        self.buf.deep_value(self.x, self.y, self.z, channel, sample)
    }
}

/// Write cursor: a [`Cursor`] over a buffer promoted to writable storage.
///
/// Constructing one over a cache-backed buffer runs the make-writable
/// promotion first; if the buffer cannot be made writable (read-only
/// external memory, uninitialized) every write is a failing no-op.
pub struct CursorMut<'a> {
    inner: Cursor<'a>,
    writable: bool,
}

impl<'a> CursorMut<'a> {
    pub(crate) fn new(buf: &'a mut ImageBuf, roi: Roi, writable: bool) -> Self {
        let inner = Cursor::new(buf, roi, WrapMode::Black);
        Self { inner, writable }
    }

    /// Can this cursor actually write?
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Current x position.
    #[inline]
    pub fn x(&self) -> i32 {
        self.inner.x()
    }

    /// Current y position.
    #[inline]
    pub fn y(&self) -> i32 {
        self.inner.y()
    }

    /// Current z position.
    #[inline]
    pub fn z(&self) -> i32 {
        self.inner.z()
    }

    /// Is the current position within the iteration range?
    #[inline]
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    /// Is the current position within the data window?
    #[inline]
    pub fn exists(&self) -> bool {
        self.inner.exists()
    }

    /// Has the traversal finished?
    #[inline]
    pub fn done(&self) -> bool {
        self.inner.done()
    }

    /// True if any resolution failure happened during traversal.
    #[inline]
    pub fn had_read_error(&self) -> bool {
        self.inner.had_read_error()
    }

    /// Points the cursor at (x, y, z).
    pub fn pos(&mut self, x: i32, y: i32, z: i32) {
        self.inner.pos(x, y, z);
    }

    /// Advances to the next pixel in raster order.
    pub fn next(&mut self) {
        self.inner.next();
    }

    /// Reads channel `c` at the current position.
    #[inline]
    pub fn get(&self, c: usize) -> f32 {
        self.inner.get(c)
    }

    /// Reads all channels at the current position.
    pub fn pixel(&self, out: &mut [f32]) {
        self.inner.pixel(out);
    }

    /// Writes channel `c` at the current position.
    ///
    /// No-op returning false outside the data window, on deep images, or
    /// when the buffer is not writable.
    pub fn set(&mut self, c: usize, value: f32) -> bool {
        if !self.writable
            || !self.inner.exists
            || self.inner.snap.deep
            || c >= self.inner.snap.nchannels
        {
            return false;
        }
        let fmt = self.inner.snap.channel_formats[c];
        let off = self.inner.snap.channel_offsets[c];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                self.inner.ptr.add(off) as *mut u8,
                fmt.bytes_per_channel(),
            )
        };
        convert::write_f32(fmt, value, bytes);
        true
    }

    /// Writes all channels at the current position.
    pub fn set_pixel(&mut self, values: &[f32]) -> bool {
        if !self.writable || !self.inner.exists || self.inner.snap.deep {
            return false;
        }
        let n = values.len().min(self.inner.snap.nchannels);
        for (c, v) in values.iter().take(n).enumerate() {
            self.set(c, *v);
        }
        true
    }

    /// Number of deep samples at the current position.
    pub fn deep_samples(&self) -> u32 {
        self.inner.deep_samples()
    }

    /// Reads one deep sample value.
    pub fn deep_value(&self, channel: usize, sample: usize) -> f32 {
        self.inner.deep_value(channel, sample)
    }

    /// Writes one deep sample value at the current position.
    pub fn set_deep_value(&mut self, channel: usize, sample: usize, value: f32) -> bool {
        if !self.inner.snap.deep {
            return false;
        }
        self.inner.buf.set_deep_value_internal(
            self.inner.x,
            self.inner.y,
            self.inner.z,
            channel,
            sample,
            value,
        )
    }
}

/// Parallel traversal helpers (caller-driven fan-out over scanline bands).
#[cfg(feature = "rayon")]
mod parallel {
    use super::*;
    use rayon::prelude::*;

    impl ImageBuf {
        /// Applies `f` to every pixel of `roi` (default: the data window),
        /// fanning independent scanline bands out across rayon workers.
        /// Each worker traverses through its own cursor.
        pub fn par_for_each_pixel<F>(&self, roi: Option<Roi>, f: F)
        where
            F: Fn(i32, i32, i32, &[f32]) + Sync + Send,
        {
            let roi = roi.unwrap_or_else(|| self.roi());
            let nch = self.nchannels() as usize;
            (roi.ybegin..roi.yend).into_par_iter().for_each(|y| {
                let band = Roi::new(
                    roi.xbegin, roi.xend, y, y + 1, roi.zbegin, roi.zend, roi.chbegin, roi.chend,
                );
                let mut it = self.cursor_roi(band, WrapMode::Black);
                let mut pixel = vec![0.0f32; nch];
                while !it.done() {
                    it.pixel(&mut pixel);
                    f(it.x(), it.y(), it.z(), &pixel);
                    it.next();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagebuf::InitializePixels;
    use raster_core::ImageSpec;

    fn gradient_buf(w: u32, h: u32) -> ImageBuf {
        let mut buf = ImageBuf::new(ImageSpec::gray(w, h), InitializePixels::Yes);
        {
            let mut it = buf.cursor_mut();
            while !it.done() {
                let v = (it.y() * w as i32 + it.x()) as f32;
                it.set(0, v);
                it.next();
            }
        }
        buf
    }

    #[test]
    fn test_raster_order_traversal() {
        let buf = gradient_buf(4, 3);
        let mut it = buf.cursor(WrapMode::Black);
        let mut seen = Vec::new();
        while !it.done() {
            seen.push((it.x(), it.y(), it.get(0)));
            it.next();
        }
        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0], (0, 0, 0.0));
        assert_eq!(seen[1], (1, 0, 1.0));
        assert_eq!(seen[4], (0, 1, 4.0));
        assert_eq!(seen[11], (3, 2, 11.0));
    }

    #[test]
    fn test_wrap_black() {
        let buf = gradient_buf(4, 4);
        let mut it = buf.cursor(WrapMode::Black);
        it.pos(-1, 0, 0);
        assert!(!it.exists());
        assert_eq!(it.get(0), 0.0);
        it.pos(10, 10, 0);
        assert_eq!(it.get(0), 0.0);
    }

    #[test]
    fn test_wrap_clamp() {
        let buf = gradient_buf(4, 4);
        let mut it = buf.cursor(WrapMode::Clamp);
        it.pos(-5, 2, 0);
        assert!(!it.exists());
        assert_eq!(it.get(0), 8.0); // clamps to (0, 2)
        it.pos(7, 7, 0);
        assert_eq!(it.get(0), 15.0); // clamps to (3, 3)
    }

    #[test]
    fn test_wrap_periodic() {
        let buf = gradient_buf(4, 4);
        let mut it = buf.cursor(WrapMode::Periodic);
        for k in -2i32..=2 {
            it.pos(1 + 4 * k, 2 + 4 * k, 0);
            assert_eq!(it.get(0), 9.0, "k={k}");
        }
    }

    #[test]
    fn test_wrap_mirror() {
        let buf = gradient_buf(4, 4);
        let mut it = buf.cursor(WrapMode::Mirror);
        it.pos(-1, 0, 0);
        assert_eq!(it.get(0), 0.0); // mirrors to x=0
        it.pos(-2, 0, 0);
        assert_eq!(it.get(0), 1.0); // mirrors to x=1
        it.pos(4, 0, 0);
        assert_eq!(it.get(0), 3.0); // mirrors to x=3
    }

    #[test]
    fn test_wrap_checks_full_window_then_data_window() {
        // Data window is a 2x2 region inset in an 8x8 full window; clamped
        // coordinates land inside the full window but outside the data
        // window, which must still read black.
        let mut spec = ImageSpec::gray(2, 2);
        spec.x = 3;
        spec.y = 3;
        spec.full_x = 0;
        spec.full_y = 0;
        spec.full_width = 8;
        spec.full_height = 8;
        let mut buf = ImageBuf::new(spec, InitializePixels::Yes);
        buf.setpixel(3, 3, 0, &[1.0]);

        let mut it = buf.cursor(WrapMode::Clamp);
        it.pos(-5, 3, 0); // clamps to x=0, still outside data window
        assert_eq!(it.get(0), 0.0);
        it.pos(2, 3, 0); // outside data window, clamp keeps it at (2,3)
        assert_eq!(it.get(0), 0.0);
    }

    #[test]
    fn test_range_vs_exists() {
        let buf = gradient_buf(4, 4);
        // Range deliberately pokes past the data window on the right.
        let roi = Roi::new_2d(2, 6, 0, 1);
        let mut it = buf.cursor_roi(roi, WrapMode::Black);
        let mut vals = Vec::new();
        while !it.done() {
            vals.push((it.x(), it.exists(), it.get(0)));
            it.next();
        }
        assert_eq!(
            vals,
            vec![
                (2, true, 2.0),
                (3, true, 3.0),
                (4, false, 0.0),
                (5, false, 0.0)
            ]
        );
    }

    #[test]
    fn test_write_cursor() {
        let mut buf = ImageBuf::new(ImageSpec::gray(3, 3), InitializePixels::Yes);
        {
            let mut it = buf.cursor_mut();
            while !it.done() {
                let v = it.x() as f32 * 0.25;
                assert!(it.set(0, v));
                it.next();
            }
        }
        assert_eq!(buf.getchannel(2, 1, 0, 0, WrapMode::Black), 0.5);
    }

    #[test]
    fn test_u8_buffer_value_conversion() {
        use raster_core::DataFormat;
        let mut buf = ImageBuf::new(
            ImageSpec::new(2, 1, 1, DataFormat::U8),
            InitializePixels::Yes,
        );
        {
            let mut it = buf.cursor_mut();
            it.set(0, 0.5);
        }
        let got = buf.getchannel(0, 0, 0, 0, WrapMode::Black);
        approx::assert_relative_eq!(got, 128.0 / 255.0, epsilon = 1e-4);
    }
}
