//! Bulk rectangular pixel access for ImageBuf.
//!
//! Region get/set in a caller-chosen format, built on the cursors so the
//! same code path serves local, external and cache-backed buffers.

use raster_core::{DataFormat, Roi};

use crate::convert;

use super::{ImageBuf, WrapMode};

impl ImageBuf {
    fn resolve_region(&self, roi: &Roi) -> (Roi, usize, usize) {
        let mut roi = if roi.is_all() { self.roi() } else { *roi };
        let nch = self.nchannels() as i32;
        roi.chbegin = roi.chbegin.clamp(0, nch);
        roi.chend = roi.chend.clamp(roi.chbegin, nch);
        let nch_req = roi.nchannels() as usize;
        let npixels = roi.npixels() as usize;
        (roi, nch_req, npixels)
    }

    /// Copies a region into `data` as contiguous `format` pixels with
    /// `roi.nchannels()` channels each, in raster order.
    ///
    /// Returns false if the buffer has no pixels or `data` is too small;
    /// per-pixel resolution failures substitute black and leave a message
    /// in the error mailbox.
    pub fn get_pixels(&self, roi: &Roi, format: DataFormat, data: &mut [u8]) -> bool {
        if !self.validate_pixels() {
            return false;
        }
        let (roi, nch_req, npixels) = self.resolve_region(roi);
        if nch_req == 0 || npixels == 0 {
            return true;
        }
        let chan_bytes = format.bytes_per_channel();
        let needed = npixels * nch_req * chan_bytes;
        if data.len() < needed {
            self.set_error(format!(
                "get_pixels buffer too small: {} bytes, need {needed}",
                data.len()
            ));
            return false;
        }

        let mut it = self.cursor_roi(roi, WrapMode::Black);
        let mut off = 0usize;
        while !it.done() {
            for c in roi.chbegin..roi.chend {
                convert::write_f32(format, it.get(c as usize), &mut data[off..]);
                off += chan_bytes;
            }
            it.next();
        }
        !it.had_read_error()
    }

    /// Fills a region from `data`, interpreted as contiguous `format`
    /// pixels with `roi.nchannels()` channels each, in raster order.
    ///
    /// Promotes cache-backed buffers to writable local storage first.
    pub fn set_pixels(&mut self, roi: &Roi, format: DataFormat, data: &[u8]) -> bool {
        let (roi, nch_req, npixels) = self.resolve_region(roi);
        if nch_req == 0 || npixels == 0 {
            return true;
        }
        let chan_bytes = format.bytes_per_channel();
        let needed = npixels * nch_req * chan_bytes;
        if data.len() < needed {
            self.set_error(format!(
                "set_pixels buffer too small: {} bytes, need {needed}",
                data.len()
            ));
            return false;
        }

        let mut it = self.cursor_mut_roi(roi);
        if !it.writable() {
            drop(it);
            if !self.has_error() {
                self.set_error("buffer is not writable");
            }
            return false;
        }
        let mut off = 0usize;
        while !it.done() {
            for c in roi.chbegin..roi.chend {
                let v = convert::read_as_f32(format, &data[off..]);
                it.set(c as usize, v);
                off += chan_bytes;
            }
            it.next();
        }
        true
    }
}
