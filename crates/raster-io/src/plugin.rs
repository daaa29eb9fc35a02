//! Format plugin traits and the generic I/O pipeline.
//!
//! A concrete codec implements only the *native* primitives - "read/write
//! exactly one scanline or tile, contiguous, no conversion" - and gets the
//! rest for free from the provided trait methods:
//!
//! - arbitrary output strides and pixel types (single-pass strided
//!   conversion, see [`crate::convert`])
//! - partial channel ranges
//! - batched multi-row / multi-tile transfers
//! - bounded-memory chunking with a progress/cancel callback
//!
//! The pipeline detects *native passthrough* requests (stored type, full
//! channel range, contiguous strides) and hands those straight to the
//! native primitive with zero extra copies.
//!
//! # Error contract
//!
//! A failed native read or write aborts the whole operation and surfaces
//! the plugin's message unchanged; partially transferred output is
//! indeterminate for that operation. Validation (declared resolution,
//! channel/tile ranges, configured resource ceilings) happens before any
//! large allocation.

use std::path::Path;

use raster_core::{DataFormat, ImageSpec};

use crate::convert;
use crate::error::{IoError, IoResult};
use crate::limits;

/// Staging budget for chunked transfers. Chunks are rounded down to the
/// format's natural row granularity, never below one row.
pub const PIPELINE_BUFFER_BYTES: usize = 16 * 1024 * 1024;

/// Optional capabilities a plugin may advertise.
///
/// The pipeline consults these to pick a scanline or tile strategy and to
/// relax validation for formats that carry no pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Supports tiled organization and `read_native_tile`/`write_native_tile`.
    Tiles,
    /// Supports more than one subimage per file.
    MultiImage,
    /// Supports mip levels.
    MipMap,
    /// Supports deep (multi-sample) pixels.
    DeepData,
    /// Supports heterogeneous per-channel data types.
    PerChannelFormats,
    /// May legitimately declare zero-sized pixel data.
    NoPixels,
}

/// Progress callback: receives fractional completion in [0, 1]; returning
/// `true` cancels the operation (cleanly, without error) at the next chunk
/// boundary. A chunk always completes once started.
pub type ProgressCallback<'a> = &'a mut dyn FnMut(f32) -> bool;

#[inline]
fn reborrow<'a>(p: &'a mut Option<ProgressCallback<'_>>) -> Option<ProgressCallback<'a>> {
    match p {
        Some(cb) => Some(&mut **cb),
        None => None,
    }
}

/// Checks that a destination/source buffer described by strides is large
/// enough for a `width` x `height` x `depth` transfer.
fn check_buffer(
    len: usize,
    pixel_bytes: usize,
    width: usize,
    height: usize,
    depth: usize,
    strides: (usize, usize, usize),
    what: &str,
) -> IoResult<()> {
    let (xs, ys, zs) = strides;
    if width == 0 || height == 0 || depth == 0 {
        return Ok(());
    }
    let needed = (depth - 1) * zs + (height - 1) * ys + (width - 1) * xs + pixel_bytes;
    if len < needed {
        return Err(IoError::Unsupported(format!(
            "{what} buffer too small: {len} bytes, need {needed}"
        )));
    }
    Ok(())
}

/// A format reader plugin.
///
/// Implementations provide the native primitives; callers use the provided
/// pipeline methods. All methods refer to the subimage/miplevel selected
/// by the latest [`seek`](FormatInput::seek) (initially 0/0).
pub trait FormatInput: Send {
    /// Short format name, e.g. `"rbf"`.
    fn format_name(&self) -> &'static str;

    /// Opens a file and reads its header. `config` carries caller hints
    /// that the plugin may honor or ignore.
    fn open(&mut self, path: &Path, config: Option<&ImageSpec>) -> IoResult<()>;

    /// The descriptor of the currently selected subimage/miplevel.
    fn spec(&self) -> &ImageSpec;

    /// Capability query.
    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    /// Number of subimages in the open file.
    fn num_subimages(&self) -> usize {
        1
    }

    /// Number of mip levels for a subimage.
    fn num_miplevels(&self, _subimage: usize) -> usize {
        1
    }

    /// Selects a subimage and mip level for subsequent reads.
    fn seek(&mut self, subimage: usize, miplevel: usize) -> IoResult<()>;

    /// Reads one native scanline (row `y`, slice `z`, absolute
    /// coordinates) into `data`, which holds at least
    /// `spec().scanline_bytes(true)` bytes. Contiguous, native types, all
    /// channels, no conversion.
    fn read_native_scanline(&mut self, y: i32, z: i32, data: &mut [u8]) -> IoResult<()>;

    /// Reads one native tile whose corner is (x, y, z) into `data`, which
    /// holds at least `spec().tile_bytes(true)` bytes. Edge tiles are
    /// padded to the full tile size.
    fn read_native_tile(&mut self, _x: i32, _y: i32, _z: i32, _data: &mut [u8]) -> IoResult<()> {
        Err(IoError::Unsupported(format!(
            "{} does not support tiles",
            self.format_name()
        )))
    }

    // ------------------------------------------------------------------
    // Generic pipeline (provided)
    // ------------------------------------------------------------------

    /// Reads one scanline with conversion to `format` (`None` = native
    /// layout) and pixel stride `xstride` (`None` = contiguous).
    fn read_scanline(
        &mut self,
        y: i32,
        z: i32,
        format: Option<DataFormat>,
        data: &mut [u8],
        xstride: Option<usize>,
    ) -> IoResult<()> {
        let nchannels = self.spec().nchannels;
        self.read_scanlines(y, y + 1, z, 0, nchannels, format, data, xstride, None, None)
    }

    /// Reads scanlines `[ybegin, yend)` of slice `z`, channels
    /// `[chbegin, chend)`, converting to `format` and writing through the
    /// given byte strides (`None` = contiguous for the requested subset).
    ///
    /// Transfers are chunked to a fixed staging budget; `progress` is
    /// invoked between chunks and may cancel.
    #[allow(clippy::too_many_arguments)]
    fn read_scanlines(
        &mut self,
        ybegin: i32,
        yend: i32,
        z: i32,
        chbegin: u32,
        chend: u32,
        format: Option<DataFormat>,
        data: &mut [u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        limits::limits().check_spec(&spec, self.supports(Capability::NoPixels))?;

        if ybegin < spec.y
            || yend > spec.y + spec.height as i32
            || ybegin >= yend
            || z < spec.z
            || z >= spec.z + spec.depth.max(1) as i32
        {
            return Err(IoError::Unsupported(format!(
                "scanline range [{ybegin},{yend}) z={z} outside data window"
            )));
        }
        if chbegin >= chend || chend > spec.nchannels {
            return Err(IoError::Unsupported(format!(
                "channel range [{chbegin},{chend}) invalid for {} channels",
                spec.nchannels
            )));
        }

        let width = spec.width as usize;
        let nrows_total = (yend - ybegin) as usize;
        let nch_req = (chend - chbegin) as usize;
        let subset = chbegin != 0 || chend != spec.nchannels;
        let perchan = spec.per_channel_formats();
        let native = format.is_none();
        let req_fmt = format.unwrap_or(spec.format);

        if native && perchan && subset {
            return Err(IoError::Unsupported(
                "channel subsets of per-channel native data require an explicit format".into(),
            ));
        }

        let native_pixel = spec.pixel_bytes(true);
        let chan_offset = spec.channel_bytes_offset(chbegin as usize, true);
        // Requested bytes per pixel for the subset, in the caller's layout.
        let req_pixel = if native {
            spec.channel_bytes_offset(chend as usize, true) - chan_offset
        } else {
            nch_req * req_fmt.bytes_per_channel()
        };
        let xs = xstride.unwrap_or(req_pixel);
        let ys = ystride.unwrap_or(width * xs);
        check_buffer(data.len(), req_pixel, width, nrows_total, 1, (xs, ys, 0), "scanline")?;

        let row_native = spec.scanline_bytes(true);
        let rows_per_chunk = (PIPELINE_BUFFER_BYTES / row_native.max(1)).max(1);

        // Native passthrough: stored type, full channel range, contiguous
        // strides. Rows go straight into the caller's buffer.
        let passthrough =
            !subset && xs == native_pixel && ys == row_native && (native || (req_fmt == spec.format && !perchan));
        if passthrough {
            let mut row = 0usize;
            while row < nrows_total {
                let nrows = rows_per_chunk.min(nrows_total - row);
                for r in 0..nrows {
                    let off = (row + r) * row_native;
                    self.read_native_scanline(
                        ybegin + (row + r) as i32,
                        z,
                        &mut data[off..off + row_native],
                    )?;
                }
                row += nrows;
                if let Some(cb) = progress.as_mut() {
                    if cb(row as f32 / nrows_total as f32) {
                        return Ok(());
                    }
                }
            }
            return Ok(());
        }

        // Staged path: read native chunks, then convert/subset in one or
        // few passes per chunk.
        let mut stage = vec![0u8; rows_per_chunk.min(nrows_total) * row_native];
        let mut row = 0usize;
        while row < nrows_total {
            let nrows = rows_per_chunk.min(nrows_total - row);
            for r in 0..nrows {
                let off = r * row_native;
                self.read_native_scanline(
                    ybegin + (row + r) as i32,
                    z,
                    &mut stage[off..off + row_native],
                )?;
            }

            let dst = &mut data[row * ys..];
            if native {
                // Native bytes, but strided: copy each pixel's native bytes.
                for r in 0..nrows {
                    for px in 0..width {
                        let soff = r * row_native + px * native_pixel + chan_offset;
                        let doff = r * ys + px * xs;
                        dst[doff..doff + req_pixel]
                            .copy_from_slice(&stage[soff..soff + req_pixel]);
                    }
                }
            } else if perchan {
                let formats = &spec.channel_formats[chbegin as usize..chend as usize];
                convert::convert_per_channel(
                    formats,
                    width,
                    nrows,
                    1,
                    &stage[chan_offset..],
                    (native_pixel, row_native, 0),
                    dst,
                    req_fmt,
                    (xs, ys, 0),
                );
            } else {
                convert::convert_image(
                    nch_req,
                    width,
                    nrows,
                    1,
                    &stage[chan_offset..],
                    spec.format,
                    (native_pixel, row_native, 0),
                    dst,
                    req_fmt,
                    (xs, ys, 0),
                );
            }

            row += nrows;
            if let Some(cb) = progress.as_mut() {
                if cb(row as f32 / nrows_total as f32) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Reads one tile with conversion and striding, `read_scanline`-style.
    #[allow(clippy::too_many_arguments)]
    fn read_tile(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        format: Option<DataFormat>,
        data: &mut [u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        if !spec.is_tiled() {
            return Err(IoError::Unsupported(format!(
                "{} image is not tiled",
                self.format_name()
            )));
        }
        let (tw, th, td) = (
            spec.tile_width as usize,
            spec.tile_height as usize,
            spec.tile_depth.max(1) as usize,
        );
        if (x - spec.x) % tw as i32 != 0
            || (y - spec.y) % th as i32 != 0
            || (z - spec.z) % td as i32 != 0
        {
            return Err(IoError::Unsupported(format!(
                "tile coordinates ({x}, {y}, {z}) not aligned to {tw}x{th}x{td} grid"
            )));
        }

        let perchan = spec.per_channel_formats();
        let native = format.is_none();
        let req_fmt = format.unwrap_or(spec.format);
        let native_pixel = spec.pixel_bytes(true);
        let req_pixel = if native {
            native_pixel
        } else {
            spec.nchannels as usize * req_fmt.bytes_per_channel()
        };
        let xs = xstride.unwrap_or(req_pixel);
        let ys = ystride.unwrap_or(tw * xs);
        let zs = zstride.unwrap_or(th * ys);
        check_buffer(data.len(), req_pixel, tw, th, td, (xs, ys, zs), "tile")?;

        let contiguous = xs == req_pixel && ys == tw * xs && zs == th * ys;
        if contiguous && (native || (req_fmt == spec.format && !perchan)) {
            return self.read_native_tile(x, y, z, data);
        }

        let mut stage = vec![0u8; spec.tile_bytes(true)];
        self.read_native_tile(x, y, z, &mut stage)?;
        let row_native = tw * native_pixel;
        if native {
            for zz in 0..td {
                for yy in 0..th {
                    for px in 0..tw {
                        let soff = (zz * th + yy) * row_native + px * native_pixel;
                        let doff = zz * zs + yy * ys + px * xs;
                        data[doff..doff + native_pixel]
                            .copy_from_slice(&stage[soff..soff + native_pixel]);
                    }
                }
            }
        } else if perchan {
            convert::convert_per_channel(
                &spec.channel_formats,
                tw,
                th,
                td,
                &stage,
                (native_pixel, row_native, th * row_native),
                data,
                req_fmt,
                (xs, ys, zs),
            );
        } else {
            convert::convert_image(
                spec.nchannels as usize,
                tw,
                th,
                td,
                &stage,
                spec.format,
                (native_pixel, row_native, th * row_native),
                data,
                req_fmt,
                (xs, ys, zs),
            );
        }
        Ok(())
    }

    /// Reads the rectangle of tiles covering `[xbegin,xend) x [ybegin,yend)
    /// x [zbegin,zend)`, channels `[chbegin, chend)`.
    ///
    /// Complete tiles with a full channel range transfer directly into the
    /// caller's (possibly strided) buffer; partial edge tiles and channel
    /// subsets stage through a temporary tile and copy the valid
    /// sub-rectangle. `progress` fires after each row of tiles.
    #[allow(clippy::too_many_arguments)]
    fn read_tiles(
        &mut self,
        xbegin: i32,
        xend: i32,
        ybegin: i32,
        yend: i32,
        zbegin: i32,
        zend: i32,
        chbegin: u32,
        chend: u32,
        format: Option<DataFormat>,
        data: &mut [u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        limits::limits().check_spec(&spec, self.supports(Capability::NoPixels))?;
        if !spec.is_tiled() {
            return Err(IoError::Unsupported(format!(
                "{} image is not tiled",
                self.format_name()
            )));
        }
        let roi = spec.roi();
        if xbegin < roi.xbegin
            || xend > roi.xend
            || ybegin < roi.ybegin
            || yend > roi.yend
            || zbegin < roi.zbegin
            || zend > roi.zend
            || xbegin >= xend
            || ybegin >= yend
            || zbegin >= zend
        {
            return Err(IoError::Unsupported(format!(
                "tile range x[{xbegin},{xend}) y[{ybegin},{yend}) z[{zbegin},{zend}) outside data window"
            )));
        }
        if chbegin >= chend || chend > spec.nchannels {
            return Err(IoError::Unsupported(format!(
                "channel range [{chbegin},{chend}) invalid for {} channels",
                spec.nchannels
            )));
        }
        let (tw, th, td) = (
            spec.tile_width as i32,
            spec.tile_height as i32,
            spec.tile_depth.max(1) as i32,
        );
        let aligned = |begin: i32, origin: i32, t: i32, end: i32, window_end: i32| {
            (begin - origin) % t == 0 && ((end - origin) % t == 0 || end == window_end)
        };
        if !aligned(xbegin, spec.x, tw, xend, roi.xend)
            || !aligned(ybegin, spec.y, th, yend, roi.yend)
            || !aligned(zbegin, spec.z, td, zend, roi.zend)
        {
            return Err(IoError::Unsupported(
                "tile range not aligned to the tile grid".into(),
            ));
        }

        let subset = chbegin != 0 || chend != spec.nchannels;
        let req_fmt = format.unwrap_or(spec.format);
        if format.is_none() && subset && spec.per_channel_formats() {
            return Err(IoError::Unsupported(
                "channel subsets of per-channel native data require an explicit format".into(),
            ));
        }
        let nch_req = (chend - chbegin) as usize;
        let full_pixel = if format.is_none() {
            spec.pixel_bytes(true)
        } else {
            spec.nchannels as usize * req_fmt.bytes_per_channel()
        };
        let req_pixel = if format.is_none() {
            spec.channel_bytes_offset(chend as usize, true)
                - spec.channel_bytes_offset(chbegin as usize, true)
        } else {
            nch_req * req_fmt.bytes_per_channel()
        };
        let region_w = (xend - xbegin) as usize;
        let region_h = (yend - ybegin) as usize;
        let region_d = (zend - zbegin) as usize;
        let xs = xstride.unwrap_or(req_pixel);
        let ys = ystride.unwrap_or(region_w * xs);
        let zs = zstride.unwrap_or(region_h * ys);
        check_buffer(data.len(), req_pixel, region_w, region_h, region_d, (xs, ys, zs), "tiles")?;

        let trows_total = ((yend - ybegin) as usize).div_ceil(th as usize)
            * ((zend - zbegin) as usize).div_ceil(td as usize);
        let mut trow = 0usize;
        let mut stage: Vec<u8> = Vec::new();

        let mut tz = zbegin;
        while tz < zend {
            let valid_d = td.min(zend - tz) as usize;
            let mut ty = ybegin;
            while ty < yend {
                let valid_h = th.min(yend - ty) as usize;
                let mut tx = xbegin;
                while tx < xend {
                    let valid_w = tw.min(xend - tx) as usize;
                    let complete = valid_w == tw as usize
                        && valid_h == th as usize
                        && valid_d == td as usize;
                    let doff = (tx - xbegin) as usize * xs
                        + (ty - ybegin) as usize * ys
                        + (tz - zbegin) as usize * zs;
                    if complete && !subset {
                        self.read_tile(
                            tx,
                            ty,
                            tz,
                            format,
                            &mut data[doff..],
                            Some(xs),
                            Some(ys),
                            Some(zs),
                        )?;
                    } else {
                        // Stage the whole tile in the requested format,
                        // then copy the valid sub-rectangle / channel span.
                        let tile_full = spec.tile_pixels() * full_pixel;
                        if stage.len() < tile_full {
                            stage.resize(tile_full, 0);
                        }
                        self.read_tile(tx, ty, tz, format, &mut stage, None, None, None)?;
                        let chan_off = if format.is_none() {
                            spec.channel_bytes_offset(chbegin as usize, true)
                        } else {
                            chbegin as usize * req_fmt.bytes_per_channel()
                        };
                        let srow = tw as usize * full_pixel;
                        for zz in 0..valid_d {
                            for yy in 0..valid_h {
                                for px in 0..valid_w {
                                    let soff = (zz * th as usize + yy) * srow
                                        + px * full_pixel
                                        + chan_off;
                                    let d = doff + zz * zs + yy * ys + px * xs;
                                    data[d..d + req_pixel]
                                        .copy_from_slice(&stage[soff..soff + req_pixel]);
                                }
                            }
                        }
                    }
                    tx += tw;
                }
                ty += th;
                trow += 1;
                if let Some(cb) = progress.as_mut() {
                    if cb(trow as f32 / trows_total.max(1) as f32) {
                        return Ok(());
                    }
                }
            }
            tz += td;
        }
        Ok(())
    }

    /// Reads the entire data window, choosing the scanline or tile
    /// strategy from the spec and the plugin's capabilities.
    fn read_image(
        &mut self,
        format: Option<DataFormat>,
        data: &mut [u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        limits::limits().check_spec(&spec, self.supports(Capability::NoPixels))?;
        let req_fmt = format.unwrap_or(spec.format);
        let req_pixel = if format.is_none() {
            spec.pixel_bytes(true)
        } else {
            spec.nchannels as usize * req_fmt.bytes_per_channel()
        };
        let (xs, ys, zs) =
            ImageSpec::auto_stride(xstride, ystride, zstride, req_pixel, spec.width, spec.height);

        if spec.is_tiled() && self.supports(Capability::Tiles) {
            let roi = spec.roi();
            return self.read_tiles(
                roi.xbegin,
                roi.xend,
                roi.ybegin,
                roi.yend,
                roi.zbegin,
                roi.zend,
                0,
                spec.nchannels,
                format,
                data,
                Some(xs),
                Some(ys),
                Some(zs),
                reborrow(&mut progress),
            );
        }

        let depth = spec.depth.max(1) as usize;
        for slice in 0..depth {
            let zz = spec.z + slice as i32;
            let off = slice * zs;
            self.read_scanlines(
                spec.y,
                spec.y + spec.height as i32,
                zz,
                0,
                spec.nchannels,
                format,
                &mut data[off..],
                Some(xs),
                Some(ys),
                reborrow(&mut progress),
            )?;
        }
        Ok(())
    }
}

/// A format writer plugin.
///
/// Mirrors [`FormatInput`]: implementations provide the native write
/// primitives, the provided methods add conversion, striding and chunking.
pub trait FormatOutput: Send {
    /// Short format name, e.g. `"rbf"`.
    fn format_name(&self) -> &'static str;

    /// Creates/overwrites a file for an image described by `spec`.
    fn open(&mut self, path: &Path, spec: &ImageSpec) -> IoResult<()>;

    /// The descriptor the file was opened with.
    fn spec(&self) -> &ImageSpec;

    /// Capability query.
    fn supports(&self, _capability: Capability) -> bool {
        false
    }

    /// Writes one native scanline (contiguous, native types, all channels).
    fn write_native_scanline(&mut self, y: i32, z: i32, data: &[u8]) -> IoResult<()>;

    /// Writes one native tile (full tile buffer, edge tiles padded).
    fn write_native_tile(&mut self, _x: i32, _y: i32, _z: i32, _data: &[u8]) -> IoResult<()> {
        Err(IoError::Unsupported(format!(
            "{} does not support tiles",
            self.format_name()
        )))
    }

    /// Flushes and closes the file.
    fn close(&mut self) -> IoResult<()> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generic pipeline (provided)
    // ------------------------------------------------------------------

    /// Writes one scanline, converting from `format` (`None` = data is
    /// already native) with pixel stride `xstride`.
    fn write_scanline(
        &mut self,
        y: i32,
        z: i32,
        format: Option<DataFormat>,
        data: &[u8],
        xstride: Option<usize>,
    ) -> IoResult<()> {
        self.write_scanlines(y, y + 1, z, format, data, xstride, None, None)
    }

    /// Writes scanlines `[ybegin, yend)` of slice `z`, converting from the
    /// caller's `format`/strides into the native layout in bounded chunks.
    #[allow(clippy::too_many_arguments)]
    fn write_scanlines(
        &mut self,
        ybegin: i32,
        yend: i32,
        z: i32,
        format: Option<DataFormat>,
        data: &[u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        if ybegin < spec.y || yend > spec.y + spec.height as i32 || ybegin >= yend {
            return Err(IoError::Unsupported(format!(
                "scanline range [{ybegin},{yend}) outside data window"
            )));
        }
        let width = spec.width as usize;
        let nrows_total = (yend - ybegin) as usize;
        let perchan = spec.per_channel_formats();
        let native = format.is_none();
        let src_fmt = format.unwrap_or(spec.format);
        let native_pixel = spec.pixel_bytes(true);
        let src_pixel = if native {
            native_pixel
        } else {
            spec.nchannels as usize * src_fmt.bytes_per_channel()
        };
        let xs = xstride.unwrap_or(src_pixel);
        let ys = ystride.unwrap_or(width * xs);
        check_buffer(data.len(), src_pixel, width, nrows_total, 1, (xs, ys, 0), "scanline")?;

        let row_native = spec.scanline_bytes(true);
        let rows_per_chunk = (PIPELINE_BUFFER_BYTES / row_native.max(1)).max(1);

        let passthrough = xs == native_pixel
            && ys == row_native
            && (native || (src_fmt == spec.format && !perchan));
        if passthrough {
            let mut row = 0usize;
            while row < nrows_total {
                let nrows = rows_per_chunk.min(nrows_total - row);
                for r in 0..nrows {
                    let off = (row + r) * row_native;
                    self.write_native_scanline(
                        ybegin + (row + r) as i32,
                        z,
                        &data[off..off + row_native],
                    )?;
                }
                row += nrows;
                if let Some(cb) = progress.as_mut() {
                    if cb(row as f32 / nrows_total as f32) {
                        return Ok(());
                    }
                }
            }
            return Ok(());
        }

        let mut stage = vec![0u8; rows_per_chunk.min(nrows_total) * row_native];
        let mut row = 0usize;
        while row < nrows_total {
            let nrows = rows_per_chunk.min(nrows_total - row);
            let src = &data[row * ys..];
            if native {
                for r in 0..nrows {
                    for px in 0..width {
                        let soff = r * ys + px * xs;
                        let doff = r * row_native + px * native_pixel;
                        stage[doff..doff + native_pixel]
                            .copy_from_slice(&src[soff..soff + native_pixel]);
                    }
                }
            } else if perchan {
                convert::convert_into_per_channel(
                    &spec.channel_formats,
                    width,
                    nrows,
                    1,
                    src,
                    src_fmt,
                    (xs, ys, 0),
                    &mut stage,
                    (native_pixel, row_native, 0),
                );
            } else {
                convert::convert_image(
                    spec.nchannels as usize,
                    width,
                    nrows,
                    1,
                    src,
                    src_fmt,
                    (xs, ys, 0),
                    &mut stage,
                    spec.format,
                    (native_pixel, row_native, 0),
                );
            }
            for r in 0..nrows {
                let off = r * row_native;
                self.write_native_scanline(
                    ybegin + (row + r) as i32,
                    z,
                    &stage[off..off + row_native],
                )?;
            }
            row += nrows;
            if let Some(cb) = progress.as_mut() {
                if cb(row as f32 / nrows_total as f32) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Writes one tile, converting from the caller's layout.
    #[allow(clippy::too_many_arguments)]
    fn write_tile(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        format: Option<DataFormat>,
        data: &[u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        if !spec.is_tiled() {
            return Err(IoError::Unsupported(format!(
                "{} image is not tiled",
                self.format_name()
            )));
        }
        let (tw, th, td) = (
            spec.tile_width as usize,
            spec.tile_height as usize,
            spec.tile_depth.max(1) as usize,
        );
        if (x - spec.x) % tw as i32 != 0
            || (y - spec.y) % th as i32 != 0
            || (z - spec.z) % td as i32 != 0
        {
            return Err(IoError::Unsupported(format!(
                "tile coordinates ({x}, {y}, {z}) not aligned to {tw}x{th}x{td} grid"
            )));
        }
        let perchan = spec.per_channel_formats();
        let native = format.is_none();
        let src_fmt = format.unwrap_or(spec.format);
        let native_pixel = spec.pixel_bytes(true);
        let src_pixel = if native {
            native_pixel
        } else {
            spec.nchannels as usize * src_fmt.bytes_per_channel()
        };
        let xs = xstride.unwrap_or(src_pixel);
        let ys = ystride.unwrap_or(tw * xs);
        let zs = zstride.unwrap_or(th * ys);
        check_buffer(data.len(), src_pixel, tw, th, td, (xs, ys, zs), "tile")?;

        let contiguous = xs == src_pixel && ys == tw * xs && zs == th * ys;
        if contiguous && (native || (src_fmt == spec.format && !perchan)) {
            return self.write_native_tile(x, y, z, data);
        }

        let mut stage = vec![0u8; spec.tile_bytes(true)];
        let row_native = tw * native_pixel;
        if native {
            for zz in 0..td {
                for yy in 0..th {
                    for px in 0..tw {
                        let soff = zz * zs + yy * ys + px * xs;
                        let doff = (zz * th + yy) * row_native + px * native_pixel;
                        stage[doff..doff + native_pixel]
                            .copy_from_slice(&data[soff..soff + native_pixel]);
                    }
                }
            }
        } else if perchan {
            convert::convert_into_per_channel(
                &spec.channel_formats,
                tw,
                th,
                td,
                data,
                src_fmt,
                (xs, ys, zs),
                &mut stage,
                (native_pixel, row_native, th * row_native),
            );
        } else {
            convert::convert_image(
                spec.nchannels as usize,
                tw,
                th,
                td,
                data,
                src_fmt,
                (xs, ys, zs),
                &mut stage,
                spec.format,
                (native_pixel, row_native, th * row_native),
            );
        }
        self.write_native_tile(x, y, z, &stage)
    }

    /// Writes the entire data window, choosing scanline or tile strategy.
    fn write_image(
        &mut self,
        format: Option<DataFormat>,
        data: &[u8],
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
        mut progress: Option<ProgressCallback<'_>>,
    ) -> IoResult<()> {
        let spec = self.spec().clone();
        let src_fmt = format.unwrap_or(spec.format);
        let src_pixel = if format.is_none() {
            spec.pixel_bytes(true)
        } else {
            spec.nchannels as usize * src_fmt.bytes_per_channel()
        };
        let (xs, ys, zs) =
            ImageSpec::auto_stride(xstride, ystride, zstride, src_pixel, spec.width, spec.height);

        if spec.is_tiled() && self.supports(Capability::Tiles) {
            let (tw, th, td) = (
                spec.tile_width as i32,
                spec.tile_height as i32,
                spec.tile_depth.max(1) as i32,
            );
            let roi = spec.roi();
            // Edge tiles stage through a zero-padded full tile.
            let mut stage = vec![0u8; spec.tile_pixels() * src_pixel];
            let trows_total = (spec.height as usize).div_ceil(th as usize)
                * (spec.depth.max(1) as usize).div_ceil(td as usize);
            let mut trow = 0usize;
            let mut tz = roi.zbegin;
            while tz < roi.zend {
                let valid_d = td.min(roi.zend - tz) as usize;
                let mut ty = roi.ybegin;
                while ty < roi.yend {
                    let valid_h = th.min(roi.yend - ty) as usize;
                    let mut tx = roi.xbegin;
                    while tx < roi.xend {
                        let valid_w = tw.min(roi.xend - tx) as usize;
                        let soff = (tx - roi.xbegin) as usize * xs
                            + (ty - roi.ybegin) as usize * ys
                            + (tz - roi.zbegin) as usize * zs;
                        let complete = valid_w == tw as usize
                            && valid_h == th as usize
                            && valid_d == td as usize;
                        if complete {
                            self.write_tile(
                                tx,
                                ty,
                                tz,
                                format,
                                &data[soff..],
                                Some(xs),
                                Some(ys),
                                Some(zs),
                            )?;
                        } else {
                            stage.fill(0);
                            let srow = tw as usize * src_pixel;
                            for zz in 0..valid_d {
                                for yy in 0..valid_h {
                                    for px in 0..valid_w {
                                        let s = soff + zz * zs + yy * ys + px * xs;
                                        let d = (zz * th as usize + yy) * srow + px * src_pixel;
                                        stage[d..d + src_pixel]
                                            .copy_from_slice(&data[s..s + src_pixel]);
                                    }
                                }
                            }
                            self.write_tile(tx, ty, tz, format, &stage, None, None, None)?;
                        }
                        tx += tw;
                    }
                    ty += th;
                    trow += 1;
                    if let Some(cb) = progress.as_mut() {
                        if cb(trow as f32 / trows_total.max(1) as f32) {
                            return Ok(());
                        }
                    }
                }
                tz += td;
            }
            return Ok(());
        }

        let depth = spec.depth.max(1) as usize;
        for slice in 0..depth {
            let zz = spec.z + slice as i32;
            let off = slice * zs;
            self.write_scanlines(
                spec.y,
                spec.y + spec.height as i32,
                zz,
                format,
                &data[off..],
                Some(xs),
                Some(ys),
                reborrow(&mut progress),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny in-memory plugin exercising the provided pipeline methods.
    struct MemInput {
        spec: ImageSpec,
        pixels: Vec<u8>, // native, contiguous, scanline-major
        native_reads: usize,
    }

    impl MemInput {
        fn gradient(width: u32, height: u32) -> Self {
            let spec = ImageSpec::new(width, height, 1, DataFormat::F32);
            let mut pixels = vec![0u8; (width * height * 4) as usize];
            for y in 0..height {
                for x in 0..width {
                    let v = (y * width + x) as f32;
                    let off = ((y * width + x) * 4) as usize;
                    pixels[off..off + 4].copy_from_slice(&v.to_ne_bytes());
                }
            }
            Self {
                spec,
                pixels,
                native_reads: 0,
            }
        }
    }

    impl FormatInput for MemInput {
        fn format_name(&self) -> &'static str {
            "mem"
        }
        fn open(&mut self, _path: &Path, _config: Option<&ImageSpec>) -> IoResult<()> {
            Ok(())
        }
        fn spec(&self) -> &ImageSpec {
            &self.spec
        }
        fn seek(&mut self, subimage: usize, miplevel: usize) -> IoResult<()> {
            if subimage == 0 && miplevel == 0 {
                Ok(())
            } else {
                Err(IoError::Unsupported("single image".into()))
            }
        }
        fn read_native_scanline(&mut self, y: i32, _z: i32, data: &mut [u8]) -> IoResult<()> {
            self.native_reads += 1;
            let row = self.spec.scanline_bytes(true);
            let off = y as usize * row;
            data[..row].copy_from_slice(&self.pixels[off..off + row]);
            Ok(())
        }
    }

    #[test]
    fn test_native_passthrough() {
        let mut input = MemInput::gradient(8, 4);
        let mut out = vec![0u8; 8 * 4 * 4];
        input
            .read_scanlines(0, 4, 0, 0, 1, None, &mut out, None, None, None)
            .unwrap();
        assert_eq!(out, input.pixels);
        assert_eq!(input.native_reads, 4);
    }

    #[test]
    fn test_converting_read() {
        let mut input = MemInput::gradient(4, 2);
        // f32 native values 0..8 -> u8 with clamping.
        let mut out = vec![0u8; 4 * 2];
        input
            .read_scanlines(0, 2, 0, 0, 1, Some(DataFormat::U8), &mut out, None, None, None)
            .unwrap();
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 255); // 1.0 -> 255
        assert_eq!(out[7], 255); // 7.0 clamps
    }

    #[test]
    fn test_progress_cancel() {
        let mut input = MemInput::gradient(4, 4);
        let mut out = vec![0u8; 4 * 4 * 4];
        let mut calls = 0usize;
        let mut cb = |_f: f32| {
            calls += 1;
            true // cancel immediately
        };
        input
            .read_scanlines(0, 4, 0, 0, 1, None, &mut out, None, None, Some(&mut cb))
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_range_validation() {
        let mut input = MemInput::gradient(4, 4);
        let mut out = vec![0u8; 1024];
        assert!(input
            .read_scanlines(0, 5, 0, 0, 1, None, &mut out, None, None, None)
            .is_err());
        assert!(input
            .read_scanlines(0, 4, 0, 0, 2, None, &mut out, None, None, None)
            .is_err());
    }
}
