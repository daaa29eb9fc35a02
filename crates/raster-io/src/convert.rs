//! Pixel value conversion between data formats and stride layouts.
//!
//! This is the conversion half of the generic I/O pipeline: everything here
//! operates on raw byte buffers described by a [`DataFormat`] and byte
//! strides, so the same code serves file readers, writers, cursors and
//! buffer copies.
//!
//! Conversion semantics (shared workspace-wide): integer values map onto
//! [0, 1] by their format's normalize factor; floats convert back by
//! clamping to [0, 1] and scaling; integer-to-integer rescales through f64.

use half::f16;
use raster_core::DataFormat;

/// Reads one channel value as f64 from native-endian bytes.
///
/// `bytes` must hold at least `fmt.bytes_per_channel()` bytes.
#[inline]
pub fn read_as_f64(fmt: DataFormat, bytes: &[u8]) -> f64 {
    match fmt {
        DataFormat::U8 => bytes[0] as f64 / 255.0,
        DataFormat::U16 => {
            u16::from_ne_bytes([bytes[0], bytes[1]]) as f64 / 65535.0
        }
        DataFormat::U32 => {
            u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64 / 4294967295.0
        }
        DataFormat::F16 => f16::from_ne_bytes([bytes[0], bytes[1]]).to_f64(),
        DataFormat::F32 => {
            f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
        }
    }
}

/// Reads one channel value as f32 from native-endian bytes.
#[inline]
pub fn read_as_f32(fmt: DataFormat, bytes: &[u8]) -> f32 {
    read_as_f64(fmt, bytes) as f32
}

/// Writes one channel value from f64 into native-endian bytes.
///
/// `bytes` must hold at least `fmt.bytes_per_channel()` bytes.
#[inline]
pub fn write_f64(fmt: DataFormat, v: f64, bytes: &mut [u8]) {
    match fmt {
        DataFormat::U8 => {
            bytes[0] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        DataFormat::U16 => {
            let q = (v.clamp(0.0, 1.0) * 65535.0).round() as u16;
            bytes[..2].copy_from_slice(&q.to_ne_bytes());
        }
        DataFormat::U32 => {
            let q = (v.clamp(0.0, 1.0) * 4294967295.0).round() as u32;
            bytes[..4].copy_from_slice(&q.to_ne_bytes());
        }
        DataFormat::F16 => {
            bytes[..2].copy_from_slice(&f16::from_f64(v).to_ne_bytes());
        }
        DataFormat::F32 => {
            bytes[..4].copy_from_slice(&(v as f32).to_ne_bytes());
        }
    }
}

/// Writes one channel value from f32 into native-endian bytes.
#[inline]
pub fn write_f32(fmt: DataFormat, v: f32, bytes: &mut [u8]) {
    if fmt == DataFormat::F32 {
        bytes[..4].copy_from_slice(&v.to_ne_bytes());
    } else {
        write_f64(fmt, v as f64, bytes);
    }
}

/// Converts `nvalues` contiguous channel values in one pass.
///
/// The fast path for identical formats is a plain byte copy.
pub fn convert_types(
    src_fmt: DataFormat,
    src: &[u8],
    dst_fmt: DataFormat,
    dst: &mut [u8],
    nvalues: usize,
) {
    let ss = src_fmt.bytes_per_channel();
    let ds = dst_fmt.bytes_per_channel();
    if src_fmt == dst_fmt {
        dst[..nvalues * ds].copy_from_slice(&src[..nvalues * ss]);
        return;
    }
    for i in 0..nvalues {
        let v = read_as_f64(src_fmt, &src[i * ss..]);
        write_f64(dst_fmt, v, &mut dst[i * ds..]);
    }
}

/// Converts a pixel rectangle between formats and stride layouts.
///
/// Within each pixel, the `nchannels` values are contiguous on both sides;
/// the strides give the byte distance between pixels, rows and slices.
/// Handles de-interleaving into non-contiguous caller layouts while
/// converting, in a single pass.
#[allow(clippy::too_many_arguments)]
pub fn convert_image(
    nchannels: usize,
    width: usize,
    height: usize,
    depth: usize,
    src: &[u8],
    src_fmt: DataFormat,
    src_strides: (usize, usize, usize),
    dst: &mut [u8],
    dst_fmt: DataFormat,
    dst_strides: (usize, usize, usize),
) {
    let (sxs, sys, szs) = src_strides;
    let (dxs, dys, dzs) = dst_strides;
    let same = src_fmt == dst_fmt;
    let ss = src_fmt.bytes_per_channel();
    let ds = dst_fmt.bytes_per_channel();
    let src_pixel = nchannels * ss;
    let dst_pixel = nchannels * ds;

    for z in 0..depth {
        for y in 0..height {
            let mut soff = z * szs + y * sys;
            let mut doff = z * dzs + y * dys;
            // A fully contiguous same-format row collapses to one copy.
            if same && sxs == src_pixel && dxs == dst_pixel {
                let n = width * src_pixel;
                dst[doff..doff + n].copy_from_slice(&src[soff..soff + n]);
                continue;
            }
            for _x in 0..width {
                if same {
                    dst[doff..doff + dst_pixel].copy_from_slice(&src[soff..soff + src_pixel]);
                } else {
                    for c in 0..nchannels {
                        let v = read_as_f64(src_fmt, &src[soff + c * ss..]);
                        write_f64(dst_fmt, v, &mut dst[doff + c * ds..]);
                    }
                }
                soff += sxs;
                doff += dxs;
            }
        }
    }
}

/// Converts a rectangle whose source channels have heterogeneous types.
///
/// `channel_formats` describes the native per-channel layout (channels
/// packed in order within each source pixel). Runs of adjacent channels
/// sharing one type are coalesced into single [`convert_image`] passes to
/// keep the pass count low.
#[allow(clippy::too_many_arguments)]
pub fn convert_per_channel(
    channel_formats: &[DataFormat],
    width: usize,
    height: usize,
    depth: usize,
    src: &[u8],
    src_strides: (usize, usize, usize),
    dst: &mut [u8],
    dst_fmt: DataFormat,
    dst_strides: (usize, usize, usize),
) {
    let ds = dst_fmt.bytes_per_channel();
    let mut src_offset = 0usize;
    let mut dst_offset = 0usize;
    let mut c = 0usize;
    while c < channel_formats.len() {
        let fmt = channel_formats[c];
        let mut run = 1usize;
        while c + run < channel_formats.len() && channel_formats[c + run] == fmt {
            run += 1;
        }
        convert_image(
            run,
            width,
            height,
            depth,
            &src[src_offset..],
            fmt,
            src_strides,
            &mut dst[dst_offset..],
            dst_fmt,
            dst_strides,
        );
        src_offset += run * fmt.bytes_per_channel();
        dst_offset += run * ds;
        c += run;
    }
}

/// Converts a uniform-format rectangle into a heterogeneous per-channel
/// destination layout (the write-path mirror of [`convert_per_channel`]).
///
/// `channel_formats` describes the destination pixel; source channels are
/// packed `src_fmt` values. Runs of same-typed destination channels are
/// coalesced as in the read direction.
#[allow(clippy::too_many_arguments)]
pub fn convert_into_per_channel(
    channel_formats: &[DataFormat],
    width: usize,
    height: usize,
    depth: usize,
    src: &[u8],
    src_fmt: DataFormat,
    src_strides: (usize, usize, usize),
    dst: &mut [u8],
    dst_strides: (usize, usize, usize),
) {
    let ss = src_fmt.bytes_per_channel();
    let mut src_offset = 0usize;
    let mut dst_offset = 0usize;
    let mut c = 0usize;
    while c < channel_formats.len() {
        let fmt = channel_formats[c];
        let mut run = 1usize;
        while c + run < channel_formats.len() && channel_formats[c + run] == fmt {
            run += 1;
        }
        convert_image(
            run,
            width,
            height,
            depth,
            &src[src_offset..],
            src_fmt,
            src_strides,
            &mut dst[dst_offset..],
            fmt,
            dst_strides,
        );
        src_offset += run * ss;
        dst_offset += run * fmt.bytes_per_channel();
        c += run;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip() {
        let mut buf = [0u8; 4];
        write_f32(DataFormat::U8, 0.5, &mut buf);
        assert_eq!(buf[0], 128);
        assert!((read_as_f32(DataFormat::U8, &buf) - 128.0 / 255.0).abs() < 1e-6);

        write_f32(DataFormat::F16, 0.25, &mut buf);
        assert_eq!(read_as_f32(DataFormat::F16, &buf), 0.25);

        write_f32(DataFormat::F32, -1.5, &mut buf);
        assert_eq!(read_as_f32(DataFormat::F32, &buf), -1.5);
    }

    #[test]
    fn test_float_not_clamped_int_clamped() {
        let mut buf = [0u8; 4];
        // Floats carry HDR values through untouched.
        write_f32(DataFormat::F32, 7.0, &mut buf);
        assert_eq!(read_as_f32(DataFormat::F32, &buf), 7.0);
        // Integers clamp.
        write_f32(DataFormat::U16, 7.0, &mut buf);
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 65535);
    }

    #[test]
    fn test_convert_types_u8_to_u16() {
        let src = [0u8, 128, 255];
        let mut dst = [0u8; 6];
        convert_types(DataFormat::U8, &src, DataFormat::U16, &mut dst, 3);
        let v1 = u16::from_ne_bytes([dst[2], dst[3]]);
        let v2 = u16::from_ne_bytes([dst[4], dst[5]]);
        // 128/255 rescaled into the 16-bit range.
        assert_eq!(v1, (128.0f64 / 255.0 * 65535.0).round() as u16);
        assert_eq!(v2, 65535);
    }

    #[test]
    fn test_convert_image_strided() {
        // 2x2 single-channel f32, converted into a strided u8 layout with
        // a 3-byte pixel stride (only the first byte of each written).
        let mut src = vec![0u8; 16];
        for (i, v) in [0.0f32, 1.0, 0.5, 0.25].iter().enumerate() {
            src[i * 4..i * 4 + 4].copy_from_slice(&v.to_ne_bytes());
        }
        let mut dst = vec![0xAAu8; 2 * 2 * 3];
        convert_image(
            1,
            2,
            2,
            1,
            &src,
            DataFormat::F32,
            (4, 8, 16),
            &mut dst,
            DataFormat::U8,
            (3, 6, 12),
        );
        assert_eq!(dst[0], 0);
        assert_eq!(dst[3], 255);
        assert_eq!(dst[6], 128);
        assert_eq!(dst[9], 64);
        // Stride gaps untouched.
        assert_eq!(dst[1], 0xAA);
    }

    #[test]
    fn test_convert_per_channel_coalesces() {
        // Pixel layout: [f16, f16, u32] -> f32. The two f16 channels
        // convert in one pass, the u32 channel in another.
        let formats = [DataFormat::F16, DataFormat::F16, DataFormat::U32];
        let native_pixel = 2 + 2 + 4;
        let mut src = vec![0u8; 2 * native_pixel];
        for px in 0..2usize {
            let base = px * native_pixel;
            src[base..base + 2].copy_from_slice(&f16::from_f32(0.5).to_ne_bytes());
            src[base + 2..base + 4].copy_from_slice(&f16::from_f32(1.0).to_ne_bytes());
            src[base + 4..base + 8].copy_from_slice(&u32::MAX.to_ne_bytes());
        }
        let mut dst = vec![0u8; 2 * 3 * 4];
        convert_per_channel(
            &formats,
            2,
            1,
            1,
            &src,
            (native_pixel, 2 * native_pixel, 2 * native_pixel),
            &mut dst,
            DataFormat::F32,
            (12, 24, 24),
        );
        let v = |i: usize| f32::from_ne_bytes(dst[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(v(0), 0.5);
        assert_eq!(v(1), 1.0);
        assert_eq!(v(2), 1.0); // u32::MAX normalizes to 1.0
        assert_eq!(v(3), 0.5);
    }
}
