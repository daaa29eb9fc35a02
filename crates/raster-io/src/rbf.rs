//! Built-in "raster buffer file" codec.
//!
//! A deliberately simple native container used for lossless round-trips
//! and as the reference implementation of the plugin boundary: a fixed
//! little-endian header carrying the full descriptor, followed by raw
//! native pixels, scanline-major or tile-major. No compression, no
//! byte-order surprises across a round-trip on one machine.
//!
//! Layout:
//!
//! ```text
//! "RBF1"
//! data window   (i32 x, y, z; u32 w, h, d)
//! full window   (i32 fx, fy, fz; u32 fw, fh, fd)
//! tile size     (u32 tw, th, td; 0 = scanline organization)
//! channels      (u32 count; u8 format code; u8 flags; per-channel codes)
//! alpha/z index (i32, i32)
//! channel names (u32 count; u16 len + utf8 each)
//! attributes    (u32 count; name + tag + payload each)
//! pixel data    (scanlines in y order per z slice, or tiles in grid
//!                row-major order, edge tiles padded to full size)
//! ```

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;

use raster_core::{AttrValue, DataFormat, ImageSpec};

use crate::error::{IoError, IoResult};
use crate::limits;
use crate::plugin::{Capability, FormatInput, FormatOutput};
use crate::registry::FormatFactory;

const MAGIC: &[u8; 4] = b"RBF1";

const FLAG_DEEP: u8 = 1;

fn format_code(fmt: DataFormat) -> u8 {
    match fmt {
        DataFormat::U8 => 0,
        DataFormat::U16 => 1,
        DataFormat::U32 => 2,
        DataFormat::F16 => 3,
        DataFormat::F32 => 4,
    }
}

fn format_from_code(code: u8) -> IoResult<DataFormat> {
    match code {
        0 => Ok(DataFormat::U8),
        1 => Ok(DataFormat::U16),
        2 => Ok(DataFormat::U32),
        3 => Ok(DataFormat::F16),
        4 => Ok(DataFormat::F32),
        other => Err(IoError::InvalidFile(format!("unknown format code {other}"))),
    }
}

fn scanline_offset(spec: &ImageSpec, data_start: u64, y: i32, z: i32) -> IoResult<u64> {
    let roi = spec.roi();
    if y < roi.ybegin || y >= roi.yend || z < roi.zbegin || z >= roi.zend {
        return Err(IoError::Unsupported(format!(
            "scanline ({y}, {z}) outside data window"
        )));
    }
    let row = spec.scanline_bytes(true) as u64;
    let rows_per_slice = spec.height as u64;
    let idx = (z - spec.z) as u64 * rows_per_slice + (y - spec.y) as u64;
    Ok(data_start + idx * row)
}

fn tile_offset(spec: &ImageSpec, data_start: u64, x: i32, y: i32, z: i32) -> IoResult<u64> {
    let (tw, th, td) = (
        spec.tile_width as i32,
        spec.tile_height as i32,
        spec.tile_depth.max(1) as i32,
    );
    let roi = spec.roi();
    if !roi.contains(x, y, z)
        || (x - spec.x) % tw != 0
        || (y - spec.y) % th != 0
        || (z - spec.z) % td != 0
    {
        return Err(IoError::Unsupported(format!(
            "tile corner ({x}, {y}, {z}) invalid"
        )));
    }
    let tiles_x = spec.width.div_ceil(spec.tile_width) as u64;
    let tiles_y = spec.height.div_ceil(spec.tile_height) as u64;
    let tx = ((x - spec.x) / tw) as u64;
    let ty = ((y - spec.y) / th) as u64;
    let tz = ((z - spec.z) / td) as u64;
    let idx = (tz * tiles_y + ty) * tiles_x + tx;
    Ok(data_start + idx * spec.tile_bytes(true) as u64)
}

fn write_short_string(w: &mut impl Write, s: &str) -> IoResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(IoError::Encode(format!("string too long: {} bytes", bytes.len())));
    }
    w.write_u16::<LE>(bytes.len() as u16)?;
    w.write_all(bytes)?;
    Ok(())
}

fn read_short_string(r: &mut impl Read) -> IoResult<String> {
    let len = r.read_u16::<LE>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| IoError::InvalidFile("non-utf8 string".into()))
}

fn write_header(w: &mut impl Write, spec: &ImageSpec) -> IoResult<()> {
    w.write_all(MAGIC)?;
    w.write_i32::<LE>(spec.x)?;
    w.write_i32::<LE>(spec.y)?;
    w.write_i32::<LE>(spec.z)?;
    w.write_u32::<LE>(spec.width)?;
    w.write_u32::<LE>(spec.height)?;
    w.write_u32::<LE>(spec.depth)?;
    w.write_i32::<LE>(spec.full_x)?;
    w.write_i32::<LE>(spec.full_y)?;
    w.write_i32::<LE>(spec.full_z)?;
    w.write_u32::<LE>(spec.full_width)?;
    w.write_u32::<LE>(spec.full_height)?;
    w.write_u32::<LE>(spec.full_depth)?;
    w.write_u32::<LE>(spec.tile_width)?;
    w.write_u32::<LE>(spec.tile_height)?;
    w.write_u32::<LE>(spec.tile_depth)?;
    w.write_u32::<LE>(spec.nchannels)?;
    w.write_u8(format_code(spec.format))?;
    w.write_u8(if spec.deep { FLAG_DEEP } else { 0 })?;
    w.write_u16::<LE>(spec.channel_formats.len() as u16)?;
    for fmt in &spec.channel_formats {
        w.write_u8(format_code(*fmt))?;
    }
    w.write_i32::<LE>(spec.alpha_channel)?;
    w.write_i32::<LE>(spec.z_channel)?;
    w.write_u32::<LE>(spec.channel_names.len() as u32)?;
    for name in &spec.channel_names {
        write_short_string(w, name)?;
    }
    // Arrays are not persisted; nothing in the workspace round-trips them.
    let persisted: Vec<_> = spec
        .attributes
        .iter()
        .filter(|(_, v)| {
            matches!(
                v,
                AttrValue::Int(_) | AttrValue::Float(_) | AttrValue::String(_)
            )
        })
        .collect();
    w.write_u32::<LE>(persisted.len() as u32)?;
    for (name, value) in persisted {
        write_short_string(w, name)?;
        match value {
            AttrValue::Int(v) => {
                w.write_u8(0)?;
                w.write_i64::<LE>(*v)?;
            }
            AttrValue::Float(v) => {
                w.write_u8(1)?;
                w.write_f64::<LE>(*v)?;
            }
            AttrValue::String(s) => {
                w.write_u8(2)?;
                write_short_string(w, s)?;
            }
            _ => unreachable!(),
        }
    }
    Ok(())
}

fn read_header(r: &mut impl Read) -> IoResult<ImageSpec> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(IoError::InvalidFile("bad magic".into()));
    }
    let mut spec = ImageSpec::empty();
    spec.x = r.read_i32::<LE>()?;
    spec.y = r.read_i32::<LE>()?;
    spec.z = r.read_i32::<LE>()?;
    spec.width = r.read_u32::<LE>()?;
    spec.height = r.read_u32::<LE>()?;
    spec.depth = r.read_u32::<LE>()?;
    spec.full_x = r.read_i32::<LE>()?;
    spec.full_y = r.read_i32::<LE>()?;
    spec.full_z = r.read_i32::<LE>()?;
    spec.full_width = r.read_u32::<LE>()?;
    spec.full_height = r.read_u32::<LE>()?;
    spec.full_depth = r.read_u32::<LE>()?;
    spec.tile_width = r.read_u32::<LE>()?;
    spec.tile_height = r.read_u32::<LE>()?;
    spec.tile_depth = r.read_u32::<LE>()?;
    spec.nchannels = r.read_u32::<LE>()?;
    spec.format = format_from_code(r.read_u8()?)?;
    let flags = r.read_u8()?;
    spec.deep = flags & FLAG_DEEP != 0;
    let nformats = r.read_u16::<LE>()? as usize;
    let mut formats = SmallVec::new();
    for _ in 0..nformats {
        formats.push(format_from_code(r.read_u8()?)?);
    }
    spec.channel_formats = formats;
    spec.alpha_channel = r.read_i32::<LE>()?;
    spec.z_channel = r.read_i32::<LE>()?;
    let nnames = r.read_u32::<LE>()? as usize;
    // Bound name/attr counts by the channel ceiling before allocating.
    if nnames > u16::MAX as usize {
        return Err(IoError::InvalidFile(format!("{nnames} channel names")));
    }
    for _ in 0..nnames {
        let name = read_short_string(r)?;
        spec.channel_names.push(name);
    }
    let nattrs = r.read_u32::<LE>()? as usize;
    if nattrs > u16::MAX as usize {
        return Err(IoError::InvalidFile(format!("{nattrs} attributes")));
    }
    for _ in 0..nattrs {
        let name = read_short_string(r)?;
        match r.read_u8()? {
            0 => spec.set_attr(name, r.read_i64::<LE>()?),
            1 => spec.set_attr(name, r.read_f64::<LE>()?),
            2 => {
                let s = read_short_string(r)?;
                spec.set_attr(name, s);
            }
            tag => return Err(IoError::InvalidFile(format!("unknown attr tag {tag}"))),
        }
    }
    Ok(spec)
}

/// Reader for `.rbf` files.
#[derive(Default)]
pub struct RbfInput {
    file: Option<File>,
    spec: ImageSpec,
    data_start: u64,
}

impl RbfInput {
    /// Creates an unopened reader.
    pub fn new() -> Self {
        Self::default()
    }

    fn file(&mut self) -> IoResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| IoError::Unsupported("no file open".into()))
    }
}

impl FormatInput for RbfInput {
    fn format_name(&self) -> &'static str {
        "rbf"
    }

    fn open(&mut self, path: &Path, _config: Option<&ImageSpec>) -> IoResult<()> {
        let mut file = File::open(path)?;
        let spec = read_header(&mut file)?;
        limits::limits().check_spec(&spec, false)?;
        self.data_start = file.stream_position()?;
        self.spec = spec;
        self.file = Some(file);
        Ok(())
    }

    fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::Tiles | Capability::PerChannelFormats
        )
    }

    fn seek(&mut self, subimage: usize, miplevel: usize) -> IoResult<()> {
        if subimage != 0 || miplevel != 0 {
            return Err(IoError::Unsupported(
                "rbf files hold a single subimage".into(),
            ));
        }
        Ok(())
    }

    fn read_native_scanline(&mut self, y: i32, z: i32, data: &mut [u8]) -> IoResult<()> {
        if self.spec.is_tiled() {
            return Err(IoError::Unsupported(
                "scanline read from a tiled file".into(),
            ));
        }
        if self.spec.deep {
            return Err(IoError::Unsupported("deep files have no flat pixels".into()));
        }
        let row = self.spec.scanline_bytes(true);
        let offset = scanline_offset(&self.spec, self.data_start, y, z)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data[..row])?;
        Ok(())
    }

    fn read_native_tile(&mut self, x: i32, y: i32, z: i32, data: &mut [u8]) -> IoResult<()> {
        if !self.spec.is_tiled() {
            return Err(IoError::Unsupported("tile read from a scanline file".into()));
        }
        if self.spec.deep {
            return Err(IoError::Unsupported("deep files have no flat pixels".into()));
        }
        let nbytes = self.spec.tile_bytes(true);
        let offset = tile_offset(&self.spec, self.data_start, x, y, z)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data[..nbytes])?;
        Ok(())
    }
}

/// Writer for `.rbf` files.
#[derive(Default)]
pub struct RbfOutput {
    file: Option<File>,
    spec: ImageSpec,
    data_start: u64,
}

impl RbfOutput {
    /// Creates an unopened writer.
    pub fn new() -> Self {
        Self::default()
    }

    fn file(&mut self) -> IoResult<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| IoError::Unsupported("no file open".into()))
    }
}

impl FormatOutput for RbfOutput {
    fn format_name(&self) -> &'static str {
        "rbf"
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::Tiles | Capability::PerChannelFormats
        )
    }

    fn open(&mut self, path: &Path, spec: &ImageSpec) -> IoResult<()> {
        if spec.deep {
            return Err(IoError::Unsupported(
                "rbf does not store deep pixels".into(),
            ));
        }
        limits::limits().check_spec(spec, false)?;
        let mut file = File::create(path)?;
        write_header(&mut file, spec)?;
        self.data_start = file.stream_position()?;
        // Size the file up front so out-of-order tile writes land cleanly.
        let total = if spec.is_tiled() {
            let tiles = spec.width.div_ceil(spec.tile_width) as u64
                * spec.height.div_ceil(spec.tile_height) as u64
                * spec.depth.max(1).div_ceil(spec.tile_depth.max(1)) as u64;
            tiles * spec.tile_bytes(true) as u64
        } else {
            spec.image_bytes(true)
        };
        file.set_len(self.data_start + total)?;
        self.spec = spec.clone();
        self.file = Some(file);
        Ok(())
    }

    fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    fn write_native_scanline(&mut self, y: i32, z: i32, data: &[u8]) -> IoResult<()> {
        if self.spec.is_tiled() {
            return Err(IoError::Unsupported(
                "scanline write to a tiled file".into(),
            ));
        }
        let row = self.spec.scanline_bytes(true);
        let offset = scanline_offset(&self.spec, self.data_start, y, z)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data[..row])?;
        Ok(())
    }

    fn write_native_tile(&mut self, x: i32, y: i32, z: i32, data: &[u8]) -> IoResult<()> {
        if !self.spec.is_tiled() {
            return Err(IoError::Unsupported("tile write to a scanline file".into()));
        }
        let nbytes = self.spec.tile_bytes(true);
        let offset = tile_offset(&self.spec, self.data_start, x, y, z)?;
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&data[..nbytes])?;
        Ok(())
    }

    fn close(&mut self) -> IoResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Registry factory for the rbf format.
pub struct RbfFactory;

impl FormatFactory for RbfFactory {
    fn format_name(&self) -> &'static str {
        "rbf"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rbf"]
    }

    fn matches_magic(&self, header: &[u8]) -> bool {
        header.len() >= 4 && &header[..4] == MAGIC
    }

    fn create_input(&self) -> Box<dyn FormatInput> {
        Box::new(RbfInput::new())
    }

    fn create_output(&self) -> Option<Box<dyn FormatOutput>> {
        Some(Box::new(RbfOutput::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster_core::Roi;

    fn ramp_spec() -> ImageSpec {
        let mut spec = ImageSpec::new(8, 6, 3, DataFormat::U16);
        spec.channel_names = vec!["R".into(), "G".into(), "B".into()];
        spec.set_attr("Software", "raster-rs");
        spec.set_attr("Frame", 42);
        spec
    }

    fn ramp_pixels(spec: &ImageSpec) -> Vec<u8> {
        let mut data = vec![0u8; spec.image_bytes(true) as usize];
        let px = spec.pixel_bytes(true);
        for y in 0..spec.height as usize {
            for x in 0..spec.width as usize {
                for c in 0..spec.nchannels as usize {
                    let v = ((y * 8 + x) * 3 + c) as u16;
                    let off = (y * spec.width as usize + x) * px + c * 2;
                    data[off..off + 2].copy_from_slice(&v.to_ne_bytes());
                }
            }
        }
        data
    }

    #[test]
    fn test_scanline_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.rbf");
        let spec = ramp_spec();
        let pixels = ramp_pixels(&spec);

        let mut out = RbfOutput::new();
        out.open(&path, &spec).unwrap();
        out.write_image(None, &pixels, None, None, None, None).unwrap();
        out.close().unwrap();

        let mut input = RbfInput::new();
        input.open(&path, None).unwrap();
        assert_eq!(input.spec().width, 8);
        assert_eq!(input.spec().format, DataFormat::U16);
        assert_eq!(input.spec().get_string("Software"), Some("raster-rs"));
        assert_eq!(input.spec().get_int("Frame"), Some(42));
        assert_eq!(
            input.spec().channel_names,
            vec!["R".to_string(), "G".to_string(), "B".to_string()]
        );

        let mut back = vec![0u8; pixels.len()];
        input.read_image(None, &mut back, None, None, None, None).unwrap();
        assert_eq!(back, pixels);
    }

    #[test]
    fn test_tiled_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiled.rbf");
        let mut spec = ImageSpec::new(10, 10, 1, DataFormat::F32);
        spec.tile_width = 4;
        spec.tile_height = 4;
        spec.tile_depth = 1;
        let mut pixels = vec![0u8; spec.image_bytes(true) as usize];
        for i in 0..100usize {
            pixels[i * 4..i * 4 + 4].copy_from_slice(&(i as f32).to_ne_bytes());
        }

        let mut out = RbfOutput::new();
        out.open(&path, &spec).unwrap();
        out.write_image(None, &pixels, None, None, None, None).unwrap();
        out.close().unwrap();

        let mut input = RbfInput::new();
        input.open(&path, None).unwrap();
        assert!(input.spec().is_tiled());

        let mut back = vec![0u8; pixels.len()];
        input.read_image(None, &mut back, None, None, None, None).unwrap();
        assert_eq!(back, pixels);

        // Single tile read, strided into a full-image sized buffer.
        let mut region = vec![0u8; 4 * 4 * 4];
        input
            .read_tile(4, 4, 0, None, &mut region, None, None, None)
            .unwrap();
        let v = f32::from_ne_bytes(region[..4].try_into().unwrap());
        assert_eq!(v, (4 * 10 + 4) as f32);
    }

    #[test]
    fn test_channel_subset_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subset.rbf");
        let spec = ramp_spec();
        let pixels = ramp_pixels(&spec);
        let mut out = RbfOutput::new();
        out.open(&path, &spec).unwrap();
        out.write_image(None, &pixels, None, None, None, None).unwrap();
        out.close().unwrap();

        let mut input = RbfInput::new();
        input.open(&path, None).unwrap();
        let roi = Roi::from_size(8, 6);
        // Channels [1,3) as f32.
        let mut sub = vec![0u8; 8 * 6 * 2 * 4];
        input
            .read_scanlines(
                roi.ybegin,
                roi.yend,
                0,
                1,
                3,
                Some(DataFormat::F32),
                &mut sub,
                None,
                None,
                None,
            )
            .unwrap();
        let first = f32::from_ne_bytes(sub[..4].try_into().unwrap());
        assert!((first - 1.0 / 65535.0).abs() < 1e-7);
    }

    #[test]
    fn test_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.rbf");
        std::fs::write(&path, b"not an image").unwrap();
        let mut input = RbfInput::new();
        assert!(matches!(
            input.open(&path, None),
            Err(IoError::InvalidFile(_))
        ));
    }
}
