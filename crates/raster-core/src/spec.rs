//! Image specification and metadata.
//!
//! [`ImageSpec`] is the format descriptor consumed by every other component:
//! it describes resolution, windowing, tiling, channel layout, pixel data
//! type and freeform metadata. It is a passive value type - it never owns
//! pixels.
//!
//! # Data vs full window
//!
//! The *data window* is the pixel region actually present and addressable.
//! The *full window* (display window) is the region the image is meant to
//! be viewed within; it may be larger (crop) or smaller (overscan) than the
//! data window. Wrap policies reference the full window.
//!
//! ```text
//! ┌─────────────────────────────┐
//! │         Full window         │
//! │   ┌───────────────────┐     │
//! │   │    Data window    │     │
//! │   │  (actual pixels)  │     │
//! │   └───────────────────┘     │
//! └─────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use raster_core::{DataFormat, ImageSpec};
//!
//! let mut spec = ImageSpec::new(1920, 1080, 4, DataFormat::F16);
//! spec.channel_names = vec!["R".into(), "G".into(), "B".into(), "A".into()];
//! spec.alpha_channel = 3;
//! spec.set_attr("compression", "none");
//!
//! assert_eq!(spec.pixel_bytes(false), 8); // 4 channels * 2 bytes
//! ```

use smallvec::SmallVec;

use crate::format::DataFormat;
use crate::roi::Roi;

/// Typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Integer value.
    Int(i64),
    /// Floating-point value.
    Float(f64),
    /// String value.
    String(String),
    /// Integer array.
    IntArray(Vec<i64>),
    /// Float array.
    FloatArray(Vec<f64>),
}

impl AttrValue {
    /// Returns this value as an integer, if applicable.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Returns this value as a float, if applicable.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns this value as a string, if applicable.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for AttrValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

/// Ordered name -> value attribute list.
///
/// Insertion order is preserved (and observable through codecs that write
/// attributes out), so this is a small ordered map rather than a hash map.
/// Setting an existing name replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs {
    entries: Vec<(String, AttrValue)>,
}

impl Attrs {
    /// Creates an empty attribute list.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an attribute, replacing any existing value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Looks up an attribute by name.
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Removes an attribute by name; returns the removed value.
    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of attributes.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no attributes are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Image format descriptor.
///
/// Contains everything needed to interpret raw pixel data: windowing,
/// tiling, channel layout, per-channel data types and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    /// X origin of the data window.
    pub x: i32,
    /// Y origin of the data window.
    pub y: i32,
    /// Z origin of the data window.
    pub z: i32,
    /// Data window width in pixels.
    pub width: u32,
    /// Data window height in pixels.
    pub height: u32,
    /// Data window depth (1 for 2D images).
    pub depth: u32,
    /// X origin of the full (display) window.
    pub full_x: i32,
    /// Y origin of the full (display) window.
    pub full_y: i32,
    /// Z origin of the full (display) window.
    pub full_z: i32,
    /// Full window width.
    pub full_width: u32,
    /// Full window height.
    pub full_height: u32,
    /// Full window depth.
    pub full_depth: u32,
    /// Tile width; 0 means untiled (scanline) organization.
    pub tile_width: u32,
    /// Tile height; 0 means untiled.
    pub tile_height: u32,
    /// Tile depth; 0 means untiled.
    pub tile_depth: u32,
    /// Number of channels per pixel.
    pub nchannels: u32,
    /// Data type shared by all channels (unless `channel_formats` is set).
    pub format: DataFormat,
    /// Per-channel data types; empty means every channel uses `format`.
    pub channel_formats: SmallVec<[DataFormat; 4]>,
    /// Ordered channel names (e.g. ["R", "G", "B", "A"]).
    pub channel_names: Vec<String>,
    /// Index of the alpha channel, -1 if absent.
    pub alpha_channel: i32,
    /// Index of the depth (Z) channel, -1 if absent.
    pub z_channel: i32,
    /// Whether pixels hold variable-length deep samples.
    pub deep: bool,
    /// Freeform metadata attributes, insertion-ordered.
    pub attributes: Attrs,
}

impl ImageSpec {
    /// Creates a spec with the given size and uniform channel format.
    ///
    /// Both the data and full windows cover `(0, 0)..(width, height)`.
    pub fn new(width: u32, height: u32, nchannels: u32, format: DataFormat) -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            width,
            height,
            depth: 1,
            full_x: 0,
            full_y: 0,
            full_z: 0,
            full_width: width,
            full_height: height,
            full_depth: 1,
            tile_width: 0,
            tile_height: 0,
            tile_depth: 0,
            nchannels,
            format,
            channel_formats: SmallVec::new(),
            channel_names: Vec::new(),
            alpha_channel: -1,
            z_channel: -1,
            deep: false,
            attributes: Attrs::new(),
        }
    }

    /// Creates an empty (zero-sized) spec.
    pub fn empty() -> Self {
        Self::new(0, 0, 0, DataFormat::F32)
    }

    /// Creates an RGBA F32 spec with standard channel names.
    pub fn rgba(width: u32, height: u32) -> Self {
        let mut spec = Self::new(width, height, 4, DataFormat::F32);
        spec.channel_names = vec!["R".into(), "G".into(), "B".into(), "A".into()];
        spec.alpha_channel = 3;
        spec
    }

    /// Creates a single-channel F32 spec.
    pub fn gray(width: u32, height: u32) -> Self {
        let mut spec = Self::new(width, height, 1, DataFormat::F32);
        spec.channel_names = vec!["Y".into()];
        spec
    }

    /// Data type of channel `c`, honoring per-channel formats.
    #[inline]
    pub fn channel_format(&self, c: usize) -> DataFormat {
        self.channel_formats.get(c).copied().unwrap_or(self.format)
    }

    /// Name of channel `c`, or a generated "channelN" fallback.
    pub fn channel_name(&self, c: usize) -> String {
        self.channel_names
            .get(c)
            .cloned()
            .unwrap_or_else(|| format!("channel{c}"))
    }

    /// Returns true if channels have heterogeneous data types.
    #[inline]
    pub fn per_channel_formats(&self) -> bool {
        !self.channel_formats.is_empty()
            && self.channel_formats.iter().any(|&f| f != self.format)
    }

    /// Bytes per pixel. With `native` true, per-channel formats are summed;
    /// otherwise every channel is assumed to use `format`.
    pub fn pixel_bytes(&self, native: bool) -> usize {
        if native && !self.channel_formats.is_empty() {
            self.channel_formats
                .iter()
                .map(|f| f.bytes_per_channel())
                .sum()
        } else {
            self.nchannels as usize * self.format.bytes_per_channel()
        }
    }

    /// Byte offset of channel `c` within one native pixel.
    pub fn channel_bytes_offset(&self, c: usize, native: bool) -> usize {
        if native && !self.channel_formats.is_empty() {
            self.channel_formats[..c.min(self.channel_formats.len())]
                .iter()
                .map(|f| f.bytes_per_channel())
                .sum()
        } else {
            c * self.format.bytes_per_channel()
        }
    }

    /// Bytes per scanline of the data window.
    #[inline]
    pub fn scanline_bytes(&self, native: bool) -> usize {
        self.width as usize * self.pixel_bytes(native)
    }

    /// Pixels per tile (0 if untiled).
    #[inline]
    pub fn tile_pixels(&self) -> usize {
        if self.tile_width == 0 {
            0
        } else {
            self.tile_width as usize
                * self.tile_height as usize
                * self.tile_depth.max(1) as usize
        }
    }

    /// Bytes per tile (0 if untiled).
    #[inline]
    pub fn tile_bytes(&self, native: bool) -> usize {
        self.tile_pixels() * self.pixel_bytes(native)
    }

    /// Total pixels in the data window.
    #[inline]
    pub fn image_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth.max(1) as u64
    }

    /// Total bytes of pixel data in the data window.
    #[inline]
    pub fn image_bytes(&self, native: bool) -> u64 {
        self.image_pixels() * self.pixel_bytes(native) as u64
    }

    /// Returns true if the image is stored tiled.
    #[inline]
    pub fn is_tiled(&self) -> bool {
        self.tile_width > 0 && self.tile_height > 0
    }

    /// The data window as a region (all channels).
    pub fn roi(&self) -> Roi {
        Roi::new(
            self.x,
            self.x + self.width as i32,
            self.y,
            self.y + self.height as i32,
            self.z,
            self.z + self.depth.max(1) as i32,
            0,
            self.nchannels as i32,
        )
    }

    /// The full (display) window as a region (all channels).
    pub fn roi_full(&self) -> Roi {
        Roi::new(
            self.full_x,
            self.full_x + self.full_width as i32,
            self.full_y,
            self.full_y + self.full_height as i32,
            self.full_z,
            self.full_z + self.full_depth.max(1) as i32,
            0,
            self.nchannels as i32,
        )
    }

    /// Sets the data window from a region.
    pub fn set_roi(&mut self, roi: &Roi) {
        self.x = roi.xbegin;
        self.y = roi.ybegin;
        self.z = roi.zbegin;
        self.width = roi.width().max(0) as u32;
        self.height = roi.height().max(0) as u32;
        self.depth = roi.depth().max(0) as u32;
    }

    /// Sets the full window from a region.
    pub fn set_roi_full(&mut self, roi: &Roi) {
        self.full_x = roi.xbegin;
        self.full_y = roi.ybegin;
        self.full_z = roi.zbegin;
        self.full_width = roi.width().max(0) as u32;
        self.full_height = roi.height().max(0) as u32;
        self.full_depth = roi.depth().max(0) as u32;
    }

    /// Fills in default byte strides for a pixel rectangle.
    ///
    /// `None` strides resolve to contiguous layout: x stride = one pixel,
    /// y stride = `width` pixels, z stride = `height` rows.
    pub fn auto_stride(
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
        pixel_bytes: usize,
        width: u32,
        height: u32,
    ) -> (usize, usize, usize) {
        let xs = xstride.unwrap_or(pixel_bytes);
        let ys = ystride.unwrap_or(width as usize * xs);
        let zs = zstride.unwrap_or(height as usize * ys);
        (xs, ys, zs)
    }

    /// Derives the spec describing channels `[chbegin, chend)` of this one.
    ///
    /// Channel count, names and per-channel formats are rewritten to the
    /// subset; alpha/z indices are remapped into the subset or dropped.
    pub fn channel_subset(&self, chbegin: u32, chend: u32) -> ImageSpec {
        let mut spec = self.clone();
        let n = chend.saturating_sub(chbegin);
        spec.nchannels = n;
        if !self.channel_names.is_empty() {
            spec.channel_names = self
                .channel_names
                .iter()
                .skip(chbegin as usize)
                .take(n as usize)
                .cloned()
                .collect();
        }
        if !self.channel_formats.is_empty() {
            spec.channel_formats = self
                .channel_formats
                .iter()
                .skip(chbegin as usize)
                .take(n as usize)
                .copied()
                .collect();
        }
        let remap = |c: i32| -> i32 {
            if c >= chbegin as i32 && c < chend as i32 {
                c - chbegin as i32
            } else {
                -1
            }
        };
        spec.alpha_channel = remap(self.alpha_channel);
        spec.z_channel = remap(self.z_channel);
        spec
    }

    /// Copy of this spec with a different (uniform) data format.
    pub fn with_format(&self, format: DataFormat) -> ImageSpec {
        let mut spec = self.clone();
        spec.format = format;
        spec.channel_formats.clear();
        spec
    }

    /// Sets an attribute value.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        self.attributes.set(name, value);
    }

    /// Gets an attribute value by name.
    pub fn get_attr(&self, name: &str) -> Option<&AttrValue> {
        self.attributes.get(name)
    }

    /// Gets an attribute as a string.
    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get_attr(name).and_then(|v| v.as_str())
    }

    /// Gets an attribute as an integer.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get_attr(name).and_then(|v| v.as_int())
    }

    /// Gets an attribute as a float.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get_attr(name).and_then(|v| v.as_float())
    }
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}x{} {} {}ch",
            self.width, self.height, self.depth, self.format, self.nchannels
        )?;
        if self.is_tiled() {
            write!(f, " tiled {}x{}", self.tile_width, self.tile_height)?;
        }
        if self.deep {
            write!(f, " deep")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let spec = ImageSpec::new(1920, 1080, 4, DataFormat::F16);
        assert_eq!(spec.width, 1920);
        assert_eq!(spec.full_width, 1920);
        assert_eq!(spec.nchannels, 4);
        assert_eq!(spec.pixel_bytes(false), 8);
        assert_eq!(spec.scanline_bytes(false), 1920 * 8);
        assert!(!spec.is_tiled());
    }

    #[test]
    fn test_native_pixel_bytes() {
        let mut spec = ImageSpec::new(4, 4, 3, DataFormat::F32);
        spec.channel_formats =
            SmallVec::from_vec(vec![DataFormat::F16, DataFormat::F16, DataFormat::U32]);
        assert_eq!(spec.pixel_bytes(true), 2 + 2 + 4);
        assert_eq!(spec.pixel_bytes(false), 12);
        assert_eq!(spec.channel_bytes_offset(2, true), 4);
        assert!(spec.per_channel_formats());
    }

    #[test]
    fn test_roi() {
        let mut spec = ImageSpec::new(100, 50, 3, DataFormat::U8);
        spec.x = 10;
        spec.y = 20;
        let roi = spec.roi();
        assert_eq!(roi.xbegin, 10);
        assert_eq!(roi.xend, 110);
        assert_eq!(roi.yend, 70);
        assert_eq!(roi.nchannels(), 3);
    }

    #[test]
    fn test_tiles() {
        let mut spec = ImageSpec::new(100, 100, 4, DataFormat::U16);
        spec.tile_width = 64;
        spec.tile_height = 64;
        spec.tile_depth = 1;
        assert!(spec.is_tiled());
        assert_eq!(spec.tile_pixels(), 64 * 64);
        assert_eq!(spec.tile_bytes(false), 64 * 64 * 8);
    }

    #[test]
    fn test_auto_stride() {
        let (xs, ys, zs) = ImageSpec::auto_stride(None, None, None, 4, 10, 5);
        assert_eq!((xs, ys, zs), (4, 40, 200));

        let (xs, ys, zs) = ImageSpec::auto_stride(Some(8), None, None, 4, 10, 5);
        assert_eq!((xs, ys, zs), (8, 80, 400));
    }

    #[test]
    fn test_channel_subset() {
        let mut spec = ImageSpec::rgba(32, 32);
        spec.z_channel = 1;
        let sub = spec.channel_subset(1, 3);
        assert_eq!(sub.nchannels, 2);
        assert_eq!(sub.channel_names, vec!["G".to_string(), "B".to_string()]);
        assert_eq!(sub.alpha_channel, -1); // alpha (3) outside [1,3)
        assert_eq!(sub.z_channel, 0);
    }

    #[test]
    fn test_attrs_ordered() {
        let mut attrs = Attrs::new();
        attrs.set("b", 2);
        attrs.set("a", 1);
        attrs.set("b", 3); // replace in place
        let names: Vec<_> = attrs.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(attrs.get("b").and_then(|v| v.as_int()), Some(3));
    }

    #[test]
    fn test_spec_attributes() {
        let mut spec = ImageSpec::rgba(8, 8);
        spec.set_attr("Software", "raster-rs");
        spec.set_attr("FrameRate", 24);
        spec.set_attr("ExposureTime", 0.041667);

        assert_eq!(spec.get_string("Software"), Some("raster-rs"));
        assert_eq!(spec.get_int("FrameRate"), Some(24));
        approx::assert_relative_eq!(spec.get_float("ExposureTime").unwrap(), 0.041667);
    }
}
