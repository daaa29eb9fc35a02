//! Deep sample store: per-pixel variable-length sample arrays.
//!
//! A "deep" pixel holds zero or more depth-ordered samples instead of one
//! value per channel. [`DeepData`] stores all samples of an image in one
//! contiguous buffer with per-pixel bookkeeping; a buffer whose spec has
//! the `deep` flag owns one of these instead of flat pixel memory.
//!
//! Lifecycle: [`DeepData::init`] (or [`DeepData::from_spec`]) establishes
//! the channel layout, [`DeepData::set_samples`] declares each pixel's
//! sample count, and storage is allocated on the first value write. Sample
//! counts are set once; setting a count concurrently with value writes for
//! the same pixel is not supported.

use smallvec::SmallVec;

use raster_core::{DataFormat, ImageSpec};

use crate::convert;

/// Per-pixel variable-length sample storage.
#[derive(Debug, Clone)]
pub struct DeepData {
    npixels: usize,
    channel_formats: SmallVec<[DataFormat; 8]>,
    channel_names: Vec<String>,
    channel_offsets: SmallVec<[usize; 8]>,
    sample_bytes: usize,
    nsamples: Vec<u32>,
    cum_samples: Vec<u64>,
    data: Vec<u8>,
    z_channel: i32,
    alpha_channel: i32,
    allocated: bool,
}

impl Default for DeepData {
    fn default() -> Self {
        Self {
            npixels: 0,
            channel_formats: SmallVec::new(),
            channel_names: Vec::new(),
            channel_offsets: SmallVec::new(),
            sample_bytes: 0,
            nsamples: Vec::new(),
            cum_samples: Vec::new(),
            data: Vec::new(),
            z_channel: -1,
            alpha_channel: -1,
            allocated: false,
        }
    }
}

impl DeepData {
    /// Creates an empty, uninitialized store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the store for `npixels` pixels with the given channels.
    pub fn init(&mut self, npixels: usize, formats: &[DataFormat], names: &[String]) {
        *self = Self::default();
        self.npixels = npixels;
        self.channel_formats = formats.iter().copied().collect();
        self.channel_names = names.to_vec();

        let mut offset = 0usize;
        for fmt in formats {
            self.channel_offsets.push(offset);
            offset += fmt.bytes_per_channel();
        }
        self.sample_bytes = offset;
        self.nsamples = vec![0; npixels];

        self.z_channel = -1;
        self.alpha_channel = -1;
        for (i, name) in names.iter().enumerate() {
            match name.to_ascii_lowercase().as_str() {
                "z" => self.z_channel = i as i32,
                "a" | "alpha" => self.alpha_channel = i as i32,
                _ => {}
            }
        }
    }

    /// Initializes from a descriptor (pixel count and channel layout).
    pub fn from_spec(spec: &ImageSpec) -> Self {
        let mut dd = Self::new();
        let npixels = spec.image_pixels() as usize;
        let formats: Vec<DataFormat> = (0..spec.nchannels as usize)
            .map(|c| spec.channel_format(c))
            .collect();
        let names: Vec<String> = (0..spec.nchannels as usize)
            .map(|c| spec.channel_name(c))
            .collect();
        dd.init(npixels, &formats, &names);
        dd
    }

    /// Resets to the uninitialized state, freeing storage.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Returns true if the layout has been established.
    pub fn initialized(&self) -> bool {
        self.npixels > 0
    }

    /// Returns true if sample storage has been allocated.
    pub fn allocated(&self) -> bool {
        self.allocated
    }

    /// Total pixel count.
    pub fn pixels(&self) -> usize {
        self.npixels
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.channel_formats.len()
    }

    /// Name of channel `c`.
    pub fn channel_name(&self, c: usize) -> &str {
        self.channel_names.get(c).map(String::as_str).unwrap_or("")
    }

    /// Format of channel `c`.
    pub fn channel_format(&self, c: usize) -> DataFormat {
        self.channel_formats
            .get(c)
            .copied()
            .unwrap_or(DataFormat::F32)
    }

    /// Z channel index, -1 if absent.
    pub fn z_channel(&self) -> i32 {
        self.z_channel
    }

    /// Alpha channel index, -1 if absent.
    pub fn alpha_channel(&self) -> i32 {
        self.alpha_channel
    }

    /// Bytes per sample (all channels).
    pub fn sample_bytes(&self) -> usize {
        self.sample_bytes
    }

    /// Sample count for a pixel (0 if out of range).
    pub fn samples(&self, pixel: usize) -> u32 {
        self.nsamples.get(pixel).copied().unwrap_or(0)
    }

    /// Declares the sample count for a pixel.
    ///
    /// Counts are fixed once storage is allocated; late calls are ignored
    /// and return false.
    pub fn set_samples(&mut self, pixel: usize, n: u32) -> bool {
        if self.allocated || pixel >= self.npixels {
            return false;
        }
        self.nsamples[pixel] = n;
        true
    }

    /// Total declared samples.
    pub fn total_samples(&self) -> u64 {
        self.nsamples.iter().map(|&n| n as u64).sum()
    }

    fn ensure_allocated(&mut self) {
        if self.allocated {
            return;
        }
        self.cum_samples = Vec::with_capacity(self.npixels);
        let mut cum = 0u64;
        for &n in &self.nsamples {
            self.cum_samples.push(cum);
            cum += n as u64;
        }
        self.data = vec![0u8; cum as usize * self.sample_bytes];
        self.allocated = true;
    }

    fn value_offset(&self, pixel: usize, channel: usize, sample: usize) -> Option<usize> {
        if pixel >= self.npixels
            || channel >= self.channel_formats.len()
            || sample >= self.nsamples[pixel] as usize
        {
            return None;
        }
        let base = (self.cum_samples[pixel] as usize + sample) * self.sample_bytes;
        Some(base + self.channel_offsets[channel])
    }

    /// Value of `sample` in `channel` of `pixel`, 0.0 when out of range or
    /// unallocated.
    pub fn deep_value(&self, pixel: usize, channel: usize, sample: usize) -> f32 {
        if !self.allocated {
            return 0.0;
        }
        match self.value_offset(pixel, channel, sample) {
            Some(off) => convert::read_as_f32(self.channel_formats[channel], &self.data[off..]),
            None => 0.0,
        }
    }

    /// Sets a sample value; allocates storage on first use. Returns false
    /// when the location is out of range.
    pub fn set_deep_value(&mut self, pixel: usize, channel: usize, sample: usize, value: f32) -> bool {
        if !self.initialized() {
            return false;
        }
        self.ensure_allocated();
        match self.value_offset(pixel, channel, sample) {
            Some(off) => {
                let fmt = self.channel_formats[channel];
                convert::write_f32(fmt, value, &mut self.data[off..]);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgbaz() -> (Vec<DataFormat>, Vec<String>) {
        (
            vec![DataFormat::F32; 5],
            ["R", "G", "B", "A", "Z"].iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_init_discovers_channels() {
        let (formats, names) = rgbaz();
        let mut dd = DeepData::new();
        dd.init(100, &formats, &names);
        assert!(dd.initialized());
        assert!(!dd.allocated());
        assert_eq!(dd.channels(), 5);
        assert_eq!(dd.alpha_channel(), 3);
        assert_eq!(dd.z_channel(), 4);
        assert_eq!(dd.sample_bytes(), 20);
    }

    #[test]
    fn test_sample_lifecycle() {
        let (formats, names) = rgbaz();
        let mut dd = DeepData::new();
        dd.init(10, &formats, &names);
        assert!(dd.set_samples(0, 2));
        assert!(dd.set_samples(3, 1));
        assert_eq!(dd.samples(0), 2);
        assert_eq!(dd.samples(1), 0);
        assert_eq!(dd.total_samples(), 3);

        assert!(dd.set_deep_value(0, 0, 0, 1.0));
        assert!(dd.set_deep_value(0, 4, 1, 0.5));
        assert!(dd.set_deep_value(3, 2, 0, 0.25));
        assert!(dd.allocated());

        assert_eq!(dd.deep_value(0, 0, 0), 1.0);
        assert_eq!(dd.deep_value(0, 4, 1), 0.5);
        assert_eq!(dd.deep_value(3, 2, 0), 0.25);
        // Out of range reads come back zero.
        assert_eq!(dd.deep_value(0, 0, 2), 0.0);
        assert_eq!(dd.deep_value(1, 0, 0), 0.0);

        // Counts are frozen after allocation.
        assert!(!dd.set_samples(1, 4));
    }

    #[test]
    fn test_from_spec() {
        let mut spec = ImageSpec::rgba(4, 4);
        spec.deep = true;
        let dd = DeepData::from_spec(&spec);
        assert_eq!(dd.pixels(), 16);
        assert_eq!(dd.channels(), 4);
        assert_eq!(dd.alpha_channel(), 3);
        assert_eq!(dd.z_channel(), -1);
    }

    #[test]
    fn test_heterogeneous_sample_layout() {
        let formats = vec![DataFormat::F16, DataFormat::F32];
        let names = vec!["A".to_string(), "Z".to_string()];
        let mut dd = DeepData::new();
        dd.init(2, &formats, &names);
        assert_eq!(dd.sample_bytes(), 6);
        dd.set_samples(1, 1);
        assert!(dd.set_deep_value(1, 0, 0, 0.5));
        assert!(dd.set_deep_value(1, 1, 0, 123.0));
        assert_eq!(dd.deep_value(1, 0, 0), 0.5);
        assert_eq!(dd.deep_value(1, 1, 0), 123.0);
    }
}
