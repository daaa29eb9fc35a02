//! Resource ceilings for image operations.
//!
//! [`Limits`] caps what the I/O pipeline will accept before doing any large
//! allocation, so corrupt or hostile headers are rejected cheaply. All
//! fields are optional; `None` means no limit for that resource.
//!
//! A process-wide instance is consulted by the pipeline; operators adjust
//! it once at startup via [`set_limits`].
//!
//! # Example
//!
//! ```rust
//! use raster_io::limits::Limits;
//!
//! let limits = Limits::none()
//!     .with_max_image_bytes(4 * 1024 * 1024 * 1024)
//!     .with_max_channels(64);
//! ```

use std::sync::{OnceLock, RwLock};

use raster_core::ImageSpec;

use crate::error::{IoError, IoResult};

/// Resource ceilings checked before pixel work begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum uncompressed pixel data size in bytes.
    pub max_image_bytes: Option<u64>,
    /// Maximum total pixels (width x height x depth).
    pub max_pixels: Option<u64>,
    /// Maximum number of channels.
    pub max_channels: Option<u32>,
}

impl Default for Limits {
    /// Defaults generous enough for production imagery, tight enough to
    /// reject nonsense headers: 32 GiB of pixels, 1024 channels.
    fn default() -> Self {
        Self {
            max_image_bytes: Some(32 * 1024 * 1024 * 1024),
            max_pixels: None,
            max_channels: Some(1024),
        }
    }
}

impl Limits {
    /// No limits (all fields `None`).
    pub fn none() -> Self {
        Self {
            max_image_bytes: None,
            max_pixels: None,
            max_channels: None,
        }
    }

    /// Sets the maximum pixel data size in bytes.
    pub fn with_max_image_bytes(mut self, bytes: u64) -> Self {
        self.max_image_bytes = Some(bytes);
        self
    }

    /// Sets the maximum total pixel count.
    pub fn with_max_pixels(mut self, pixels: u64) -> Self {
        self.max_pixels = Some(pixels);
        self
    }

    /// Sets the maximum channel count.
    pub fn with_max_channels(mut self, channels: u32) -> Self {
        self.max_channels = Some(channels);
        self
    }

    /// Validates a spec against these ceilings.
    ///
    /// Also rejects degenerate declarations (resolution or channel count
    /// below 1), unless `allow_no_pixels` is set - plugins for formats
    /// that legitimately carry no pixel data opt out that way.
    pub fn check_spec(&self, spec: &ImageSpec, allow_no_pixels: bool) -> IoResult<()> {
        if spec.width < 1 || spec.height < 1 || spec.nchannels < 1 {
            if allow_no_pixels {
                return Ok(());
            }
            return Err(IoError::InvalidFile(format!(
                "declared resolution {}x{} with {} channels",
                spec.width, spec.height, spec.nchannels
            )));
        }
        if let Some(max) = self.max_channels {
            if spec.nchannels > max {
                return Err(IoError::LimitExceeded(format!(
                    "{} channels exceeds configured maximum of {}",
                    spec.nchannels, max
                )));
            }
        }
        if let Some(max) = self.max_pixels {
            if spec.image_pixels() > max {
                return Err(IoError::LimitExceeded(format!(
                    "{} pixels exceeds configured maximum of {}",
                    spec.image_pixels(),
                    max
                )));
            }
        }
        if let Some(max) = self.max_image_bytes {
            if spec.image_bytes(true) > max {
                return Err(IoError::LimitExceeded(format!(
                    "{} bytes of pixel data exceeds configured maximum of {}",
                    spec.image_bytes(true),
                    max
                )));
            }
        }
        Ok(())
    }
}

fn global() -> &'static RwLock<Limits> {
    static LIMITS: OnceLock<RwLock<Limits>> = OnceLock::new();
    LIMITS.get_or_init(|| RwLock::new(Limits::default()))
}

/// Returns the current process-wide limits.
pub fn limits() -> Limits {
    *global().read().unwrap()
}

/// Replaces the process-wide limits.
pub fn set_limits(new: Limits) {
    *global().write().unwrap() = new;
}
