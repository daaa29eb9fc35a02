//! # raster-io
//!
//! Pixel buffers, position cursors and generic format I/O for large raster
//! images.
//!
//! The crate is built around three cooperating pieces:
//!
//! - [`ImageBuf`] - one logical image handle over three residency modes:
//!   library-owned memory, borrowed caller memory, or nothing resident at
//!   all (pixels fetched tile-by-tile from a [`TileCache`]). Spec and
//!   pixels validate lazily, thread-safely, on first use.
//! - [`Cursor`]/[`CursorMut`] - the uniform surface algorithms use to
//!   read/write pixels regardless of residency, including out-of-window
//!   access under a [`WrapMode`] policy and deep (multi-sample) pixels.
//! - [`FormatInput`]/[`FormatOutput`] - the plugin boundary. A codec
//!   implements only the native scanline/tile primitives; strided
//!   conversion, channel subsets, chunked transfers and progress callbacks
//!   come from the provided pipeline methods.
//!
//! # Quick start
//!
//! ```ignore
//! use raster_io::imagebuf::{ImageBuf, WrapMode};
//!
//! // Lazy: nothing is read until the first access.
//! let buf = ImageBuf::from_file("render.rbf");
//! println!("{}x{}", buf.width(), buf.height());
//!
//! let mut it = buf.cursor(WrapMode::Clamp);
//! while !it.done() {
//!     let v = it.get(0);
//!     it.next();
//! }
//! ```
//!
//! # Feature flags
//!
//! - `rayon` - parallel per-pixel iteration helpers

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod error;

pub mod cache;
pub mod convert;
pub mod deepdata;
pub mod imagebuf;
pub mod limits;
pub mod plugin;
pub mod rbf;
pub mod registry;

pub use cache::{shared_cache, CacheStats, TileCache, TileHandle};
pub use deepdata::DeepData;
pub use error::{Component, IoError, IoResult};
pub use imagebuf::{Cursor, CursorMut, ImageBuf, InitializePixels, Storage, WrapMode};
pub use limits::{limits, set_limits, Limits};
pub use plugin::{Capability, FormatInput, FormatOutput, ProgressCallback};
pub use registry::{FormatFactory, FormatRegistry};
