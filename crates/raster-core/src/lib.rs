//! # raster-core
//!
//! Core types for raster image access.
//!
//! This crate provides the passive value types shared across the raster-rs
//! workspace:
//!
//! - [`ImageSpec`] - image format descriptor (windows, tiling, channels,
//!   data types, metadata)
//! - [`Roi`] - region of interest with channel bounds
//! - [`DataFormat`] - runtime pixel data type
//! - [`Error`] - core error enum
//!
//! ## Crate structure
//!
//! `raster-core` has no internal dependencies; `raster-io` (buffers,
//! cursors, format I/O) builds on top of it:
//!
//! ```text
//! raster-core (this crate)
//!    ^
//!    |
//!    +-- raster-io (ImageBuf, cursors, format plugins, tile cache)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod format;
pub mod roi;
pub mod spec;

pub use error::{Error, Result};
pub use format::DataFormat;
pub use roi::Roi;
pub use spec::{AttrValue, Attrs, ImageSpec};

/// Prelude module for convenient imports.
///
/// ```
/// use raster_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::format::DataFormat;
    pub use crate::roi::Roi;
    pub use crate::spec::{AttrValue, Attrs, ImageSpec};
}
