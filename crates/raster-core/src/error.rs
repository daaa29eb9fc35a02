//! Error types for core raster operations.
//!
//! # Dependencies
//!
//! - [`thiserror`] - derive macro for error implementations

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the core value types and buffer bookkeeping.
#[derive(Debug, Error)]
pub enum Error {
    /// Pixel coordinates fall outside the image's data window.
    #[error("pixel ({x}, {y}, {z}) outside data window")]
    OutOfBounds {
        /// X coordinate.
        x: i32,
        /// Y coordinate.
        y: i32,
        /// Z coordinate.
        z: i32,
    },

    /// A region is degenerate or does not fit the image.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// Memory allocation for pixel data failed.
    #[error("allocation of {bytes} bytes failed")]
    AllocationFailed {
        /// Requested allocation size.
        bytes: u64,
    },

    /// Channel count or range mismatch between two operands.
    #[error("channel mismatch: expected {expected}, got {actual}")]
    ChannelMismatch {
        /// Expected channel count.
        expected: u32,
        /// Actual channel count.
        actual: u32,
    },

    /// Operation not defined for this data format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}
