//! Error types for I/O operations.
//!
//! [`IoError`] is the unified error for everything that touches files,
//! plugins, the tile cache or buffer I/O. Every variant carries a message
//! string; [`IoError::component`] reports which component originated it,
//! so callers relaying an error (e.g. into a buffer's error mailbox) can
//! keep the source visible without string parsing.

use std::io;
use thiserror::Error;

/// Component a failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// A format reader plugin.
    Input,
    /// A format writer plugin.
    Output,
    /// The tile cache.
    Cache,
    /// The pixel buffer itself.
    Buffer,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Cache => write!(f, "cache"),
            Self::Buffer => write!(f, "buffer"),
        }
    }
}

/// I/O operation error.
#[derive(Debug, Error)]
pub enum IoError {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unsupported or unrecognized format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Invalid or corrupted file.
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Decoding error from a reader plugin.
    #[error("decode error: {0}")]
    Decode(String),

    /// Encoding error from a writer plugin.
    #[error("encode error: {0}")]
    Encode(String),

    /// Tile cache error.
    #[error("cache error: {0}")]
    Cache(String),

    /// A configured resource ceiling was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Operation not supported by this plugin or buffer state.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl IoError {
    /// The component this error originated from.
    pub fn component(&self) -> Component {
        match self {
            Self::Io(_) | Self::UnsupportedFormat(_) | Self::InvalidFile(_) | Self::Decode(_) => {
                Component::Input
            }
            Self::Encode(_) => Component::Output,
            Self::Cache(_) => Component::Cache,
            Self::LimitExceeded(_) | Self::Unsupported(_) => Component::Buffer,
        }
    }
}

/// Result type for I/O operations.
pub type IoResult<T> = Result<T, IoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_tags() {
        assert_eq!(IoError::Decode("x".into()).component(), Component::Input);
        assert_eq!(IoError::Encode("x".into()).component(), Component::Output);
        assert_eq!(IoError::Cache("x".into()).component(), Component::Cache);
        assert_eq!(
            IoError::LimitExceeded("x".into()).component(),
            Component::Buffer
        );
    }
}
