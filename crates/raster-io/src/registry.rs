//! Format registry for plugin discovery.
//!
//! The registry maps format names, file extensions and magic bytes to
//! [`FormatFactory`] instances that construct reader/writer plugins.
//!
//! # Architecture
//!
//! A process-wide instance lives behind [`FormatRegistry::global`]; the
//! built-in format registers at startup. Additional formats (including
//! test doubles) register at runtime via [`FormatRegistry::register`].
//!
//! # Example
//!
//! ```ignore
//! use raster_io::registry::FormatRegistry;
//!
//! let registry = FormatRegistry::global();
//! let mut input = registry.open_input("image.rbf", None)?;
//! println!("spec: {}", input.spec());
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use raster_core::ImageSpec;

use crate::error::{IoError, IoResult};
use crate::plugin::{FormatInput, FormatOutput};

/// Constructs reader/writer plugins for one format.
pub trait FormatFactory: Send + Sync {
    /// Short format name, e.g. `"rbf"`.
    fn format_name(&self) -> &'static str;

    /// File extensions without dots, e.g. `["rbf"]`.
    fn extensions(&self) -> &'static [&'static str];

    /// Returns true if the header bytes identify this format.
    fn matches_magic(&self, _header: &[u8]) -> bool {
        false
    }

    /// Creates an unopened reader.
    fn create_input(&self) -> Box<dyn FormatInput>;

    /// Creates an unopened writer, or `None` if the format is read-only.
    fn create_output(&self) -> Option<Box<dyn FormatOutput>> {
        None
    }
}

/// Central registry of format factories.
///
/// Thread-safe; registration and lookup may happen from any thread.
pub struct FormatRegistry {
    formats: RwLock<Vec<Arc<dyn FormatFactory>>>,
}

impl FormatRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            formats: RwLock::new(Vec::new()),
        }
    }

    /// The process-wide registry with built-in formats pre-registered.
    pub fn global() -> &'static FormatRegistry {
        static INSTANCE: OnceLock<FormatRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let registry = FormatRegistry::new();
            registry.register(Arc::new(crate::rbf::RbfFactory));
            registry
        })
    }

    /// Registers a format factory. Later registrations win ties on
    /// extension lookup, so tests can shadow built-ins.
    pub fn register(&self, factory: Arc<dyn FormatFactory>) {
        self.formats.write().unwrap().push(factory);
    }

    /// All registered format names.
    pub fn format_names(&self) -> Vec<&'static str> {
        self.formats
            .read()
            .unwrap()
            .iter()
            .map(|f| f.format_name())
            .collect()
    }

    /// Finds a factory by format name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn FormatFactory>> {
        self.formats
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|f| f.format_name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Finds a factory by a path's extension.
    pub fn find_by_extension(&self, path: &Path) -> Option<Arc<dyn FormatFactory>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.formats
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|f| f.extensions().iter().any(|e| *e == ext))
            .cloned()
    }

    /// Finds a factory by file header magic bytes.
    pub fn find_by_magic(&self, header: &[u8]) -> Option<Arc<dyn FormatFactory>> {
        self.formats
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|f| f.matches_magic(header))
            .cloned()
    }

    /// Opens a reader for `path`, probing magic bytes first and falling
    /// back to the extension.
    pub fn open_input(
        &self,
        path: impl AsRef<Path>,
        config: Option<&ImageSpec>,
    ) -> IoResult<Box<dyn FormatInput>> {
        let path = path.as_ref();
        let mut header = [0u8; 16];
        let factory = match File::open(path) {
            Ok(mut f) => {
                let n = f.read(&mut header).unwrap_or(0);
                self.find_by_magic(&header[..n])
                    .or_else(|| self.find_by_extension(path))
            }
            Err(e) => return Err(IoError::Io(e)),
        };
        let factory = factory.ok_or_else(|| {
            IoError::UnsupportedFormat(
                path.extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("unknown")
                    .to_string(),
            )
        })?;
        let mut input = factory.create_input();
        input.open(path, config)?;
        Ok(input)
    }

    /// Creates an unopened writer for `path` by extension, or by explicit
    /// format name if `format_hint` is given.
    pub fn create_output_for(
        &self,
        path: impl AsRef<Path>,
        format_hint: Option<&str>,
    ) -> IoResult<Box<dyn FormatOutput>> {
        let path = path.as_ref();
        let factory = match format_hint {
            Some(name) => self.find_by_name(name),
            None => self.find_by_extension(path),
        };
        let factory = factory.ok_or_else(|| {
            IoError::UnsupportedFormat(
                format_hint
                    .map(str::to_string)
                    .or_else(|| {
                        path.extension()
                            .and_then(|e| e.to_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "unknown".to_string()),
            )
        })?;
        factory
            .create_output()
            .ok_or_else(|| IoError::Unsupported(format!("{} is read-only", factory.format_name())))
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registered() {
        let names = FormatRegistry::global().format_names();
        assert!(names.contains(&"rbf"));
    }

    #[test]
    fn test_find_by_extension() {
        let registry = FormatRegistry::global();
        assert!(registry.find_by_extension(Path::new("x.rbf")).is_some());
        assert!(registry.find_by_extension(Path::new("x.xyz")).is_none());
    }

    #[test]
    fn test_open_missing_file() {
        let err = match FormatRegistry::global().open_input("/nonexistent/path.rbf", None) {
            Ok(_) => panic!("expected open_input to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, IoError::Io(_)));
    }
}
