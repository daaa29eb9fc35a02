//! Pipeline and registry behavior observable from outside:
//! idempotent reads via a counting mock plugin, and plugin registration.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use raster_core::{DataFormat, ImageSpec};
use raster_io::imagebuf::{ImageBuf, WrapMode};
use raster_io::plugin::FormatInput;
use raster_io::registry::{FormatFactory, FormatRegistry};
use raster_io::{IoError, IoResult};

/// Counts every native scanline read across all instances.
static MOCK_NATIVE_READS: AtomicUsize = AtomicUsize::new(0);

struct MockInput {
    spec: ImageSpec,
}

impl FormatInput for MockInput {
    fn format_name(&self) -> &'static str {
        "mock"
    }

    fn open(&mut self, _path: &Path, _config: Option<&ImageSpec>) -> IoResult<()> {
        self.spec = ImageSpec::gray(4, 4);
        Ok(())
    }

    fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    fn seek(&mut self, subimage: usize, miplevel: usize) -> IoResult<()> {
        if subimage == 0 && miplevel == 0 {
            Ok(())
        } else {
            Err(IoError::Unsupported("single image".into()))
        }
    }

    fn read_native_scanline(&mut self, _y: i32, _z: i32, data: &mut [u8]) -> IoResult<()> {
        MOCK_NATIVE_READS.fetch_add(1, Ordering::SeqCst);
        for chunk in data[..self.spec.scanline_bytes(true)].chunks_exact_mut(4) {
            chunk.copy_from_slice(&1.0f32.to_ne_bytes());
        }
        Ok(())
    }
}

struct MockFactory;

impl FormatFactory for MockFactory {
    fn format_name(&self) -> &'static str {
        "mock"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["mock"]
    }

    fn create_input(&self) -> Box<dyn FormatInput> {
        Box::new(MockInput {
            spec: ImageSpec::empty(),
        })
    }
}

#[test]
fn read_is_idempotent_for_identical_arguments() {
    FormatRegistry::global().register(Arc::new(MockFactory));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counted.mock");
    std::fs::write(&path, b"mock").unwrap();

    let mut buf = ImageBuf::from_file(&path);
    assert!(buf.read(0, 0, None, true, None), "{:?}", buf.error());
    let after_first = MOCK_NATIVE_READS.load(Ordering::SeqCst);
    assert_eq!(after_first, 4, "one native read per scanline");
    assert_eq!(buf.getchannel(2, 2, 0, 0, WrapMode::Black), 1.0);

    // Identical arguments: no further I/O, same success.
    assert!(buf.read(0, 0, None, true, None));
    assert!(buf.read(0, 0, None, true, None));
    assert_eq!(MOCK_NATIVE_READS.load(Ordering::SeqCst), after_first);

    // A changed conversion request does hit the plugin again.
    assert!(buf.read(0, 0, None, true, Some(DataFormat::F16)));
    assert_eq!(MOCK_NATIVE_READS.load(Ordering::SeqCst), after_first + 4);
    assert_eq!(buf.spec().format, DataFormat::F16);
}

#[test]
fn registry_prefers_magic_then_extension() {
    let registry = FormatRegistry::global();
    // rbf magic wins regardless of extension.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("actually_rbf.dat");
    let spec = ImageSpec::gray(2, 2);
    let mut out = registry.create_output_for("x.rbf", None).unwrap();
    out.open(&path, &spec).unwrap();
    use raster_io::plugin::FormatOutput as _;
    out.write_image(None, &vec![0u8; spec.image_bytes(true) as usize], None, None, None, None)
        .unwrap();
    out.close().unwrap();

    let input = registry.open_input(&path, None).unwrap();
    assert_eq!(input.format_name(), "rbf");
}

#[test]
fn truncated_file_surfaces_plugin_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("truncated.rbf");

    // Valid header, then chop the pixel data off.
    let spec = ImageSpec::gray(8, 8);
    let mut out = FormatRegistry::global().create_output_for(&path, None).unwrap();
    use raster_io::plugin::FormatOutput as _;
    out.open(&path, &spec).unwrap();
    out.write_image(
        None,
        &vec![0u8; spec.image_bytes(true) as usize],
        None,
        None,
        None,
        None,
    )
    .unwrap();
    out.close().unwrap();
    let full = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full - 64).unwrap();

    let mut buf = ImageBuf::from_file(&path);
    assert!(!buf.read(0, 0, None, true, None));
    let msg = buf.error().unwrap();
    assert!(msg.contains("error"), "unexpected message: {msg}");
}
