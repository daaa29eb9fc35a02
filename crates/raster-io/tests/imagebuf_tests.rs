//! End-to-end behavior of ImageBuf across its three residency modes.

use std::path::Path;
use std::sync::Arc;

use raster_core::{DataFormat, ImageSpec, Roi};
use raster_io::imagebuf::{ImageBuf, InitializePixels, Storage, WrapMode};
use raster_io::plugin::FormatOutput;
use raster_io::rbf::RbfOutput;
use raster_io::TileCache;

/// Writes a tiled RGBA f32 test file with value (x + y*width + c*0.001).
fn write_rgba_tiled(path: &Path, size: u32, tile: u32) -> ImageSpec {
    let mut spec = ImageSpec::rgba(size, size);
    spec.tile_width = tile;
    spec.tile_height = tile;
    spec.tile_depth = 1;
    let mut pixels = vec![0u8; spec.image_bytes(true) as usize];
    for y in 0..size {
        for x in 0..size {
            for c in 0..4u32 {
                let v = (y * size + x) as f32 + c as f32 * 0.001;
                let off = (((y * size + x) * 4 + c) * 4) as usize;
                pixels[off..off + 4].copy_from_slice(&v.to_ne_bytes());
            }
        }
    }
    let mut out = RbfOutput::new();
    out.open(path, &spec).unwrap();
    out.write_image(None, &pixels, None, None, None, None).unwrap();
    out.close().unwrap();
    spec
}

#[test]
fn storage_mode_equivalence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("equiv.rbf");
    write_rgba_tiled(&path, 16, 8);

    // Owned local memory: eager read.
    let local = ImageBuf::from_file(&path);
    assert_eq!(local.spec().width, 16);
    assert_eq!(local.storage(), Storage::Local);

    // Caller-owned memory: copy the pixels out, wrap them.
    let spec = local.spec();
    let mut backing = vec![0u8; spec.image_bytes(true) as usize];
    assert!(local.get_pixels(&Roi::all(), spec.format, &mut backing));
    let external = unsafe {
        ImageBuf::from_external(spec.clone(), backing.as_mut_ptr(), None, None, None, false)
    };

    // Cache-backed: nothing resident, tiles on demand.
    let cache = Arc::new(TileCache::new(64 * 1024 * 1024));
    let cached = ImageBuf::from_file_with(&path, 0, 0, Some(cache), None);

    assert_eq!(external.storage(), Storage::External);
    assert_eq!(cached.storage(), Storage::Cache);

    let mut a = [0.0f32; 4];
    let mut b = [0.0f32; 4];
    let mut c = [0.0f32; 4];
    for y in 0..16 {
        for x in 0..16 {
            local.getpixel(x, y, 0, &mut a, WrapMode::Black);
            external.getpixel(x, y, 0, &mut b, WrapMode::Black);
            cached.getpixel(x, y, 0, &mut c, WrapMode::Black);
            assert_eq!(a, b, "external differs at ({x}, {y})");
            assert_eq!(a, c, "cache-backed differs at ({x}, {y})");
        }
    }
    assert!(!cached.has_error());
}

#[test]
fn file_round_trip_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.rbf");

    let mut spec = ImageSpec::new(12, 7, 3, DataFormat::U16);
    spec.channel_names = vec!["R".into(), "G".into(), "B".into()];
    spec.set_attr("Software", "raster-rs");
    spec.set_attr("Exposure", 1.5);
    let mut buf = ImageBuf::new(spec, InitializePixels::Yes);
    for y in 0..7 {
        for x in 0..12 {
            let v = (y * 12 + x) as f32 / 84.0;
            buf.setpixel(x, y, 0, &[v, 1.0 - v, 0.5]);
        }
    }
    assert!(buf.write(&path, None), "{:?}", buf.error());

    let back = ImageBuf::from_file(&path);
    let rspec = back.spec();
    assert_eq!(rspec.width, 12);
    assert_eq!(rspec.height, 7);
    assert_eq!(rspec.format, DataFormat::U16);
    assert_eq!(
        rspec.channel_names,
        vec!["R".to_string(), "G".to_string(), "B".to_string()]
    );
    assert_eq!(rspec.get_string("Software"), Some("raster-rs"));
    assert_eq!(rspec.get_float("Exposure"), Some(1.5));

    // Bit-exact for the integer native type.
    let mut orig = [0.0f32; 3];
    let mut reread = [0.0f32; 3];
    for y in 0..7 {
        for x in 0..12 {
            buf.getpixel(x, y, 0, &mut orig, WrapMode::Black);
            back.getpixel(x, y, 0, &mut reread, WrapMode::Black);
            assert_eq!(orig, reread, "mismatch at ({x}, {y})");
        }
    }
}

#[test]
fn wrap_clamp_and_black_scenarios() {
    // 4x4 single-channel f32 image filled with 1.0.
    let mut buf = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
    for y in 0..4 {
        for x in 0..4 {
            buf.setpixel(x, y, 0, &[1.0]);
        }
    }
    // Clamp at (-5, 2) resolves to column 0, row 2.
    assert_eq!(buf.getchannel(-5, 2, 0, 0, WrapMode::Clamp), 1.0);
    // Black at (10, 10) is zero.
    assert_eq!(buf.getchannel(10, 10, 0, 0, WrapMode::Black), 0.0);
    // Periodic at (x + kW, y + kH) equals (x, y).
    for k in 1..4 {
        assert_eq!(
            buf.getchannel(1 + 4 * k, 2 + 4 * k, 0, 0, WrapMode::Periodic),
            buf.getchannel(1, 2, 0, 0, WrapMode::Periodic)
        );
    }
}

#[test]
fn make_writable_promotes_and_keeps_edits() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("promote.rbf");
    write_rgba_tiled(&path, 16, 8);

    let cache = Arc::new(TileCache::new(64 * 1024 * 1024));
    let mut buf = ImageBuf::from_file_with(&path, 0, 0, Some(cache.clone()), None);
    assert_eq!(buf.getchannel(5, 5, 0, 0, WrapMode::Black), (5 * 16 + 5) as f32);
    assert_eq!(buf.storage(), Storage::Cache);

    assert!(buf.make_writable());
    assert_ne!(buf.storage(), Storage::Cache);

    // A mutation is visible on a following read without touching the cache.
    let acquires_before = cache.stats().acquires;
    assert!(buf.setpixel(5, 5, 0, &[42.0, 0.0, 0.0, 1.0]));
    assert_eq!(buf.getchannel(5, 5, 0, 0, WrapMode::Black), 42.0);
    assert_eq!(cache.stats().acquires, acquires_before);
}

#[test]
fn channel_subset_rewrites_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subset.rbf");
    write_rgba_tiled(&path, 8, 4);

    let mut buf = ImageBuf::from_file(&path);
    assert!(buf.read(0, 0, Some((1, 3)), true, None), "{:?}", buf.error());
    let spec = buf.spec();
    assert_eq!(spec.nchannels, 2);
    assert_eq!(spec.channel_names, vec!["G".to_string(), "B".to_string()]);
    // Alpha (index 3) falls outside [1, 3): dropped.
    assert_eq!(spec.alpha_channel, -1);

    // Channel 0 of the subset is the source's G channel.
    let v = buf.getchannel(2, 1, 0, 0, WrapMode::Black);
    assert_eq!(v, (8 + 2) as f32 + 0.001);
}

#[test]
fn sequential_scan_loads_each_tile_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big.rbf");
    write_rgba_tiled(&path, 1024, 64);

    let cache = Arc::new(TileCache::new(512 * 1024 * 1024));
    let buf = ImageBuf::from_file_with(&path, 0, 0, Some(cache.clone()), None);

    let mut it = buf.cursor(WrapMode::Black);
    let mut checksum = 0.0f64;
    while !it.done() {
        checksum += it.get(0) as f64;
        it.next();
    }
    drop(it);

    // 16x16 tile grid: exactly 256 distinct tile loads, every revisit a hit.
    let stats = cache.stats();
    assert_eq!(stats.misses, 256);
    assert!(stats.hits > 0);

    // Sum of 0..1024^2-1 over channel 0.
    let n = 1024f64 * 1024.0;
    assert_eq!(checksum, n * (n - 1.0) / 2.0);
}

#[test]
fn cache_failure_reads_black_and_flags_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vanishing.rbf");
    write_rgba_tiled(&path, 8, 4);

    let cache = Arc::new(TileCache::new(64 * 1024 * 1024));
    let buf = ImageBuf::from_file_with(&path, 0, 0, Some(cache.clone()), None);
    assert_eq!(buf.spec().width, 8); // descriptor fetched

    // Pull the file out from under the cache.
    cache.invalidate(&path, true);
    std::fs::remove_file(&path).unwrap();

    let mut it = buf.cursor(WrapMode::Black);
    let mut all_zero = true;
    while !it.done() {
        all_zero &= it.get(0) == 0.0;
        it.next();
    }
    assert!(all_zero);
    assert!(it.had_read_error());
    assert!(buf.has_error());
}

#[test]
fn copy_transfers_intersection_and_zero_fills() {
    let mut src = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
    for y in 0..4 {
        for x in 0..4 {
            src.setpixel(x, y, 0, &[1.0]);
        }
    }
    let mut dst = ImageBuf::new_uninit();
    assert!(dst.copy(&src, None));
    assert_eq!(dst.getchannel(3, 3, 0, 0, WrapMode::Black), 1.0);

    // Copying an identical clone leaves the contents unchanged.
    let before = dst.getchannel(0, 0, 0, 0, WrapMode::Black);
    let alias = dst.clone();
    assert!(dst.copy(&alias, None));
    assert_eq!(dst.getchannel(0, 0, 0, 0, WrapMode::Black), before);
}
