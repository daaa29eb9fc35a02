//! Tile cache: keyed store of decoded pixel tiles.
//!
//! Cache-backed buffers hold no pixel memory of their own; cursors resolve
//! coordinates to tiles checked out of this cache. The interface is the
//! acquire/release handshake:
//!
//! - [`TileCache::acquire_tile`] returns a [`TileHandle`] pinning the tile;
//!   a pinned tile is never evicted.
//! - Dropping the handle (or calling [`TileCache::release_tile`]) unpins it.
//!
//! Files are opened through the [`FormatRegistry`] once and kept open; for
//! untiled files the cache serves whole-width scanline bands as
//! pseudo-tiles so the resolution path stays uniform.
//!
//! Eviction of unpinned tiles is approximate-LRU over a byte budget; the
//! exact policy is internal and deliberately simple.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use raster_core::{DataFormat, ImageSpec, Roi};

use crate::error::{IoError, IoResult};
use crate::plugin::FormatInput;
use crate::registry::FormatRegistry;

/// Default cache byte budget (256 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// Rows per pseudo-tile when caching untiled (scanline) files.
pub const AUTOTILE_ROWS: u32 = 64;

/// Key identifying one cached tile.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// File path.
    pub path: PathBuf,
    /// Subimage index.
    pub subimage: usize,
    /// Mip level.
    pub miplevel: usize,
    /// Tile corner (absolute coordinates, grid-aligned).
    pub x: i32,
    /// Tile corner y.
    pub y: i32,
    /// Tile corner z.
    pub z: i32,
}

/// One decoded tile: native-format pixels, contiguous rows.
#[derive(Debug)]
pub struct TileData {
    /// Bounds of the valid pixels in this tile (clipped to the data window).
    pub roi: Roi,
    /// Stored pixel format (uniform; per-channel files store their
    /// channels packed, described by the file's descriptor).
    pub format: DataFormat,
    /// Bytes per pixel as stored.
    pub pixel_bytes: usize,
    /// Allocated row width in pixels (edge tiles stay padded).
    row_pixels: usize,
    /// Rows per z slice in the allocation.
    slice_rows: usize,
    data: Vec<u8>,
}

impl TileData {
    /// Raw tile bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Byte offset of an absolute coordinate inside this tile.
    ///
    /// The coordinate must lie within [`TileData::roi`].
    #[inline]
    pub fn pixel_offset(&self, x: i32, y: i32, z: i32) -> usize {
        let lx = (x - self.roi.xbegin) as usize;
        let ly = (y - self.roi.ybegin) as usize;
        let lz = (z - self.roi.zbegin) as usize;
        ((lz * self.slice_rows + ly) * self.row_pixels + lx) * self.pixel_bytes
    }

    /// The bytes of one pixel.
    #[inline]
    pub fn pixel(&self, x: i32, y: i32, z: i32) -> &[u8] {
        let off = self.pixel_offset(x, y, z);
        &self.data[off..off + self.pixel_bytes]
    }

    /// Allocation size in bytes.
    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// RAII checkout of a cached tile.
///
/// Holding a handle pins the tile: it cannot be evicted until every handle
/// referencing it is dropped. Dropping releases; [`TileCache::release_tile`]
/// is the explicit spelling of the same thing.
pub struct TileHandle {
    tile: Arc<TileData>,
}

impl TileHandle {
    /// The checked-out tile.
    #[inline]
    pub fn tile(&self) -> &TileData {
        &self.tile
    }

    /// Valid bounds of the tile.
    #[inline]
    pub fn roi(&self) -> Roi {
        self.tile.roi
    }

    /// Stored pixel format.
    #[inline]
    pub fn format(&self) -> DataFormat {
        self.tile.format
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Total acquire calls.
    pub acquires: u64,
    /// Acquires served from the cache.
    pub hits: u64,
    /// Acquires that loaded a tile from disk (distinct loads).
    pub misses: u64,
    /// Tiles evicted.
    pub evictions: u64,
    /// Tiles currently resident.
    pub tile_count: u64,
    /// Bytes currently resident.
    pub bytes: usize,
    /// High-water mark of resident bytes.
    pub peak_bytes: usize,
}

struct FileRecord {
    input: Box<dyn FormatInput>,
    // Spec per (subimage, miplevel) already visited.
    specs: HashMap<(usize, usize), ImageSpec>,
    current: (usize, usize),
    nsubimages: usize,
}

struct CacheEntry {
    tile: Arc<TileData>,
    last_use: u64,
}

struct CacheInner {
    files: HashMap<PathBuf, FileRecord>,
    tiles: HashMap<TileKey, CacheEntry>,
    clock: u64,
    bytes: usize,
    stats: CacheStats,
}

/// Thread-safe tile cache.
///
/// Typically shared process-wide via [`shared_cache`]; independent caches
/// can be created for isolation (tests do).
pub struct TileCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl TileCache {
    /// Creates a cache with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                files: HashMap::new(),
                tiles: HashMap::new(),
                clock: 0,
                bytes: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// The configured byte budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns a snapshot of the statistics counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.tile_count = inner.tiles.len() as u64;
        stats.bytes = inner.bytes;
        stats
    }

    /// Fetches the descriptor for (path, subimage, miplevel), opening the
    /// file through the registry on first use and memoizing afterwards.
    pub fn get_descriptor(
        &self,
        path: impl AsRef<Path>,
        subimage: usize,
        miplevel: usize,
    ) -> IoResult<ImageSpec> {
        let mut inner = self.inner.lock().unwrap();
        let record = Self::file_record(&mut inner, path.as_ref())?;
        Self::spec_for(record, subimage, miplevel).cloned()
    }

    /// Number of subimages in a file.
    pub fn num_subimages(&self, path: impl AsRef<Path>) -> IoResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let record = Self::file_record(&mut inner, path.as_ref())?;
        Ok(record.nsubimages)
    }

    /// Number of mip levels for a subimage.
    pub fn num_miplevels(&self, path: impl AsRef<Path>, subimage: usize) -> IoResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        let record = Self::file_record(&mut inner, path.as_ref())?;
        Ok(record.input.num_miplevels(subimage))
    }

    /// Acquires the tile containing pixel (x, y, z), loading it on a miss.
    ///
    /// The returned handle pins the tile until dropped.
    pub fn acquire_tile(
        &self,
        path: impl AsRef<Path>,
        subimage: usize,
        miplevel: usize,
        x: i32,
        y: i32,
        z: i32,
    ) -> IoResult<TileHandle> {
        let path = path.as_ref();
        let mut inner = self.inner.lock().unwrap();
        inner.stats.acquires += 1;

        let (key, spec) = {
            let record = Self::file_record(&mut inner, path)?;
            let spec = Self::spec_for(record, subimage, miplevel)?.clone();
            if !spec.roi().contains(x, y, z) {
                return Err(IoError::Cache(format!(
                    "pixel ({x}, {y}, {z}) outside data window of {}",
                    path.display()
                )));
            }
            let (tw, th, td) = if spec.is_tiled() {
                (
                    spec.tile_width as i32,
                    spec.tile_height as i32,
                    spec.tile_depth.max(1) as i32,
                )
            } else {
                (spec.width as i32, AUTOTILE_ROWS as i32, 1)
            };
            let key = TileKey {
                path: path.to_path_buf(),
                subimage,
                miplevel,
                x: spec.x + (x - spec.x).div_euclid(tw) * tw,
                y: spec.y + (y - spec.y).div_euclid(th) * th,
                z: spec.z + (z - spec.z).div_euclid(td) * td,
            };
            (key, spec)
        };

        inner.clock += 1;
        let now = inner.clock;
        if let Some(entry) = inner.tiles.get_mut(&key) {
            entry.last_use = now;
            let tile = entry.tile.clone();
            inner.stats.hits += 1;
            return Ok(TileHandle { tile });
        }

        inner.stats.misses += 1;
        let tile = Self::load_tile(&mut inner, &key, &spec)?;
        let tile = Arc::new(tile);
        inner.bytes += tile.size_bytes();
        if inner.bytes > inner.stats.peak_bytes {
            inner.stats.peak_bytes = inner.bytes;
        }
        inner.tiles.insert(
            key,
            CacheEntry {
                tile: tile.clone(),
                last_use: now,
            },
        );
        self.evict_over_budget(&mut inner);
        Ok(TileHandle { tile })
    }

    /// Explicitly releases a checkout. Equivalent to dropping the handle.
    pub fn release_tile(&self, handle: TileHandle) {
        drop(handle);
    }

    /// Drops the file record and cached tiles for a path.
    ///
    /// With `force`, tiles still pinned by outstanding handles are orphaned
    /// from the map as well (they die when their handles drop); otherwise
    /// pinned tiles stay resident.
    pub fn invalidate(&self, path: impl AsRef<Path>, force: bool) {
        let path = path.as_ref();
        let mut inner = self.inner.lock().unwrap();
        inner.files.remove(path);
        let keys: Vec<TileKey> = inner
            .tiles
            .iter()
            .filter(|(k, e)| k.path == path && (force || Arc::strong_count(&e.tile) == 1))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.tiles.remove(&key) {
                inner.bytes -= entry.tile.size_bytes();
                inner.stats.evictions += 1;
            }
        }
        tracing::debug!(path = %path.display(), force, "cache invalidate");
    }

    /// Drops everything unpinned.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.files.clear();
        let keys: Vec<TileKey> = inner
            .tiles
            .iter()
            .filter(|(_, e)| Arc::strong_count(&e.tile) == 1)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(entry) = inner.tiles.remove(&key) {
                inner.bytes -= entry.tile.size_bytes();
            }
        }
    }

    fn file_record<'a>(
        inner: &'a mut CacheInner,
        path: &Path,
    ) -> IoResult<&'a mut FileRecord> {
        if !inner.files.contains_key(path) {
            let input = FormatRegistry::global().open_input(path, None)?;
            let nsubimages = input.num_subimages();
            let mut specs = HashMap::new();
            specs.insert((0, 0), input.spec().clone());
            inner.files.insert(
                path.to_path_buf(),
                FileRecord {
                    input,
                    specs,
                    current: (0, 0),
                    nsubimages,
                },
            );
        }
        Ok(inner.files.get_mut(path).unwrap())
    }

    fn spec_for(
        record: &mut FileRecord,
        subimage: usize,
        miplevel: usize,
    ) -> IoResult<&ImageSpec> {
        if !record.specs.contains_key(&(subimage, miplevel)) {
            record.input.seek(subimage, miplevel)?;
            record.current = (subimage, miplevel);
            record
                .specs
                .insert((subimage, miplevel), record.input.spec().clone());
        }
        Ok(&record.specs[&(subimage, miplevel)])
    }

    fn load_tile(inner: &mut CacheInner, key: &TileKey, spec: &ImageSpec) -> IoResult<TileData> {
        let record = inner
            .files
            .get_mut(&key.path)
            .ok_or_else(|| IoError::Cache("file record vanished".into()))?;
        if record.current != (key.subimage, key.miplevel) {
            record.input.seek(key.subimage, key.miplevel)?;
            record.current = (key.subimage, key.miplevel);
        }
        let pixel_bytes = spec.pixel_bytes(true);
        let window = spec.roi();

        if spec.is_tiled() {
            let (tw, th, td) = (
                spec.tile_width as usize,
                spec.tile_height as usize,
                spec.tile_depth.max(1) as usize,
            );
            let mut data = vec![0u8; spec.tile_bytes(true)];
            record
                .input
                .read_native_tile(key.x, key.y, key.z, &mut data)
                .map_err(|e| IoError::Cache(format!("tile load failed: {e}")))?;
            let full = Roi::new(
                key.x,
                key.x + tw as i32,
                key.y,
                key.y + th as i32,
                key.z,
                key.z + td as i32,
                0,
                spec.nchannels as i32,
            );
            let roi = full
                .intersection(&window)
                .ok_or_else(|| IoError::Cache("tile outside data window".into()))?;
            Ok(TileData {
                roi,
                format: spec.format,
                pixel_bytes,
                row_pixels: tw,
                slice_rows: th,
                data,
            })
        } else {
            // Scanline file: cache a whole-width band of rows.
            let rows = (AUTOTILE_ROWS as i32).min(window.yend - key.y) as usize;
            let row_bytes = spec.scanline_bytes(true);
            let mut data = vec![0u8; rows * row_bytes];
            for r in 0..rows {
                record
                    .input
                    .read_native_scanline(
                        key.y + r as i32,
                        key.z,
                        &mut data[r * row_bytes..(r + 1) * row_bytes],
                    )
                    .map_err(|e| IoError::Cache(format!("scanline load failed: {e}")))?;
            }
            let roi = Roi::new(
                window.xbegin,
                window.xend,
                key.y,
                key.y + rows as i32,
                key.z,
                key.z + 1,
                0,
                spec.nchannels as i32,
            );
            Ok(TileData {
                roi,
                format: spec.format,
                pixel_bytes,
                row_pixels: spec.width as usize,
                slice_rows: rows,
                data,
            })
        }
    }

    fn evict_over_budget(&self, inner: &mut CacheInner) {
        while inner.bytes > self.max_bytes {
            // Oldest unpinned tile; pinned tiles are skipped.
            let victim = inner
                .tiles
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.tile) == 1)
                .min_by_key(|(_, e)| e.last_use)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    if let Some(entry) = inner.tiles.remove(&key) {
                        inner.bytes -= entry.tile.size_bytes();
                        inner.stats.evictions += 1;
                    }
                }
                None => {
                    tracing::warn!("tile cache over budget with every tile pinned");
                    return;
                }
            }
        }
    }
}

/// Process-wide shared cache instance.
///
/// Every buffer that wants the shared cache holds its own reference; the
/// cache's lifetime is reference-counted, not tied to process teardown.
pub fn shared_cache() -> Arc<TileCache> {
    static SHARED: OnceLock<Arc<TileCache>> = OnceLock::new();
    SHARED
        .get_or_init(|| Arc::new(TileCache::new(DEFAULT_CACHE_BYTES)))
        .clone()
}
