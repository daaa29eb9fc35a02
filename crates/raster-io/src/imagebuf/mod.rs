//! ImageBuf: the pixel buffer and its storage lifecycle.
//!
//! An [`ImageBuf`] is one logical image handle that transparently behaves
//! as any of three backing stores:
//!
//! - [`Storage::Local`] - pixels owned and allocated by the library
//! - [`Storage::External`] - a caller-supplied region the buffer borrows
//! - [`Storage::Cache`] - nothing resident; pixels are fetched on demand,
//!   tile by tile, from a [`TileCache`]
//!
//! Callers address pixels uniformly in all three cases through the
//! cursors in [`mod@crate::imagebuf::iterators`].
//!
//! # Lazy validation
//!
//! Constructing from a filename stores only the name. The first call that
//! needs dimensions triggers *validate-spec*; the first call that needs
//! pixel values triggers *validate-pixels*. Both are double-checked: an
//! atomic "valid" flag is tested before (and again after) taking the
//! validation mutex, so concurrent callers on an already-valid buffer
//! never block. Validate-pixels performs the spec step itself while
//! holding the mutex, so a single thread never self-deadlocks.
//!
//! # Errors
//!
//! Fallible operations return `bool` and park a message in the buffer's
//! error mailbox ([`ImageBuf::error`] retrieves and clears it). Callers
//! that ignore return values observe zero-filled pixels, never crashes.
//!
//! # Example
//!
//! ```ignore
//! use raster_io::imagebuf::{ImageBuf, InitializePixels, WrapMode};
//! use raster_core::ImageSpec;
//!
//! let mut buf = ImageBuf::new(ImageSpec::rgba(1920, 1080), InitializePixels::Yes);
//! buf.setpixel(100, 100, 0, &[1.0, 0.0, 0.0, 1.0]);
//!
//! let mut pixel = [0.0f32; 4];
//! buf.getpixel(100, 100, 0, &mut pixel, WrapMode::Black);
//! ```

mod storage;
mod iterators;
mod pixels;

pub use iterators::{Cursor, CursorMut, WrapMode};
pub use storage::PixelStorage;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use smallvec::SmallVec;

use raster_core::{DataFormat, ImageSpec, Roi};

use crate::cache::TileCache;
use crate::deepdata::DeepData;
use crate::error::{IoError, IoResult};
use crate::plugin::{Capability, FormatInput, FormatOutput};
use crate::registry::FormatRegistry;

/// Controls whether pixels are initialized when allocating a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitializePixels {
    /// Do not require initialization (pixels are still zeroed today).
    No,
    /// Initialize all pixels to zero.
    #[default]
    Yes,
}

/// How a buffer's pixels are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    /// No image at all.
    #[default]
    Uninitialized,
    /// Library-owned contiguous memory.
    Local,
    /// Caller-owned memory the buffer only borrows.
    External,
    /// Pixels live in the tile cache, fetched on demand.
    Cache,
}

pub(crate) struct BufState {
    pub name: PathBuf,
    pub spec: ImageSpec,
    pub nativespec: ImageSpec,
    pub storage: Storage,
    pub pixels: PixelStorage,
    pub strides: (usize, usize, usize),
    pub subimage: usize,
    pub miplevel: usize,
    pub nsubimages: usize,
    pub nmiplevels: usize,
    pub cache: Option<Arc<TileCache>>,
    pub config: Option<ImageSpec>,
    pub deep: Option<DeepData>,
    pub read_only: bool,
    pub badfile: bool,
    pub force_local: bool,
    pub read_format: Option<DataFormat>,
    pub read_chrange: Option<(u32, u32)>,
    pub write_format: Option<DataFormat>,
    pub write_tiles: Option<(u32, u32, u32)>,
    /// Shared all-zero pixel used by wrap fallback; sized to one pixel.
    pub black: Vec<u8>,
}

impl Default for BufState {
    fn default() -> Self {
        Self {
            name: PathBuf::new(),
            spec: ImageSpec::empty(),
            nativespec: ImageSpec::empty(),
            storage: Storage::Uninitialized,
            pixels: PixelStorage::Empty,
            strides: (0, 0, 0),
            subimage: 0,
            miplevel: 0,
            nsubimages: 1,
            nmiplevels: 1,
            cache: None,
            config: None,
            deep: None,
            read_only: false,
            badfile: false,
            force_local: false,
            read_format: None,
            read_chrange: None,
            write_format: None,
            write_tiles: None,
            black: Vec::new(),
        }
    }
}

fn contiguous_strides(spec: &ImageSpec) -> (usize, usize, usize) {
    ImageSpec::auto_stride(None, None, None, spec.pixel_bytes(true), spec.width, spec.height)
}

pub(crate) struct ImageBufImpl {
    pub state: RwLock<BufState>,
    pub spec_valid: AtomicBool,
    pub pixels_valid: AtomicBool,
    /// Serializes lazy validation; never held on the steady-state path.
    validate: Mutex<()>,
    /// Error mailbox; a separate lock because error reporting cross-cuts.
    error: Mutex<Option<String>>,
}

/// Snapshot a cursor takes when binding to a buffer. Everything the hot
/// path needs, resolved once so per-pixel access touches no lock.
pub(crate) struct CursorSnapshot {
    pub img: Roi,
    pub full: Roi,
    pub storage: Storage,
    pub base: *const u8,
    pub strides: (usize, usize, usize),
    pub pixel_bytes: usize,
    pub nchannels: usize,
    pub channel_formats: SmallVec<[DataFormat; 8]>,
    pub channel_offsets: SmallVec<[usize; 8]>,
    pub black: *const u8,
    pub deep: bool,
    pub cache: Option<Arc<TileCache>>,
    pub name: PathBuf,
    pub subimage: usize,
    pub miplevel: usize,
}

/// One logical image handle over local, external or cache-backed pixels.
pub struct ImageBuf {
    impl_: Arc<ImageBufImpl>,
}

impl Default for ImageBuf {
    fn default() -> Self {
        Self::new_uninit()
    }
}

impl Clone for ImageBuf {
    /// Deep copy: local pixels are duplicated, external pixels are copied
    /// into owned memory, cache-backed buffers stay cache-backed.
    fn clone(&self) -> Self {
        let st = self.impl_.state.read().unwrap();
        let pixels = match &st.pixels {
            PixelStorage::Empty => PixelStorage::Empty,
            PixelStorage::Local(v) => PixelStorage::Local(v.clone()),
            PixelStorage::External { ptr, len } => {
                // The wrap constructor's contract keeps this region alive.
                let copied = unsafe { std::slice::from_raw_parts(*ptr, *len) }.to_vec();
                PixelStorage::Local(copied)
            }
        };
        let storage = match st.storage {
            Storage::External => Storage::Local,
            other => other,
        };
        let new_state = BufState {
            name: st.name.clone(),
            spec: st.spec.clone(),
            nativespec: st.nativespec.clone(),
            storage,
            pixels,
            strides: match st.storage {
                Storage::External => contiguous_strides(&st.spec),
                _ => st.strides,
            },
            subimage: st.subimage,
            miplevel: st.miplevel,
            nsubimages: st.nsubimages,
            nmiplevels: st.nmiplevels,
            cache: st.cache.clone(),
            config: st.config.clone(),
            deep: st.deep.clone(),
            read_only: st.storage == Storage::Cache,
            badfile: st.badfile,
            force_local: st.force_local,
            read_format: st.read_format,
            read_chrange: st.read_chrange,
            write_format: st.write_format,
            write_tiles: st.write_tiles,
            black: st.black.clone(),
        };
        Self {
            impl_: Arc::new(ImageBufImpl {
                state: RwLock::new(new_state),
                spec_valid: AtomicBool::new(self.impl_.spec_valid.load(Ordering::Acquire)),
                pixels_valid: AtomicBool::new(self.impl_.pixels_valid.load(Ordering::Acquire)),
                validate: Mutex::new(()),
                error: Mutex::new(None),
            }),
        }
    }
}

impl ImageBuf {
    // =====================================================================
    // Constructors and resets
    // =====================================================================

    /// Creates an uninitialized buffer.
    pub fn new_uninit() -> Self {
        Self {
            impl_: Arc::new(ImageBufImpl {
                state: RwLock::new(BufState::default()),
                spec_valid: AtomicBool::new(false),
                pixels_valid: AtomicBool::new(false),
                validate: Mutex::new(()),
                error: Mutex::new(None),
            }),
        }
    }

    /// Creates a buffer with freshly allocated (zeroed) local storage.
    ///
    /// Allocation failure degrades to an uninitialized buffer with an
    /// allocation message parked in the error mailbox.
    pub fn new(spec: ImageSpec, zero: InitializePixels) -> Self {
        let mut buf = Self::new_uninit();
        buf.reset_spec(spec, zero);
        buf
    }

    /// Creates a buffer that lazily reads `path` on first access.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self::from_file_with(path, 0, 0, None, None)
    }

    /// Creates a lazily-reading buffer with explicit subimage/miplevel,
    /// optional tile cache and optional open-config hints.
    pub fn from_file_with(
        path: impl AsRef<Path>,
        subimage: usize,
        miplevel: usize,
        cache: Option<Arc<TileCache>>,
        config: Option<&ImageSpec>,
    ) -> Self {
        let mut buf = Self::new_uninit();
        buf.reset_file(path, subimage, miplevel, cache, config);
        buf
    }

    /// Wraps caller-owned pixel memory without copying.
    ///
    /// # Safety
    ///
    /// `data` must point to a region holding the image described by `spec`
    /// under the given strides, and must stay valid and unmoved for the
    /// life of this buffer and every cursor over it. Concurrent writers to
    /// overlapping regions are the caller's responsibility.
    pub unsafe fn from_external(
        spec: ImageSpec,
        data: *mut u8,
        xstride: Option<usize>,
        ystride: Option<usize>,
        zstride: Option<usize>,
        read_only: bool,
    ) -> Self {
        let (xs, ys, zs) = ImageSpec::auto_stride(
            xstride,
            ystride,
            zstride,
            spec.pixel_bytes(true),
            spec.width,
            spec.height,
        );
        let len = spec.depth.max(1) as usize * zs;
        let buf = Self::new_uninit();
        {
            let mut st = buf.impl_.state.write().unwrap();
            st.black = vec![0u8; spec.pixel_bytes(true).max(1)];
            st.spec = spec.clone();
            st.nativespec = spec;
            st.storage = Storage::External;
            st.pixels = PixelStorage::External { ptr: data, len };
            st.strides = (xs, ys, zs);
            st.read_only = read_only;
        }
        buf.impl_.spec_valid.store(true, Ordering::Release);
        buf.impl_.pixels_valid.store(true, Ordering::Release);
        buf
    }

    /// Resets to the uninitialized state: releases owned memory, drops any
    /// tile cache entries registered for this buffer's file, resets both
    /// descriptors and the error state.
    pub fn clear(&mut self) {
        {
            let st = self.impl_.state.read().unwrap();
            if let Some(cache) = &st.cache {
                if !st.name.as_os_str().is_empty() {
                    cache.invalidate(&st.name, false);
                }
            }
        }
        *self.impl_.state.write().unwrap() = BufState::default();
        self.impl_.spec_valid.store(false, Ordering::Release);
        self.impl_.pixels_valid.store(false, Ordering::Release);
        *self.impl_.error.lock().unwrap() = None;
    }

    /// Resets to a freshly allocated image described by `spec`.
    pub fn reset_spec(&mut self, spec: ImageSpec, _zero: InitializePixels) {
        self.clear();
        let mut alloc_failed = None;
        {
            let mut st = self.impl_.state.write().unwrap();
            st.black = vec![0u8; spec.pixel_bytes(true).max(1)];
            if spec.deep {
                st.deep = Some(DeepData::from_spec(&spec));
                st.storage = Storage::Local;
            } else {
                let bytes = spec.image_bytes(true) as usize;
                if bytes == 0 {
                    st.storage = Storage::Uninitialized;
                } else {
                    match PixelStorage::try_allocate(bytes) {
                        Ok(pixels) => {
                            st.storage = Storage::Local;
                            st.pixels = pixels;
                            st.strides = contiguous_strides(&spec);
                        }
                        Err(b) => {
                            st.storage = Storage::Uninitialized;
                            alloc_failed = Some(b);
                        }
                    }
                }
            }
            st.spec = spec.clone();
            st.nativespec = spec;
        }
        self.impl_.spec_valid.store(true, Ordering::Release);
        let ok = alloc_failed.is_none();
        self.impl_.pixels_valid.store(ok, Ordering::Release);
        if let Some(bytes) = alloc_failed {
            self.set_error(format!("allocation of {bytes} bytes failed"));
        }
    }

    /// Resets to lazily read from a file.
    pub fn reset_file(
        &mut self,
        path: impl AsRef<Path>,
        subimage: usize,
        miplevel: usize,
        cache: Option<Arc<TileCache>>,
        config: Option<&ImageSpec>,
    ) {
        self.clear();
        let mut st = self.impl_.state.write().unwrap();
        st.name = path.as_ref().to_path_buf();
        st.subimage = subimage;
        st.miplevel = miplevel;
        st.read_only = cache.is_some();
        st.storage = if cache.is_some() {
            Storage::Cache
        } else {
            Storage::Uninitialized
        };
        st.cache = cache;
        st.config = config.cloned();
    }

    // =====================================================================
    // State queries
    // =====================================================================

    /// Current storage mode.
    pub fn storage(&self) -> Storage {
        self.impl_.state.read().unwrap().storage
    }

    /// Returns true if the buffer holds (or lazily references) an image.
    pub fn initialized(&self) -> bool {
        let st = self.impl_.state.read().unwrap();
        st.storage != Storage::Uninitialized || !st.name.as_os_str().is_empty()
    }

    /// The buffer's file name (empty for in-memory buffers).
    pub fn name(&self) -> String {
        self.impl_
            .state
            .read()
            .unwrap()
            .name
            .to_string_lossy()
            .into_owned()
    }

    /// Current subimage index.
    pub fn subimage(&self) -> usize {
        self.impl_.state.read().unwrap().subimage
    }

    /// Current mip level.
    pub fn miplevel(&self) -> usize {
        self.impl_.state.read().unwrap().miplevel
    }

    /// Number of subimages (1 until the spec has been validated).
    pub fn nsubimages(&self) -> usize {
        self.validate_spec();
        self.impl_.state.read().unwrap().nsubimages
    }

    /// Number of mip levels for the current subimage.
    pub fn nmiplevels(&self) -> usize {
        self.validate_spec();
        self.impl_.state.read().unwrap().nmiplevels
    }

    /// Retrieves and clears the error message (single-slot mailbox).
    pub fn error(&self) -> Option<String> {
        self.impl_.error.lock().unwrap().take()
    }

    /// Returns true if an error message is waiting.
    pub fn has_error(&self) -> bool {
        self.impl_.error.lock().unwrap().is_some()
    }

    pub(crate) fn set_error(&self, msg: impl Into<String>) {
        *self.impl_.error.lock().unwrap() = Some(msg.into());
    }

    // =====================================================================
    // Spec access
    // =====================================================================

    /// The descriptor as requested (post conversion/subset), triggering
    /// lazy validate-spec if needed.
    pub fn spec(&self) -> ImageSpec {
        self.validate_spec();
        self.impl_.state.read().unwrap().spec.clone()
    }

    /// The descriptor as truly stored in the file/cache.
    pub fn nativespec(&self) -> ImageSpec {
        self.validate_spec();
        self.impl_.state.read().unwrap().nativespec.clone()
    }

    /// The data window.
    pub fn roi(&self) -> Roi {
        self.spec().roi()
    }

    /// The full (display) window.
    pub fn roi_full(&self) -> Roi {
        self.spec().roi_full()
    }

    /// Image width.
    pub fn width(&self) -> u32 {
        self.spec().width
    }

    /// Image height.
    pub fn height(&self) -> u32 {
        self.spec().height
    }

    /// Channel count.
    pub fn nchannels(&self) -> u32 {
        self.spec().nchannels
    }

    /// Returns true if the buffer holds deep pixels.
    pub fn deep(&self) -> bool {
        self.spec().deep
    }

    // =====================================================================
    // Lazy validation (the lifecycle state machine)
    // =====================================================================

    pub(crate) fn validate_spec(&self) -> bool {
        if self.impl_.spec_valid.load(Ordering::Acquire) {
            return true;
        }
        let _guard = self.impl_.validate.lock().unwrap();
        if self.impl_.spec_valid.load(Ordering::Acquire) {
            return true;
        }
        self.validate_spec_locked()
    }

    /// The spec step, assuming the validation mutex is already held.
    fn validate_spec_locked(&self) -> bool {
        let (name, subimage, miplevel, cache, config, badfile) = {
            let st = self.impl_.state.read().unwrap();
            (
                st.name.clone(),
                st.subimage,
                st.miplevel,
                st.cache.clone(),
                st.config.clone(),
                st.badfile,
            )
        };
        if badfile || name.as_os_str().is_empty() {
            return false;
        }

        let result: IoResult<(ImageSpec, usize, usize)> = (|| {
            if let Some(cache) = &cache {
                let spec = cache.get_descriptor(&name, subimage, miplevel)?;
                let nsub = cache.num_subimages(&name)?;
                let nmip = cache.num_miplevels(&name, subimage)?;
                Ok((spec, nsub, nmip))
            } else {
                let mut input = FormatRegistry::global().open_input(&name, config.as_ref())?;
                input.seek(subimage, miplevel)?;
                let spec = input.spec().clone();
                let nsub = input.num_subimages();
                let nmip = input.num_miplevels(subimage);
                Ok((spec, nsub, nmip))
            }
        })();

        match result {
            Ok((spec, nsub, nmip)) => {
                let mut st = self.impl_.state.write().unwrap();
                st.black = vec![0u8; spec.pixel_bytes(true).max(1)];
                st.spec = spec.clone();
                st.nativespec = spec;
                st.nsubimages = nsub;
                st.nmiplevels = nmip;
                drop(st);
                self.impl_.spec_valid.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                tracing::warn!(file = %name.display(), "header read failed: {e}");
                self.impl_.state.write().unwrap().badfile = true;
                self.set_error(e.to_string());
                false
            }
        }
    }

    pub(crate) fn validate_pixels(&self) -> bool {
        if self.impl_.pixels_valid.load(Ordering::Acquire) {
            return true;
        }
        let _guard = self.impl_.validate.lock().unwrap();
        if self.impl_.pixels_valid.load(Ordering::Acquire) {
            return true;
        }
        if !self.impl_.spec_valid.load(Ordering::Acquire) && !self.validate_spec_locked() {
            return false;
        }
        self.validate_pixels_locked()
    }

    /// The pixels step, assuming the validation mutex is already held and
    /// the spec is valid.
    fn validate_pixels_locked(&self) -> bool {
        let (name, subimage, miplevel, cache, config, chrange, convert, force) = {
            let st = self.impl_.state.read().unwrap();
            (
                st.name.clone(),
                st.subimage,
                st.miplevel,
                st.cache.clone(),
                st.config.clone(),
                st.read_chrange,
                st.read_format,
                st.force_local,
            )
        };
        if name.as_os_str().is_empty() {
            // Nothing to read; allocated buffers never get here.
            return false;
        }

        // Cache fast path: pixels count as valid without materializing
        // memory when the request matches what the cache stores.
        if let Some(_cache) = &cache {
            let native_fmt = self.impl_.state.read().unwrap().nativespec.format;
            let no_convert = convert.is_none() || convert == Some(native_fmt);
            if !force && chrange.is_none() && no_convert {
                let mut st = self.impl_.state.write().unwrap();
                st.spec = st.nativespec.clone();
                st.storage = Storage::Cache;
                st.read_only = true;
                drop(st);
                self.impl_.pixels_valid.store(true, Ordering::Release);
                return true;
            }
        }

        // Eager full read through the pipeline into owned memory.
        let result = (|| -> IoResult<(ImageSpec, PixelStorage)> {
            let mut input = FormatRegistry::global().open_input(&name, config.as_ref())?;
            input.seek(subimage, miplevel)?;
            let native = input.spec().clone();
            let (chb, che) = match chrange {
                Some((b, e)) => (b, e.min(native.nchannels)),
                None => (0, native.nchannels),
            };
            if chb >= che {
                return Err(IoError::Unsupported(format!(
                    "channel range [{chb},{che}) is empty"
                )));
            }
            let subset = chb != 0 || che != native.nchannels;
            let mut target = if subset {
                native.channel_subset(chb, che)
            } else {
                native.clone()
            };
            let mut fmt_arg = convert;
            if let Some(f) = convert {
                target.format = f;
                target.channel_formats.clear();
            } else if subset && native.per_channel_formats() {
                // Subsets of per-channel data read in the file's base type.
                fmt_arg = Some(native.format);
                target.format = native.format;
                target.channel_formats.clear();
            }

            let bytes = target.image_bytes(true) as usize;
            let mut pixels = PixelStorage::try_allocate(bytes)
                .map_err(|b| IoError::Unsupported(format!("allocation of {b} bytes failed")))?;
            {
                let data = pixels.local_slice_mut().unwrap();
                let roi = native.roi();
                if native.is_tiled() && input.supports(Capability::Tiles) {
                    input.read_tiles(
                        roi.xbegin, roi.xend, roi.ybegin, roi.yend, roi.zbegin, roi.zend,
                        chb, che, fmt_arg, data, None, None, None, None,
                    )?;
                } else {
                    let slice_bytes =
                        native.height as usize * target.scanline_bytes(true);
                    for slice in 0..native.depth.max(1) as usize {
                        input.read_scanlines(
                            roi.ybegin,
                            roi.yend,
                            roi.zbegin + slice as i32,
                            chb,
                            che,
                            fmt_arg,
                            &mut data[slice * slice_bytes..],
                            None,
                            None,
                            None,
                        )?;
                    }
                }
            }
            Ok((target, pixels))
        })();

        match result {
            Ok((target, pixels)) => {
                let mut st = self.impl_.state.write().unwrap();
                st.black = vec![0u8; target.pixel_bytes(true).max(1)];
                st.strides = contiguous_strides(&target);
                st.deep = target.deep.then(|| DeepData::from_spec(&target));
                st.spec = target;
                st.pixels = pixels;
                st.storage = Storage::Local;
                st.read_only = false;
                drop(st);
                self.impl_.pixels_valid.store(true, Ordering::Release);
                true
            }
            Err(e) => {
                self.set_error(e.to_string());
                false
            }
        }
    }

    // =====================================================================
    // Read / make-writable / write / copy
    // =====================================================================

    /// Reads pixels for (subimage, miplevel), optionally restricted to
    /// channels `[chbegin, chend)` and/or converted to `convert`.
    ///
    /// Idempotent: identical arguments on an already-valid buffer are a
    /// no-op. With a tile cache attached and no conversion or subset
    /// requested, pixels validate without materializing local memory;
    /// `force` insists on a full local read.
    pub fn read(
        &mut self,
        subimage: usize,
        miplevel: usize,
        chrange: Option<(u32, u32)>,
        force: bool,
        convert: Option<DataFormat>,
    ) -> bool {
        {
            let st = self.impl_.state.read().unwrap();
            let materialized =
                st.storage == Storage::Local || st.storage == Storage::External;
            if self.impl_.pixels_valid.load(Ordering::Acquire)
                && st.subimage == subimage
                && st.miplevel == miplevel
                && st.read_format == convert
                && st.read_chrange == chrange
                && (!force || materialized)
            {
                return true;
            }
            if st.name.as_os_str().is_empty() {
                drop(st);
                self.set_error("read() on a buffer not bound to a file");
                return false;
            }
        }
        {
            let mut st = self.impl_.state.write().unwrap();
            if st.subimage != subimage || st.miplevel != miplevel {
                self.impl_.spec_valid.store(false, Ordering::Release);
            }
            st.subimage = subimage;
            st.miplevel = miplevel;
            st.read_format = convert;
            st.read_chrange = chrange;
            st.force_local = force;
        }
        self.impl_.pixels_valid.store(false, Ordering::Release);
        self.validate_pixels()
    }

    /// Promotes a cache-backed buffer to owned local memory so it can be
    /// mutated in place, and invalidates the cache's entries for the file
    /// (this buffer may be about to overwrite it).
    ///
    /// Local buffers are already writable; read-only external buffers and
    /// uninitialized buffers fail.
    pub fn make_writable(&mut self) -> bool {
        let (storage, read_only, cache, name) = {
            let st = self.impl_.state.read().unwrap();
            (st.storage, st.read_only, st.cache.clone(), st.name.clone())
        };
        match storage {
            Storage::Local => true,
            Storage::External => {
                if read_only {
                    self.set_error("buffer wraps read-only external memory");
                    false
                } else {
                    true
                }
            }
            Storage::Uninitialized => false,
            Storage::Cache => {
                {
                    let mut st = self.impl_.state.write().unwrap();
                    st.force_local = true;
                }
                self.impl_.pixels_valid.store(false, Ordering::Release);
                if !self.validate_pixels() {
                    return false;
                }
                if let Some(cache) = cache {
                    cache.invalidate(&name, false);
                }
                true
            }
        }
    }

    /// Writes the buffer to a file through the format registry.
    ///
    /// `format_hint` forces a format by name instead of by extension. The
    /// write honors [`ImageBuf::set_write_format`] and
    /// [`ImageBuf::set_write_tiles`] overrides.
    pub fn write(&self, path: impl AsRef<Path>, format_hint: Option<&str>) -> bool {
        if !self.validate_pixels() {
            if !self.has_error() {
                self.set_error("no pixels to write");
            }
            return false;
        }
        let path = path.as_ref();
        let result = (|| -> IoResult<()> {
            let (spec, storage, strides, write_format, write_tiles) = {
                let st = self.impl_.state.read().unwrap();
                (
                    st.spec.clone(),
                    st.storage,
                    st.strides,
                    st.write_format,
                    st.write_tiles,
                )
            };
            if spec.deep {
                return Err(IoError::Unsupported(
                    "writing deep buffers is not supported".into(),
                ));
            }
            let mut out_spec = spec.clone();
            if let Some(f) = write_format {
                out_spec.format = f;
                out_spec.channel_formats.clear();
            }
            if let Some((tw, th, td)) = write_tiles {
                out_spec.tile_width = tw;
                out_spec.tile_height = th;
                out_spec.tile_depth = td;
            }
            let converting = write_format.is_some_and(|f| f != spec.format);
            if converting && spec.per_channel_formats() {
                return Err(IoError::Unsupported(
                    "cannot convert per-channel pixels while writing".into(),
                ));
            }

            let mut out = FormatRegistry::global().create_output_for(path, format_hint)?;
            out.open(path, &out_spec)?;
            let fmt_arg = if converting { Some(spec.format) } else { None };
            match storage {
                Storage::Local | Storage::External => {
                    let st = self.impl_.state.read().unwrap();
                    let base = st.pixels.as_ptr().ok_or_else(|| {
                        IoError::Unsupported("buffer holds no pixel memory".into())
                    })?;
                    let data =
                        unsafe { std::slice::from_raw_parts(base, st.pixels.len()) };
                    out.write_image(
                        fmt_arg,
                        data,
                        Some(strides.0),
                        Some(strides.1),
                        Some(strides.2),
                        None,
                    )?;
                }
                Storage::Cache => {
                    // Materialize through the cursor path, then write.
                    let roi = spec.roi();
                    let bytes = spec.image_bytes(false) as usize;
                    let mut data = vec![0u8; bytes];
                    if !self.get_pixels(&roi, spec.format, &mut data) {
                        return Err(IoError::Cache("tile read failed during write".into()));
                    }
                    out.write_image(Some(spec.format), &data, None, None, None, None)?;
                }
                Storage::Uninitialized => {
                    return Err(IoError::Unsupported("buffer is uninitialized".into()));
                }
            }
            out.close()
        })();
        match result {
            Ok(()) => true,
            Err(e) => {
                self.set_error(e.to_string());
                false
            }
        }
    }

    /// Sets the data format used by subsequent [`ImageBuf::write`] calls.
    pub fn set_write_format(&mut self, format: DataFormat) {
        self.impl_.state.write().unwrap().write_format = Some(format);
    }

    /// Sets tile dimensions used by subsequent [`ImageBuf::write`] calls.
    pub fn set_write_tiles(&mut self, width: u32, height: u32, depth: u32) {
        self.impl_.state.write().unwrap().write_tiles = Some((width, height, depth));
    }

    /// Replaces this buffer with a copy of `src`, optionally forcing a
    /// data format.
    ///
    /// Self-assignment is a no-op; copying an uninitialized source clears
    /// the destination. Pixels transfer over the intersection of the two
    /// data windows; the remainder stays zero.
    pub fn copy(&mut self, src: &ImageBuf, format: Option<DataFormat>) -> bool {
        if Arc::ptr_eq(&self.impl_, &src.impl_) {
            return true;
        }
        if !src.initialized() {
            self.clear();
            return true;
        }
        if !src.validate_pixels() {
            self.set_error(src.error().unwrap_or_else(|| "source has no pixels".into()));
            return false;
        }
        let mut spec = src.spec();
        if let Some(f) = format {
            spec = spec.with_format(f);
        }
        self.reset_spec(spec.clone(), InitializePixels::Yes);
        if self.storage() == Storage::Uninitialized && spec.image_pixels() > 0 {
            return false; // allocation failed; message already parked
        }

        if spec.deep {
            let src_st = src.impl_.state.read().unwrap();
            let mut dst_st = self.impl_.state.write().unwrap();
            dst_st.deep = src_st.deep.clone();
            return true;
        }

        let Some(roi) = self.roi().intersection(&src.roi()) else {
            return true;
        };
        let nch = spec.nchannels.min(src.nchannels()) as usize;
        let mut pixel = vec![0.0f32; spec.nchannels.max(src.nchannels()) as usize];
        let mut from = src.cursor_roi(roi, WrapMode::Black);
        let mut to = self.cursor_mut_roi(roi);
        while !from.done() {
            from.pixel(&mut pixel);
            to.set_pixel(&pixel[..nch]);
            from.next();
            to.next();
        }
        !from.had_read_error()
    }

    // =====================================================================
    // Cursor factories
    // =====================================================================

    /// Read cursor over the whole data window.
    pub fn cursor(&self, wrap: WrapMode) -> Cursor<'_> {
        let roi = self.roi();
        Cursor::new(self, roi, wrap)
    }

    /// Read cursor over a region.
    pub fn cursor_roi(&self, roi: Roi, wrap: WrapMode) -> Cursor<'_> {
        Cursor::new(self, roi, wrap)
    }

    /// Write cursor over the whole data window. Cache-backed buffers are
    /// promoted to local first.
    pub fn cursor_mut(&mut self) -> CursorMut<'_> {
        let roi = self.roi();
        self.cursor_mut_roi(roi)
    }

    /// Write cursor over a region.
    pub fn cursor_mut_roi(&mut self, roi: Roi) -> CursorMut<'_> {
        let writable = self.make_writable();
        CursorMut::new(self, roi, writable)
    }

    /// Snapshot of everything a cursor needs, taken under the lock once.
    pub(crate) fn snapshot(&self) -> CursorSnapshot {
        let st = self.impl_.state.read().unwrap();
        let spec = &st.spec;
        let nchannels = spec.nchannels as usize;
        let mut channel_formats = SmallVec::new();
        let mut channel_offsets = SmallVec::new();
        for c in 0..nchannels {
            channel_formats.push(spec.channel_format(c));
            channel_offsets.push(spec.channel_bytes_offset(c, true));
        }
        CursorSnapshot {
            img: spec.roi(),
            full: spec.roi_full(),
            storage: st.storage,
            base: st.pixels.as_ptr().unwrap_or(std::ptr::null()),
            strides: st.strides,
            pixel_bytes: spec.pixel_bytes(true),
            nchannels,
            channel_formats,
            channel_offsets,
            black: st.black.as_ptr(),
            deep: spec.deep,
            cache: st.cache.clone(),
            name: st.name.clone(),
            subimage: st.subimage,
            miplevel: st.miplevel,
        }
    }

    // =====================================================================
    // Deep pixel access
    // =====================================================================

    fn deep_pixel_index(&self, x: i32, y: i32, z: i32) -> Option<usize> {
        let st = self.impl_.state.read().unwrap();
        let roi = st.spec.roi();
        if !roi.contains(x, y, z) {
            return None;
        }
        let w = st.spec.width as usize;
        let h = st.spec.height as usize;
        Some(
            ((z - roi.zbegin) as usize * h + (y - roi.ybegin) as usize) * w
                + (x - roi.xbegin) as usize,
        )
    }

    /// Sample count of a deep pixel (0 for flat images or out of range).
    pub fn deep_samples(&self, x: i32, y: i32, z: i32) -> u32 {
        self.validate_pixels();
        let Some(idx) = self.deep_pixel_index(x, y, z) else {
            return 0;
        };
        let st = self.impl_.state.read().unwrap();
        st.deep.as_ref().map(|d| d.samples(idx)).unwrap_or(0)
    }

    /// Declares the sample count of a deep pixel.
    pub fn set_deep_samples(&mut self, x: i32, y: i32, z: i32, n: u32) -> bool {
        if !self.deep() {
            self.set_error("deep operation on a flat image");
            return false;
        }
        let Some(idx) = self.deep_pixel_index(x, y, z) else {
            return false;
        };
        let mut st = self.impl_.state.write().unwrap();
        st.deep.as_mut().map(|d| d.set_samples(idx, n)).unwrap_or(false)
    }

    /// Value of one deep sample (0.0 when out of range or flat).
    pub fn deep_value(&self, x: i32, y: i32, z: i32, channel: usize, sample: usize) -> f32 {
        self.validate_pixels();
        let Some(idx) = self.deep_pixel_index(x, y, z) else {
            return 0.0;
        };
        let st = self.impl_.state.read().unwrap();
        st.deep
            .as_ref()
            .map(|d| d.deep_value(idx, channel, sample))
            .unwrap_or(0.0)
    }

    /// Sets one deep sample value.
    pub fn set_deep_value(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        channel: usize,
        sample: usize,
        value: f32,
    ) -> bool {
        if !self.deep() {
            self.set_error("deep operation on a flat image");
            return false;
        }
        self.set_deep_value_internal(x, y, z, channel, sample, value)
    }

    pub(crate) fn set_deep_value_internal(
        &self,
        x: i32,
        y: i32,
        z: i32,
        channel: usize,
        sample: usize,
        value: f32,
    ) -> bool {
        let Some(idx) = self.deep_pixel_index(x, y, z) else {
            return false;
        };
        let mut st = self.impl_.state.write().unwrap();
        st.deep
            .as_mut()
            .map(|d| d.set_deep_value(idx, channel, sample, value))
            .unwrap_or(false)
    }

    // =====================================================================
    // Single-pixel conveniences
    // =====================================================================

    /// Value of one channel at (x, y, z) under a wrap policy.
    pub fn getchannel(&self, x: i32, y: i32, z: i32, c: usize, wrap: WrapMode) -> f32 {
        let mut cursor = self.cursor(wrap);
        cursor.pos(x, y, z);
        cursor.get(c)
    }

    /// All channels of one pixel under a wrap policy.
    pub fn getpixel(&self, x: i32, y: i32, z: i32, pixel: &mut [f32], wrap: WrapMode) {
        let mut cursor = self.cursor(wrap);
        cursor.pos(x, y, z);
        cursor.pixel(pixel);
    }

    /// Sets all channels of one pixel (no-op outside the data window).
    pub fn setpixel(&mut self, x: i32, y: i32, z: i32, pixel: &[f32]) -> bool {
        let mut cursor = self.cursor_mut();
        cursor.pos(x, y, z);
        cursor.set_pixel(pixel)
    }
}

impl std::fmt::Debug for ImageBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.impl_.state.read().unwrap();
        f.debug_struct("ImageBuf")
            .field("name", &st.name)
            .field("storage", &st.storage)
            .field("spec", &format_args!("{}", st.spec))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_allocates_local() {
        let buf = ImageBuf::new(ImageSpec::rgba(64, 32), InitializePixels::Yes);
        assert_eq!(buf.storage(), Storage::Local);
        assert_eq!(buf.width(), 64);
        assert_eq!(buf.nchannels(), 4);
        assert!(!buf.has_error());
    }

    #[test]
    fn test_pixel_set_get() {
        let mut buf = ImageBuf::new(ImageSpec::rgba(8, 8), InitializePixels::Yes);
        assert!(buf.setpixel(3, 4, 0, &[1.0, 0.5, 0.25, 1.0]));
        let mut px = [0.0f32; 4];
        buf.getpixel(3, 4, 0, &mut px, WrapMode::Black);
        assert_eq!(px, [1.0, 0.5, 0.25, 1.0]);
        // Untouched pixels are zero.
        buf.getpixel(0, 0, 0, &mut px, WrapMode::Black);
        assert_eq!(px, [0.0; 4]);
    }

    #[test]
    fn test_setpixel_outside_window_is_noop() {
        let mut buf = ImageBuf::new(ImageSpec::rgba(4, 4), InitializePixels::Yes);
        assert!(!buf.setpixel(10, 10, 0, &[1.0; 4]));
        let mut px = [0.0f32; 4];
        buf.getpixel(3, 3, 0, &mut px, WrapMode::Black);
        assert_eq!(px, [0.0; 4]);
    }

    #[test]
    fn test_external_wrap_and_readonly() {
        let spec = ImageSpec::gray(4, 2);
        let mut backing = vec![0u8; 4 * 2 * 4];
        backing[0..4].copy_from_slice(&0.75f32.to_ne_bytes());
        let mut buf = unsafe {
            ImageBuf::from_external(spec, backing.as_mut_ptr(), None, None, None, true)
        };
        assert_eq!(buf.storage(), Storage::External);
        assert_eq!(buf.getchannel(0, 0, 0, 0, WrapMode::Black), 0.75);
        // Read-only external: writes are refused and reported.
        assert!(!buf.setpixel(0, 0, 0, &[0.0]));
        assert!(buf.has_error());
        assert!(buf.error().unwrap().contains("read-only"));
        assert!(!buf.has_error()); // mailbox cleared by retrieval
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut buf = ImageBuf::new(ImageSpec::rgba(4, 4), InitializePixels::Yes);
        buf.set_error("stale");
        buf.clear();
        assert_eq!(buf.storage(), Storage::Uninitialized);
        assert!(!buf.initialized());
        assert!(!buf.has_error());
        assert_eq!(buf.spec().width, 0);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut buf = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
        buf.setpixel(1, 1, 0, &[0.5]);
        let copy = buf.clone();
        buf.setpixel(1, 1, 0, &[1.0]);
        assert_eq!(copy.getchannel(1, 1, 0, 0, WrapMode::Black), 0.5);
        assert_eq!(buf.getchannel(1, 1, 0, 0, WrapMode::Black), 1.0);
    }

    #[test]
    fn test_copy_converts_format() {
        let mut src = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
        src.setpixel(2, 2, 0, &[0.5]);
        let mut dst = ImageBuf::new_uninit();
        assert!(dst.copy(&src, Some(DataFormat::U8)));
        assert_eq!(dst.spec().format, DataFormat::U8);
        let got = dst.getchannel(2, 2, 0, 0, WrapMode::Black);
        assert!((got - 128.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_copy_uninitialized_clears() {
        let mut dst = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
        let empty = ImageBuf::new_uninit();
        assert!(dst.copy(&empty, None));
        assert!(!dst.initialized());
    }

    #[test]
    fn test_deep_buffer_lifecycle() {
        let mut spec = ImageSpec::new(4, 4, 2, DataFormat::F32);
        spec.channel_names = vec!["A".into(), "Z".into()];
        spec.deep = true;
        let mut buf = ImageBuf::new(spec, InitializePixels::Yes);
        assert!(buf.deep());
        assert!(buf.set_deep_samples(1, 1, 0, 2));
        assert!(buf.set_deep_value(1, 1, 0, 1, 0, 0.25));
        assert!(buf.set_deep_value(1, 1, 0, 1, 1, 0.5));
        assert_eq!(buf.deep_samples(1, 1, 0), 2);
        assert_eq!(buf.deep_value(1, 1, 0, 1, 1), 0.5);
        assert_eq!(buf.deep_value(0, 0, 0, 0, 0), 0.0);
    }

    #[test]
    fn test_deep_op_on_flat_image_fails() {
        let mut buf = ImageBuf::new(ImageSpec::gray(4, 4), InitializePixels::Yes);
        assert!(!buf.set_deep_samples(0, 0, 0, 1));
        assert!(buf.error().unwrap().contains("flat"));
    }

    #[test]
    fn test_missing_file_is_sticky_badfile() {
        let buf = ImageBuf::from_file("/nonexistent/image.rbf");
        assert_eq!(buf.spec().width, 0);
        assert!(buf.has_error());
        // Second query does not retry (badfile sticks until reset).
        let _ = buf.error();
        assert_eq!(buf.spec().width, 0);
        assert!(!buf.has_error());
    }
}
