//! Cache Store
//!
//! Owns the authoritative pixel records (and optional index records) of one
//! image in one of three tiers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             CacheStore                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Memory               │ Map                    │ Disk                │
//! │  ┌─────────────────┐  │ ┌───────────────────┐  │ ┌─────────────────┐ │
//! │  │ aligned heap    │  │ │ MmapMut over a    │  │ │ File + pread /  │ │
//! │  │ region          │  │ │ unique temp file  │  │ │ pwrite at offset│ │
//! │  └─────────────────┘  │ └───────────────────┘  │ └─────────────────┘ │
//! │   memory budget       │  map + disk budget     │  disk budget        │
//! └──────────────────────────────────────────────────────────────────────┘
//!
//! backing region: [ pixel records: columns*rows ][ index records: columns*rows ]
//!                                                  (PseudoClass or CMYK only)
//! ```
//!
//! # Design
//!
//! - Backing storage is allocated once per store; a change of columns,
//!   rows, or index presence opens a new store and clones pixels into it,
//!   while class and colorspace changes that keep the layout are retagged
//!   in place
//! - Tiers are tried in order memory, map, disk; a refusal falls through
//! - Budget charges live in [`ResourceGuard`]s owned by the backing, so
//!   dropping the store credits them
//! - Temporary backing files are unlinked on drop unless the store became
//!   persistent
//! - Copies into and out of in-core memory hold the store's access lock;
//!   shared readers, exclusive writers

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::fs::File;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use super::io::{self, MapMode};
use super::resource::{ResourceGuard, ResourceRegistry, ResourceType};
use super::CACHE_LINE_SIZE;
use crate::error::{fatal, Error, Result};
use crate::pixel::{
    has_indexes, Colorspace, IndexPacket, PixelPacket, StorageClass, INDEX_PACKET_SIZE,
    PIXEL_PACKET_SIZE,
};

/// Backing tier of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// No backing storage yet
    Undefined,
    /// Heap memory
    Memory,
    /// Memory-mapped temporary file
    Map,
    /// File accessed with positioned reads and writes
    Disk,
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheType::Undefined => write!(f, "undefined"),
            CacheType::Memory => write!(f, "memory"),
            CacheType::Map => write!(f, "memory-mapped"),
            CacheType::Disk => write!(f, "disk"),
        }
    }
}

/// Declared shape of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreGeometry {
    pub columns: usize,
    pub rows: usize,
    pub storage_class: StorageClass,
    pub colorspace: Colorspace,
}

impl StoreGeometry {
    pub fn new(
        columns: usize,
        rows: usize,
        storage_class: StorageClass,
        colorspace: Colorspace,
    ) -> Self {
        Self {
            columns,
            rows,
            storage_class,
            colorspace,
        }
    }

    /// Returns true if index records follow the pixel records.
    #[inline]
    pub fn has_indexes(&self) -> bool {
        has_indexes(self.storage_class, self.colorspace)
    }

    /// Bytes per pixel including the index record when present.
    #[inline]
    pub fn packet_size(&self) -> usize {
        if self.has_indexes() {
            PIXEL_PACKET_SIZE + INDEX_PACKET_SIZE
        } else {
            PIXEL_PACKET_SIZE
        }
    }

    /// `columns * rows`, or `None` on overflow.
    pub fn number_pixels(&self) -> Option<usize> {
        self.columns.checked_mul(self.rows)
    }

    /// Byte length of the backing region, or `None` on overflow.
    pub fn length(&self) -> Option<u64> {
        let bytes = self.number_pixels()?.checked_mul(self.packet_size())?;
        u64::try_from(bytes).ok()
    }
}

/// A rectangle addressed in store coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    pub x: i64,
    pub y: i64,
    pub columns: usize,
    pub rows: usize,
}

impl Region {
    pub fn new(x: i64, y: i64, columns: usize, rows: usize) -> Self {
        Self {
            x,
            y,
            columns,
            rows,
        }
    }

    /// `columns * rows`; a region too large to address is a contract violation.
    pub fn area(&self) -> usize {
        match self.columns.checked_mul(self.rows) {
            Some(area) => area,
            None => fatal(
                "NexusLengthOverflow",
                &format!("{}x{} region is not addressable", self.columns, self.rows),
            ),
        }
    }
}

/// Where `open` places the backing storage.
#[derive(Debug, Clone)]
pub enum StoreTarget {
    /// Memory, then a mapped temp file, then a disk temp file
    Anonymous,
    /// A caller-named file at a byte offset, mapped when the area and map
    /// budgets allow and otherwise on the disk tier
    File {
        path: PathBuf,
        offset: u64,
        mode: MapMode,
    },
}

/// Format a byte count the way the open/close log lines show it.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}B", bytes)
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}

/// Most pixels moved per step when cloning through a buffer.
pub const CLONE_CHUNK_PIXELS: usize = 16 * 1024;

/// Rows per clone step for a store `columns` wide; never less than one.
pub fn clone_batch_rows(columns: usize) -> usize {
    (CLONE_CHUNK_PIXELS / columns.max(1)).max(1)
}

/// Map `length` bytes of `file` at `offset`.
///
/// Read mode maps copy-on-write so stray writes never reach the file.
/// Returns `None` when the mapping is refused or misaligned.
fn map_file(
    file: &File,
    path: &Path,
    offset: u64,
    length: u64,
    mode: MapMode,
) -> Option<(MmapMut, NonNull<u8>)> {
    let mut options = MmapOptions::new();
    options.offset(offset).len(length as usize);
    // SAFETY: the file stays open for the life of the mapping, which the
    // store owns, and access is bounded to `length` bytes.
    let mapped = unsafe {
        match mode {
            MapMode::Read => options.map_copy(file),
            MapMode::Write | MapMode::ReadWrite => options.map_mut(file),
        }
    };
    match mapped {
        Ok(mut map) => {
            let base = NonNull::new(map.as_mut_ptr())
                .filter(|p| p.as_ptr().align_offset(align_of::<PixelPacket>()) == 0)?;
            Some((map, base))
        }
        Err(e) => {
            debug!("unable to map {}: {}", path.display(), e);
            None
        }
    }
}

// =============================================================================
// Heap Region
// =============================================================================

/// Zero-initialized, cache-line aligned heap allocation.
struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: HeapRegion owns its allocation exclusively; element access goes
// through raw pointers whose disjointness is the nexus contract.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Returns `None` when the allocator refuses.
    fn new_zeroed(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, CACHE_LINE_SIZE).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self { ptr, layout })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and is freed once.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// =============================================================================
// Backing
// =============================================================================

enum Backing {
    Undefined,
    Memory {
        region: HeapRegion,
        _memory: ResourceGuard,
    },
    Map {
        base: NonNull<u8>,
        map: MmapMut,
        _file: File,
        _budgets: Vec<ResourceGuard>,
    },
    Disk {
        file: File,
        _budgets: Vec<ResourceGuard>,
    },
}

impl Backing {
    fn base(&self) -> Option<NonNull<u8>> {
        match self {
            Backing::Memory { region, .. } => Some(region.ptr),
            Backing::Map { base, .. } => Some(*base),
            Backing::Undefined | Backing::Disk { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct FileState {
    path: Option<PathBuf>,
    persistent: bool,
}

// =============================================================================
// Cache Store
// =============================================================================

/// Backing storage for one image's pixels.
pub struct CacheStore {
    columns: usize,
    rows: usize,
    indexed: bool,
    format: Mutex<(StorageClass, Colorspace)>,
    cache_type: CacheType,
    backing: Backing,
    length: u64,
    offset: u64,
    filename: String,
    file_state: Mutex<FileState>,
    access: RwLock<()>,
    registry: Arc<ResourceRegistry>,
}

// SAFETY: the raw base pointer refers to memory owned by `backing`, which
// lives as long as the store. Copies in and out of that memory hold `access`.
// The only slices that alias it belong to an image's default nexus, which
// needs `&mut Image` and is copied away from before any other owner writes.
unsafe impl Send for CacheStore {}
unsafe impl Sync for CacheStore {}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("filename", &self.filename)
            .field("type", &self.cache_type)
            .field("geometry", &self.geometry())
            .field("length", &self.length)
            .field("offset", &self.offset)
            .field("cache_filename", &self.cache_filename())
            .finish()
    }
}

impl CacheStore {
    /// A store with no backing storage.
    pub fn undefined(registry: Arc<ResourceRegistry>, geometry: StoreGeometry, filename: &str) -> Self {
        Self {
            columns: geometry.columns,
            rows: geometry.rows,
            indexed: geometry.has_indexes(),
            format: Mutex::new((geometry.storage_class, geometry.colorspace)),
            cache_type: CacheType::Undefined,
            backing: Backing::Undefined,
            length: 0,
            offset: 0,
            filename: filename.to_string(),
            file_state: Mutex::new(FileState::default()),
            access: RwLock::new(()),
            registry,
        }
    }

    /// Allocate backing storage for `geometry`.
    ///
    /// Anonymous targets try heap memory, then a memory-mapped temporary
    /// file, then a disk temporary file. Named targets are mapped at their
    /// offset when the budgets allow, fall back to the disk tier, and are
    /// never unlinked.
    #[instrument(level = "debug", skip(registry, target), fields(columns = geometry.columns, rows = geometry.rows))]
    pub fn open(
        registry: &Arc<ResourceRegistry>,
        geometry: StoreGeometry,
        filename: &str,
        target: &StoreTarget,
    ) -> Result<Self> {
        if geometry.columns == 0 || geometry.rows == 0 {
            return Err(Error::NoPixelsDefinedInCache {
                filename: filename.to_string(),
            });
        }
        let length = geometry
            .length()
            .filter(|&l| usize::try_from(l).is_ok())
            .ok_or_else(|| Error::CacheAllocationFailed {
                filename: filename.to_string(),
                columns: geometry.columns,
                rows: geometry.rows,
            })?;

        let result = match target {
            StoreTarget::Anonymous => Self::open_anonymous(registry, geometry, filename, length),
            StoreTarget::File { path, offset, mode } => {
                Self::open_named(registry, geometry, filename, length, path, *offset, *mode)
            }
        };
        match &result {
            Ok(store) => registry.metrics().record_open(store.cache_type),
            Err(e) => {
                registry.metrics().record_open_failure();
                warn!("unable to open pixel cache {}: {}", filename, e);
            }
        }
        result
    }

    fn open_anonymous(
        registry: &Arc<ResourceRegistry>,
        geometry: StoreGeometry,
        filename: &str,
        length: u64,
    ) -> Result<Self> {
        let mut store = Self::undefined(Arc::clone(registry), geometry, filename);
        store.length = length;
        let in_memory_ok = registry.fits(ResourceType::Area, length);

        if in_memory_ok {
            if let Some(memory) = registry.acquire(ResourceType::Memory, length) {
                if let Some(region) = HeapRegion::new_zeroed(length as usize) {
                    store.cache_type = CacheType::Memory;
                    store.backing = Backing::Memory {
                        region,
                        _memory: memory,
                    };
                    debug!("open {} (memory, {})", filename, format_size(length));
                    return Ok(store);
                }
                debug!(length, "heap allocation failed, falling back to a cache file");
            }
        }

        let disk = registry.acquire(ResourceType::Disk, length).ok_or_else(|| {
            Error::CacheResourcesExhausted {
                filename: filename.to_string(),
            }
        })?;
        let (file, path, file_guard) = registry.acquire_unique_file()?;
        store.file_state.lock().path = Some(path.clone());
        if io::extend(&file, length).is_err() {
            // Dropping the store relinquishes the temp file.
            return Err(Error::UnableToExtendCache { path });
        }
        let mut budgets = vec![disk, file_guard];

        if in_memory_ok {
            if let Some(map_budget) = registry.acquire(ResourceType::Map, length) {
                if let Some((map, base)) = map_file(&file, &path, 0, length, MapMode::ReadWrite) {
                    budgets.push(map_budget);
                    store.cache_type = CacheType::Map;
                    store.backing = Backing::Map {
                        base,
                        map,
                        _file: file,
                        _budgets: budgets,
                    };
                    debug!(
                        "open {} ({}, memory-mapped, {})",
                        filename,
                        path.display(),
                        format_size(length)
                    );
                    return Ok(store);
                }
            }
        }

        store.cache_type = CacheType::Disk;
        store.backing = Backing::Disk {
            file,
            _budgets: budgets,
        };
        debug!(
            "open {} ({}, disk, {})",
            filename,
            path.display(),
            format_size(length)
        );
        Ok(store)
    }

    fn open_named(
        registry: &Arc<ResourceRegistry>,
        geometry: StoreGeometry,
        filename: &str,
        length: u64,
        path: &Path,
        offset: u64,
        mode: MapMode,
    ) -> Result<Self> {
        let disk = registry.acquire(ResourceType::Disk, length).ok_or_else(|| {
            Error::CacheResourcesExhausted {
                filename: filename.to_string(),
            }
        })?;
        let file = io::open_backing_file(path, mode).map_err(|source| Error::UnableToOpenCache {
            path: path.to_path_buf(),
            source,
        })?;
        let end = offset
            .checked_add(length)
            .ok_or_else(|| Error::UnableToExtendCache {
                path: path.to_path_buf(),
            })?;
        let sized = match mode {
            MapMode::Read => file.metadata().map(|m| m.len() >= end).unwrap_or(false),
            MapMode::Write | MapMode::ReadWrite => io::extend(&file, end).is_ok(),
        };
        if !sized {
            return Err(Error::UnableToExtendCache {
                path: path.to_path_buf(),
            });
        }

        let mut store = Self::undefined(Arc::clone(registry), geometry, filename);
        store.length = length;
        store.offset = offset;
        *store.file_state.lock() = FileState {
            path: Some(path.to_path_buf()),
            persistent: true,
        };

        if registry.fits(ResourceType::Area, length) {
            if let Some(map_budget) = registry.acquire(ResourceType::Map, length) {
                if let Some((map, base)) = map_file(&file, path, offset, length, mode) {
                    store.cache_type = CacheType::Map;
                    store.backing = Backing::Map {
                        base,
                        map,
                        _file: file,
                        _budgets: vec![disk, map_budget],
                    };
                    debug!(
                        "open {} ({}[{}], memory-mapped, {})",
                        filename,
                        path.display(),
                        offset,
                        format_size(length)
                    );
                    return Ok(store);
                }
            }
        }

        store.cache_type = CacheType::Disk;
        store.backing = Backing::Disk {
            file,
            _budgets: vec![disk],
        };
        debug!(
            "open {} ({}[{}], disk, {})",
            filename,
            path.display(),
            offset,
            format_size(length)
        );
        Ok(store)
    }

    /// Returns true if `geometry` has this store's byte layout, so only the
    /// class and colorspace tags would differ.
    pub fn same_layout(&self, geometry: &StoreGeometry) -> bool {
        self.cache_type != CacheType::Undefined
            && self.columns == geometry.columns
            && self.rows == geometry.rows
            && self.indexed == geometry.has_indexes()
    }

    /// Update the class and colorspace tags of a store whose layout already
    /// matches `geometry`.
    pub fn retag(&self, geometry: &StoreGeometry) {
        debug_assert!(self.same_layout(geometry));
        *self.format.lock() = (geometry.storage_class, geometry.colorspace);
        debug!(
            "open {} ({}, {}, reused)",
            self.filename,
            self.cache_type,
            format_size(self.length)
        );
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn geometry(&self) -> StoreGeometry {
        let (storage_class, colorspace) = *self.format.lock();
        StoreGeometry::new(self.columns, self.rows, storage_class, colorspace)
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn storage_class(&self) -> StorageClass {
        self.format.lock().0
    }

    pub fn colorspace(&self) -> Colorspace {
        self.format.lock().1
    }

    pub fn has_indexes(&self) -> bool {
        self.indexed
    }

    /// `columns * rows` (zero for an undefined store).
    pub fn number_pixels(&self) -> usize {
        if self.cache_type == CacheType::Undefined {
            0
        } else {
            self.columns * self.rows
        }
    }

    /// Byte length of the backing region.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Byte offset of the backing region within its file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Image filename used in diagnostics.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Path of the backing file, if any.
    pub fn cache_filename(&self) -> Option<PathBuf> {
        self.file_state.lock().path.clone()
    }

    /// Returns true if the backing file outlives the store.
    pub fn is_persistent(&self) -> bool {
        self.file_state.lock().persistent
    }

    /// Returns true if the pixels are addressable in memory.
    pub fn is_in_core(&self) -> bool {
        self.backing.base().is_some()
    }

    pub(crate) fn pixel_ptr(&self, offset: usize) -> Option<NonNull<PixelPacket>> {
        let base = self.backing.base()?;
        if offset > self.number_pixels() {
            return None;
        }
        // SAFETY: offset is within the pixel records of the backing region.
        let ptr = unsafe { base.as_ptr().add(offset * PIXEL_PACKET_SIZE) };
        NonNull::new(ptr.cast::<PixelPacket>())
    }

    pub(crate) fn index_ptr(&self, offset: usize) -> Option<NonNull<IndexPacket>> {
        if !self.has_indexes() {
            return None;
        }
        let base = self.backing.base()?;
        let number_pixels = self.number_pixels();
        if offset > number_pixels {
            return None;
        }
        // SAFETY: index records follow the pixel records inside the region.
        let ptr = unsafe {
            base.as_ptr()
                .add(number_pixels * PIXEL_PACKET_SIZE + offset * INDEX_PACKET_SIZE)
        };
        NonNull::new(ptr.cast::<IndexPacket>())
    }

    // -------------------------------------------------------------------------
    // Region I/O
    // -------------------------------------------------------------------------

    /// Returns true if `region` lies entirely inside the store rectangle.
    pub fn is_inside(&self, region: &Region) -> bool {
        if self.cache_type == CacheType::Undefined
            || region.x < 0
            || region.y < 0
            || region.columns == 0
            || region.rows == 0
        {
            return false;
        }
        (region.x as usize)
            .checked_add(region.columns)
            .is_some_and(|r| r <= self.columns)
            && (region.y as usize)
                .checked_add(region.rows)
                .is_some_and(|b| b <= self.rows)
    }

    /// Returns true if `region` addresses store pixels only.
    ///
    /// A region is addressable when it lies inside the rectangle, or when it
    /// starts at column 0 with a width that is a whole number of store rows
    /// and its linear extent ends inside the store.
    pub fn contains(&self, region: &Region) -> bool {
        if self.cache_type == CacheType::Undefined
            || region.x < 0
            || region.y < 0
            || region.columns == 0
            || region.rows == 0
        {
            return false;
        }
        let (x, y) = (region.x as usize, region.y as usize);
        let inside = x.checked_add(region.columns).is_some_and(|r| r <= self.columns)
            && y.checked_add(region.rows).is_some_and(|b| b <= self.rows);
        if inside {
            return true;
        }
        x == 0
            && region.columns % self.columns == 0
            && region
                .columns
                .checked_mul(region.rows)
                .and_then(|area| y.checked_mul(self.columns)?.checked_add(area))
                .is_some_and(|end| end <= self.number_pixels())
    }

    /// Linear start offset, run length, and run count for `region`.
    ///
    /// Regions whose width covers whole store rows from x = 0 collapse into
    /// one run.
    fn span(&self, region: &Region) -> Result<(usize, usize, usize)> {
        if self.cache_type == CacheType::Undefined {
            return Err(Error::PixelCacheIsNotOpen {
                filename: self.filename.clone(),
            });
        }
        if !self.contains(region) {
            return Err(Error::RegionOutOfBounds {
                filename: self.filename.clone(),
                x: region.x,
                y: region.y,
                columns: region.columns,
                rows: region.rows,
            });
        }
        let offset = region.y as usize * self.columns + region.x as usize;
        if region.x == 0 && region.columns % self.columns == 0 {
            Ok((offset, region.area(), 1))
        } else {
            Ok((offset, region.columns, region.rows))
        }
    }

    /// Copy the pixel records of `region` into `dest`.
    pub fn read_pixels(&self, region: &Region, dest: &mut [PixelPacket]) -> Result<()> {
        self.read_records(region, dest, 0)
    }

    /// Copy the index records of `region` into `dest`.
    pub fn read_indexes(&self, region: &Region, dest: &mut [IndexPacket]) -> Result<()> {
        if !self.has_indexes() {
            return Ok(());
        }
        self.read_records(region, dest, self.index_base())
    }

    /// Copy `src` into the pixel records of `region`.
    pub fn write_pixels(&self, region: &Region, src: &[PixelPacket]) -> Result<()> {
        self.write_records(region, src, 0)
    }

    /// Copy `src` into the index records of `region`.
    pub fn write_indexes(&self, region: &Region, src: &[IndexPacket]) -> Result<()> {
        if !self.has_indexes() {
            return Ok(());
        }
        self.write_records(region, src, self.index_base())
    }

    /// Byte offset of the index records within the backing region.
    fn index_base(&self) -> usize {
        self.number_pixels() * PIXEL_PACKET_SIZE
    }

    /// `base` is the byte offset of the record array within the region.
    fn read_records<T: bytemuck::Pod>(&self, region: &Region, dest: &mut [T], base: usize) -> Result<()> {
        let (offset, length, runs) = self.span(region)?;
        if dest.len() < length * runs {
            fatal(
                "NexusBufferTooSmall",
                &format!("{} records for a {}x{} read", dest.len(), length, runs),
            );
        }
        let record = size_of::<T>();
        let columns = self.columns;

        if let Some(start) = self.backing.base() {
            let _access = self.access.read();
            for run in 0..runs {
                let at = base + (offset + run * columns) * record;
                // SAFETY: span() bounded the run inside the backing region and
                // dest holds length * runs records.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        start.as_ptr().add(at).cast::<T>(),
                        dest.as_mut_ptr().add(run * length),
                        length,
                    );
                }
            }
            return Ok(());
        }
        let Backing::Disk { file, .. } = &self.backing else {
            return Err(Error::PixelCacheIsNotOpen {
                filename: self.filename.clone(),
            });
        };
        for run in 0..runs {
            let at = self.offset + (base + (offset + run * columns) * record) as u64;
            let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut dest[run * length..(run + 1) * length]);
            let count = io::read_at(file, bytes, at);
            self.registry.metrics().record_disk_read(count as u64);
            if count != bytes.len() {
                return Err(Error::UnableToReadPixelCache {
                    filename: self.filename.clone(),
                });
            }
        }
        Ok(())
    }

    fn write_records<T: bytemuck::Pod>(&self, region: &Region, src: &[T], base: usize) -> Result<()> {
        let (offset, length, runs) = self.span(region)?;
        if src.len() < length * runs {
            fatal(
                "NexusBufferTooSmall",
                &format!("{} records for a {}x{} write", src.len(), length, runs),
            );
        }
        let record = size_of::<T>();
        let columns = self.columns;

        if let Some(start) = self.backing.base() {
            let _access = self.access.write();
            for run in 0..runs {
                let at = base + (offset + run * columns) * record;
                // SAFETY: as in read_records(). In-core nexus buffers are
                // never written back, so src is a private buffer.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.as_ptr().add(run * length),
                        start.as_ptr().add(at).cast::<T>(),
                        length,
                    );
                }
            }
            return Ok(());
        }
        let Backing::Disk { file, .. } = &self.backing else {
            return Err(Error::PixelCacheIsNotOpen {
                filename: self.filename.clone(),
            });
        };
        for run in 0..runs {
            let at = self.offset + (base + (offset + run * columns) * record) as u64;
            let bytes: &[u8] = bytemuck::cast_slice(&src[run * length..(run + 1) * length]);
            let count = io::write_at(file, bytes, at);
            self.registry.metrics().record_disk_write(count as u64);
            if count != bytes.len() {
                return Err(Error::UnableToWritePixelCache {
                    filename: self.filename.clone(),
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Clone
    // -------------------------------------------------------------------------

    /// Copy the overlapping rectangle of `source` into this store and zero
    /// everything outside it.
    ///
    /// In-core pairs copy directly; otherwise pixels move through a buffer
    /// of at most [`clone_batch_rows`] rows.
    pub fn clone_pixels(&self, source: &CacheStore) -> Result<()> {
        if self.cache_type == CacheType::Undefined {
            return Err(Error::PixelCacheIsNotOpen {
                filename: self.filename.clone(),
            });
        }
        debug!(
            "clone {} => {} ({} => {})",
            source.filename, self.filename, source.cache_type, self.cache_type
        );
        self.registry.metrics().record_clone();

        let (copy_columns, copy_rows) = if source.cache_type == CacheType::Undefined {
            (0, 0)
        } else {
            (self.columns.min(source.columns), self.rows.min(source.rows))
        };
        if let (Some(from), Some(to)) = (source.backing.base(), self.backing.base()) {
            self.clone_in_core(source, from, to, copy_columns, copy_rows);
            return Ok(());
        }

        let columns = self.columns;
        let copy_indexes = self.indexed && source.indexed;
        let batch = clone_batch_rows(columns);
        let mut pixels: Vec<PixelPacket> = self.scratch(batch * columns)?;
        let mut indexes: Vec<IndexPacket> = if self.indexed {
            self.scratch(batch * columns)?
        } else {
            Vec::new()
        };

        let mut y = 0;
        while y < self.rows {
            let rows = batch.min(self.rows - y);
            let area = rows * columns;
            pixels[..area].fill(PixelPacket::default());
            if self.indexed {
                indexes[..area].fill(0);
            }
            let overlap = copy_rows.saturating_sub(y).min(rows);
            if overlap > 0 && columns == source.columns {
                let from = Region::new(0, y as i64, columns, overlap);
                source.read_pixels(&from, &mut pixels[..overlap * columns])?;
                if copy_indexes {
                    source.read_indexes(&from, &mut indexes[..overlap * columns])?;
                }
            } else {
                for row in 0..overlap {
                    let from = Region::new(0, (y + row) as i64, copy_columns, 1);
                    let at = row * columns;
                    source.read_pixels(&from, &mut pixels[at..at + copy_columns])?;
                    if copy_indexes {
                        source.read_indexes(&from, &mut indexes[at..at + copy_columns])?;
                    }
                }
            }
            let to = Region::new(0, y as i64, columns, rows);
            self.write_pixels(&to, &pixels[..area])?;
            if self.indexed {
                self.write_indexes(&to, &indexes[..area])?;
            }
            y += rows;
        }
        Ok(())
    }

    fn clone_in_core(
        &self,
        source: &CacheStore,
        from: NonNull<u8>,
        to: NonNull<u8>,
        copy_columns: usize,
        copy_rows: usize,
    ) {
        let _source = source.access.read();
        let _target = self.access.write();
        let (columns, rows) = (self.columns, self.rows);
        let tail = (rows - copy_rows) * columns;
        // SAFETY: both bases are aligned for PixelPacket and address
        // number_pixels pixel records followed by the index records; every
        // row copied stays within copy_columns <= min(columns) and
        // copy_rows <= min(rows). The two stores never share memory.
        unsafe {
            let src = from.as_ptr().cast::<PixelPacket>();
            let dst = to.as_ptr().cast::<PixelPacket>();
            for y in 0..copy_rows {
                let row = dst.add(y * columns);
                std::ptr::copy_nonoverlapping(src.add(y * source.columns), row, copy_columns);
                std::ptr::write_bytes(row.add(copy_columns), 0, columns - copy_columns);
            }
            std::ptr::write_bytes(dst.add(copy_rows * columns), 0, tail);

            if self.indexed {
                let src = source
                    .indexed
                    .then(|| from.as_ptr().add(source.index_base()).cast::<IndexPacket>());
                let dst = to.as_ptr().add(self.index_base()).cast::<IndexPacket>();
                for y in 0..copy_rows {
                    let row = dst.add(y * columns);
                    let copied = match src {
                        Some(src) => {
                            std::ptr::copy_nonoverlapping(src.add(y * source.columns), row, copy_columns);
                            copy_columns
                        }
                        None => 0,
                    };
                    std::ptr::write_bytes(row.add(copied), 0, columns - copied);
                }
                std::ptr::write_bytes(dst.add(copy_rows * columns), 0, tail);
            }
        }
    }

    fn scratch<T: Clone + Default>(&self, len: usize) -> Result<Vec<T>> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|_| Error::MemoryAllocationFailed {
                filename: self.filename.clone(),
                size: (len * size_of::<T>()) as u64,
            })?;
        buffer.resize(len, T::default());
        Ok(buffer)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Flush a mapped tier to its file.
    pub fn flush(&self) -> Result<()> {
        if let Backing::Map { map, .. } = &self.backing {
            map.flush()?;
        }
        Ok(())
    }

    /// Move the temporary backing file to `path` and keep it after drop.
    ///
    /// Only file-backed stores at offset zero can be renamed.
    pub fn usurp(&self, path: &Path) -> Result<()> {
        let mut state = self.file_state.lock();
        let Some(current) = state.path.clone() else {
            return Err(Error::UnableToPersistPixelCache {
                path: path.to_path_buf(),
                reason: "store has no backing file".into(),
            });
        };
        if self.offset != 0 {
            return Err(Error::UnableToPersistPixelCache {
                path: path.to_path_buf(),
                reason: format!("store starts at offset {}", self.offset),
            });
        }
        self.flush()?;
        std::fs::rename(&current, path).map_err(|e| Error::UnableToPersistPixelCache {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        self.registry.forget_unique_file(&current);
        state.path = Some(path.to_path_buf());
        state.persistent = true;
        debug!("usurp {} => {}", current.display(), path.display());
        Ok(())
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        let cache_type = self.cache_type;
        if self.file_state.get_mut().persistent {
            if let Backing::Map { map, .. } = &self.backing {
                if let Err(e) = map.flush() {
                    warn!("unable to flush {}: {}", self.filename, e);
                }
            }
        }
        // Unmap and close before the file goes away.
        drop(std::mem::replace(&mut self.backing, Backing::Undefined));
        let state = self.file_state.get_mut();
        if let Some(path) = state.path.take() {
            if !state.persistent && matches!(cache_type, CacheType::Map | CacheType::Disk) {
                self.registry.relinquish_unique_file(&path);
            }
        }
        if cache_type != CacheType::Undefined {
            debug!("destroy {} ({})", self.filename, cache_type);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, ResourceLimits};

    fn make_registry(limits: ResourceLimits) -> (tempfile::TempDir, Arc<ResourceRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            limits,
            ..CacheConfig::unlimited(dir.path())
        };
        (dir, ResourceRegistry::new(config).unwrap())
    }

    fn rgb(columns: usize, rows: usize) -> StoreGeometry {
        StoreGeometry::new(columns, rows, StorageClass::Direct, Colorspace::Rgb)
    }

    fn pseudo(columns: usize, rows: usize) -> StoreGeometry {
        StoreGeometry::new(columns, rows, StorageClass::Pseudo, Colorspace::Rgb)
    }

    fn disk_only() -> ResourceLimits {
        ResourceLimits {
            memory: Some(0),
            map: Some(0),
            ..ResourceLimits::unlimited()
        }
    }

    fn pattern(n: usize) -> Vec<PixelPacket> {
        (0..n)
            .map(|i| PixelPacket::rgba(i as u16, (i * 2) as u16, (i * 3) as u16, 0))
            .collect()
    }

    #[test]
    fn test_geometry_length() {
        assert_eq!(rgb(4, 4).length(), Some(128));
        assert_eq!(pseudo(4, 4).length(), Some(160));
        assert_eq!(rgb(usize::MAX, 2).length(), None);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(4 * 1024 * 1024), "4.0MB");
    }

    #[test]
    fn test_open_zero_dimensions() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let err = CacheStore::open(&registry, rgb(0, 4), "zero", &StoreTarget::Anonymous).unwrap_err();
        assert_eq!(err.code(), "NoPixelsDefinedInCache");
    }

    #[test]
    fn test_open_overflow() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let err = CacheStore::open(&registry, rgb(usize::MAX / 2, 3), "huge", &StoreTarget::Anonymous)
            .unwrap_err();
        assert_eq!(err.code(), "CacheAllocationFailed");
    }

    #[test]
    fn test_tier_selection() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let store = CacheStore::open(&registry, rgb(8, 8), "mem", &StoreTarget::Anonymous).unwrap();
        assert_eq!(store.cache_type(), CacheType::Memory);
        assert!(store.is_in_core());
        assert_eq!(registry.current(ResourceType::Memory), 512);

        let limits = ResourceLimits {
            memory: Some(0),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        let store = CacheStore::open(&registry, rgb(8, 8), "map", &StoreTarget::Anonymous).unwrap();
        assert_eq!(store.cache_type(), CacheType::Map);
        assert!(store.is_in_core());

        let (_dir, registry) = make_registry(disk_only());
        let store = CacheStore::open(&registry, rgb(8, 8), "disk", &StoreTarget::Anonymous).unwrap();
        assert_eq!(store.cache_type(), CacheType::Disk);
        assert!(!store.is_in_core());
    }

    #[test]
    fn test_area_limit_skips_memory_tiers() {
        let limits = ResourceLimits {
            area: Some(64),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        let store = CacheStore::open(&registry, rgb(8, 8), "big", &StoreTarget::Anonymous).unwrap();
        assert_eq!(store.cache_type(), CacheType::Disk);
    }

    #[test]
    fn test_all_budgets_exhausted() {
        let limits = ResourceLimits {
            disk: Some(0),
            ..disk_only()
        };
        let (_dir, registry) = make_registry(limits);
        let err = CacheStore::open(&registry, rgb(8, 8), "none", &StoreTarget::Anonymous).unwrap_err();
        assert_eq!(err.code(), "CacheResourcesExhausted");
        assert!(err.is_resource_exhaustion());
        assert_eq!(registry.usage().temporary_files, 0);
    }

    #[test]
    fn test_release_credits_budgets_and_unlinks() {
        let (_dir, registry) = make_registry(disk_only());
        let store = CacheStore::open(&registry, rgb(8, 8), "disk", &StoreTarget::Anonymous).unwrap();
        let path = store.cache_filename().unwrap();
        assert!(path.exists());
        assert_eq!(registry.current(ResourceType::Disk), 512);
        drop(store);
        assert!(!path.exists());
        assert_eq!(registry.current(ResourceType::Disk), 0);
        assert_eq!(registry.current(ResourceType::File), 0);
    }

    #[test]
    fn test_read_write_rows_memory_and_disk() {
        for limits in [ResourceLimits::unlimited(), disk_only()] {
            let (_dir, registry) = make_registry(limits);
            let store = CacheStore::open(&registry, pseudo(6, 5), "rw", &StoreTarget::Anonymous).unwrap();
            let region = Region::new(1, 2, 3, 2);
            let pixels = pattern(6);
            let indexes: Vec<IndexPacket> = (10..16).collect();
            store.write_pixels(&region, &pixels).unwrap();
            store.write_indexes(&region, &indexes).unwrap();

            let mut back = vec![PixelPacket::default(); 6];
            let mut back_indexes = vec![0; 6];
            store.read_pixels(&region, &mut back).unwrap();
            store.read_indexes(&region, &mut back_indexes).unwrap();
            assert_eq!(back, pixels);
            assert_eq!(back_indexes, indexes);

            // Neighbours untouched
            let mut row = vec![PixelPacket::rgb(9, 9, 9); 6];
            store.read_pixels(&Region::new(0, 2, 6, 1), &mut row).unwrap();
            assert_eq!(row[0], PixelPacket::default());
            assert_eq!(row[1], pixels[0]);
            assert_eq!(row[4], PixelPacket::default());
        }
    }

    #[test]
    fn test_span_rejects_out_of_range() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let store = CacheStore::open(&registry, rgb(4, 4), "span", &StoreTarget::Anonymous).unwrap();
        let mut buf = vec![PixelPacket::default(); 32];
        assert!(store.read_pixels(&Region::new(-1, 0, 1, 1), &mut buf).is_err());
        assert!(store.read_pixels(&Region::new(0, 3, 4, 2), &mut buf).is_err());
        assert!(store.read_pixels(&Region::new(3, 0, 2, 2), &mut buf).is_err());
        assert!(store.read_pixels(&Region::new(0, 0, 8, 2), &mut buf).is_ok());
    }

    #[test]
    fn test_clone_border_zero_fill() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let small = CacheStore::open(&registry, pseudo(3, 2), "small", &StoreTarget::Anonymous).unwrap();
        small.write_pixels(&Region::new(0, 0, 3, 2), &pattern(6)).unwrap();
        small.write_indexes(&Region::new(0, 0, 3, 2), &[1, 2, 3, 4, 5, 6]).unwrap();

        let (_dir2, disk_registry) = make_registry(disk_only());
        let large = CacheStore::open(&disk_registry, pseudo(5, 4), "large", &StoreTarget::Anonymous).unwrap();
        large.write_pixels(&Region::new(0, 0, 5, 4), &vec![PixelPacket::rgb(1, 1, 1); 20]).unwrap();
        large.clone_pixels(&small).unwrap();

        let mut all = vec![PixelPacket::default(); 20];
        let mut idx = vec![0; 20];
        large.read_pixels(&Region::new(0, 0, 5, 4), &mut all).unwrap();
        large.read_indexes(&Region::new(0, 0, 5, 4), &mut idx).unwrap();
        let src = pattern(6);
        for y in 0..4 {
            for x in 0..5 {
                let got = all[y * 5 + x];
                if x < 3 && y < 2 {
                    assert_eq!(got, src[y * 3 + x]);
                    assert_eq!(idx[y * 5 + x], (y * 3 + x + 1) as u16);
                } else {
                    assert_eq!(got, PixelPacket::default(), "({}, {})", x, y);
                    assert_eq!(idx[y * 5 + x], 0);
                }
            }
        }
    }

    #[test]
    fn test_clone_batch_is_bounded() {
        assert_eq!(clone_batch_rows(1), CLONE_CHUNK_PIXELS);
        assert!(clone_batch_rows(100) * 100 <= CLONE_CHUNK_PIXELS);
        assert_eq!(clone_batch_rows(100), 163);
        assert_eq!(clone_batch_rows(CLONE_CHUNK_PIXELS * 4), 1);
        assert_eq!(clone_batch_rows(0), CLONE_CHUNK_PIXELS);
    }

    #[test]
    fn test_disk_clone_in_batches() {
        let (_dir, registry) = make_registry(disk_only());
        let (columns, rows) = (200, 180);
        assert!(clone_batch_rows(columns) < rows);
        let source = CacheStore::open(&registry, pseudo(columns, rows), "src", &StoreTarget::Anonymous).unwrap();
        let all = Region::new(0, 0, columns, rows);
        let pixels = pattern(columns * rows);
        let indexes: Vec<IndexPacket> = (0..columns * rows).map(|i| (i % 251) as u16).collect();
        source.write_pixels(&all, &pixels).unwrap();
        source.write_indexes(&all, &indexes).unwrap();

        // Same stride, then a narrower and shorter target
        let same = CacheStore::open(&registry, pseudo(columns, rows), "same", &StoreTarget::Anonymous).unwrap();
        same.clone_pixels(&source).unwrap();
        let mut back = vec![PixelPacket::default(); columns * rows];
        let mut back_indexes = vec![0; columns * rows];
        same.read_pixels(&all, &mut back).unwrap();
        same.read_indexes(&all, &mut back_indexes).unwrap();
        assert_eq!(back, pixels);
        assert_eq!(back_indexes, indexes);

        let narrow = CacheStore::open(&registry, rgb(150, 200), "narrow", &StoreTarget::Anonymous).unwrap();
        narrow.clone_pixels(&source).unwrap();
        let mut back = vec![PixelPacket::default(); 150 * 200];
        narrow.read_pixels(&Region::new(0, 0, 150, 200), &mut back).unwrap();
        for y in 0..200 {
            for x in 0..150 {
                let expected = if y < rows {
                    pixels[y * columns + x]
                } else {
                    PixelPacket::default()
                };
                assert_eq!(back[y * 150 + x], expected, "({}, {})", x, y);
            }
        }
        assert_eq!(registry.current(ResourceType::Memory), 0);
    }

    #[test]
    fn test_in_core_clone_between_tiers() {
        let (_dir, memory) = make_registry(ResourceLimits::unlimited());
        let map_only = ResourceLimits {
            memory: Some(0),
            ..ResourceLimits::unlimited()
        };
        let (_dir2, mapped) = make_registry(map_only);
        let source = CacheStore::open(&memory, pseudo(3, 2), "src", &StoreTarget::Anonymous).unwrap();
        source.write_pixels(&Region::new(0, 0, 3, 2), &pattern(6)).unwrap();
        source.write_indexes(&Region::new(0, 0, 3, 2), &[1, 2, 3, 4, 5, 6]).unwrap();

        let target = CacheStore::open(&mapped, pseudo(4, 3), "dst", &StoreTarget::Anonymous).unwrap();
        assert_eq!(target.cache_type(), CacheType::Map);
        target.write_pixels(&Region::new(0, 0, 4, 3), &[PixelPacket::rgb(7, 7, 7); 12]).unwrap();
        target.clone_pixels(&source).unwrap();

        let mut back = vec![PixelPacket::default(); 12];
        let mut idx = vec![0; 12];
        target.read_pixels(&Region::new(0, 0, 4, 3), &mut back).unwrap();
        target.read_indexes(&Region::new(0, 0, 4, 3), &mut idx).unwrap();
        let src = pattern(6);
        assert_eq!(&back[..3], &src[..3]);
        assert_eq!(&back[4..7], &src[3..]);
        assert_eq!(&idx[..3], &[1, 2, 3]);
        assert_eq!(&idx[4..7], &[4, 5, 6]);
        for i in [3, 7, 8, 9, 10, 11] {
            assert_eq!(back[i], PixelPacket::default(), "{}", i);
            assert_eq!(idx[i], 0);
        }
    }

    #[test]
    fn test_is_inside() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let store = CacheStore::open(&registry, rgb(4, 3), "i", &StoreTarget::Anonymous).unwrap();
        assert!(store.is_inside(&Region::new(0, 0, 4, 3)));
        assert!(store.is_inside(&Region::new(3, 2, 1, 1)));
        assert!(!store.is_inside(&Region::new(0, 1, 8, 1)));
        assert!(!store.is_inside(&Region::new(0, 0, 4, 4)));
        assert!(!store.is_inside(&Region::new(-1, 0, 1, 1)));
        assert!(!store.is_inside(&Region::new(0, 0, 0, 1)));
    }

    #[test]
    fn test_clone_same_columns() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let a = CacheStore::open(&registry, rgb(4, 2), "a", &StoreTarget::Anonymous).unwrap();
        a.write_pixels(&Region::new(0, 0, 4, 2), &pattern(8)).unwrap();
        let b = CacheStore::open(&registry, rgb(4, 3), "b", &StoreTarget::Anonymous).unwrap();
        b.clone_pixels(&a).unwrap();
        let mut back = vec![PixelPacket::default(); 12];
        b.read_pixels(&Region::new(0, 0, 4, 3), &mut back).unwrap();
        assert_eq!(&back[..8], &pattern(8)[..]);
        assert!(back[8..].iter().all(|p| *p == PixelPacket::default()));
    }

    #[test]
    fn test_named_file_read_requires_length() {
        let (dir, registry) = make_registry(ResourceLimits::unlimited());
        let path = dir.path().join("short.cache");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let target = StoreTarget::File {
            path: path.clone(),
            offset: 0,
            mode: MapMode::Read,
        };
        let err = CacheStore::open(&registry, rgb(4, 4), "short", &target).unwrap_err();
        assert_eq!(err.code(), "UnableToExtendCache");

        let missing = StoreTarget::File {
            path: dir.path().join("missing.cache"),
            offset: 0,
            mode: MapMode::Read,
        };
        let err = CacheStore::open(&registry, rgb(4, 4), "missing", &missing).unwrap_err();
        assert_eq!(err.code(), "UnableToOpenCache");
    }

    #[test]
    fn test_named_file_survives_drop() {
        let (dir, registry) = make_registry(ResourceLimits::unlimited());
        let path = dir.path().join("keep.cache");
        let target = StoreTarget::File {
            path: path.clone(),
            offset: 4096,
            mode: MapMode::ReadWrite,
        };
        let store = CacheStore::open(&registry, rgb(4, 4), "keep", &target).unwrap();
        assert_eq!(store.cache_type(), CacheType::Map);
        assert!(store.is_persistent());
        store.write_pixels(&Region::new(0, 0, 4, 4), &pattern(16)).unwrap();
        drop(store);
        assert_eq!(registry.current(ResourceType::Map), 0);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 4096 + 128);
        assert_eq!(&bytes[4096..], bytemuck::cast_slice::<PixelPacket, u8>(&pattern(16)));
    }

    #[test]
    fn test_named_file_falls_back_to_disk() {
        let limits = ResourceLimits {
            map: Some(0),
            ..ResourceLimits::unlimited()
        };
        let (dir, registry) = make_registry(limits);
        let target = StoreTarget::File {
            path: dir.path().join("disk.cache"),
            offset: 0,
            mode: MapMode::ReadWrite,
        };
        let store = CacheStore::open(&registry, rgb(4, 4), "disk", &target).unwrap();
        assert_eq!(store.cache_type(), CacheType::Disk);
        assert!(!store.is_in_core());
    }

    #[test]
    fn test_named_read_mapping_never_writes_file() {
        let (dir, registry) = make_registry(ResourceLimits::unlimited());
        let path = dir.path().join("shared.cache");
        let mut contents = vec![0u8; 100];
        contents.extend_from_slice(bytemuck::cast_slice(&pattern(16)));
        std::fs::write(&path, &contents).unwrap();
        let target = StoreTarget::File {
            path: path.clone(),
            offset: 100,
            mode: MapMode::Read,
        };
        let store = CacheStore::open(&registry, rgb(4, 4), "shared", &target).unwrap();
        assert_eq!(store.cache_type(), CacheType::Map);
        assert!(store.is_in_core());

        let mut back = vec![PixelPacket::default(); 16];
        store.read_pixels(&Region::new(0, 0, 4, 4), &mut back).unwrap();
        assert_eq!(back, pattern(16));

        store.write_pixels(&Region::new(0, 0, 4, 1), &[PixelPacket::rgb(9, 9, 9); 4]).unwrap();
        drop(store);
        assert_eq!(std::fs::read(&path).unwrap(), contents);
    }

    #[test]
    fn test_usurp_renames_temp_file() {
        let (dir, registry) = make_registry(disk_only());
        let store = CacheStore::open(&registry, rgb(4, 4), "u", &StoreTarget::Anonymous).unwrap();
        store.write_pixels(&Region::new(0, 0, 4, 4), &pattern(16)).unwrap();
        let temp = store.cache_filename().unwrap();
        let target = dir.path().join("usurped.cache");
        store.usurp(&target).unwrap();
        assert!(!temp.exists());
        drop(store);
        assert!(target.exists());
        assert_eq!(registry.usage().temporary_files, 0);
    }

    #[test]
    fn test_retag_keeps_pixels() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let store = CacheStore::open(&registry, rgb(4, 4), "r", &StoreTarget::Anonymous).unwrap();
        store.write_pixels(&Region::new(0, 0, 4, 1), &pattern(4)).unwrap();
        let srgb = StoreGeometry::new(4, 4, StorageClass::Direct, Colorspace::Srgb);
        assert!(store.same_layout(&srgb));
        assert!(!store.same_layout(&pseudo(4, 4)));
        assert!(!store.same_layout(&rgb(2, 8)));
        store.retag(&srgb);
        let mut back = vec![PixelPacket::default(); 4];
        store.read_pixels(&Region::new(0, 0, 4, 1), &mut back).unwrap();
        assert_eq!(back, pattern(4));
        assert_eq!(store.colorspace(), Colorspace::Srgb);
        assert_eq!(store.geometry(), srgb);
    }

    #[test]
    fn test_contains() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let store = CacheStore::open(&registry, rgb(4, 3), "c", &StoreTarget::Anonymous).unwrap();
        assert!(store.contains(&Region::new(0, 0, 4, 3)));
        assert!(store.contains(&Region::new(3, 2, 1, 1)));
        assert!(store.contains(&Region::new(0, 1, 8, 1)));
        assert!(!store.contains(&Region::new(0, 2, 8, 1)));
        assert!(!store.contains(&Region::new(2, 0, 4, 1)));
        assert!(!store.contains(&Region::new(0, -1, 4, 1)));
        assert!(!store.contains(&Region::new(0, 0, 0, 1)));
        let undefined = CacheStore::undefined(Arc::clone(&registry), rgb(4, 3), "u");
        assert!(!undefined.contains(&Region::new(0, 0, 1, 1)));
    }
}
