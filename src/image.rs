//! Image
//!
//! The owner of a pixel cache binding. An image carries the geometry and
//! class the cache must match, the background color used by virtual pixels,
//! an optional clip mask, a taint flag, and the default nexus behind the
//! simple pixel entry points.
//!
//! Cloning an image is cheap: the clone shares the store and the first write
//! through either handle gives the writer a private copy.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{
    self, CacheInfo, CacheType, CacheView, Nexus, NexusId, Region, ResourceRegistry,
    StoreGeometry, VirtualPixelMethod, DEFAULT_NEXUS,
};
use crate::error::Result;
use crate::pixel::{Colorspace, IndexPacket, PixelPacket, StorageClass, QUANTUM_RANGE};

/// Default background: opaque white.
pub const DEFAULT_BACKGROUND: PixelPacket =
    PixelPacket::rgb(QUANTUM_RANGE, QUANTUM_RANGE, QUANTUM_RANGE);

/// Everything about an image except its default nexus.
///
/// Views borrow this part so they can coexist with each other.
#[derive(Debug)]
pub(crate) struct ImageCore {
    pub(crate) filename: String,
    pub(crate) columns: usize,
    pub(crate) rows: usize,
    pub(crate) storage_class: StorageClass,
    pub(crate) colorspace: Colorspace,
    pub(crate) background_color: PixelPacket,
    pub(crate) clip_mask: Option<Box<Image>>,
    pub(crate) taint: AtomicBool,
    pub(crate) cache: Mutex<Arc<CacheInfo>>,
    /// Slots of this image's open views, reserved on the current binding.
    pub(crate) views: Mutex<Vec<NexusId>>,
    pub(crate) registry: Arc<ResourceRegistry>,
}

impl ImageCore {
    pub(crate) fn geometry(&self) -> StoreGeometry {
        StoreGeometry::new(self.columns, self.rows, self.storage_class, self.colorspace)
    }

    /// Current binding.
    pub(crate) fn cache(&self) -> Arc<CacheInfo> {
        Arc::clone(&self.cache.lock())
    }

    pub(crate) fn set_tainted(&self) {
        self.taint.store(true, Ordering::Release);
    }
}

impl Drop for ImageCore {
    fn drop(&mut self) {
        let remaining = self.cache.get_mut().release_reference();
        if remaining == 0 {
            debug!("release cache of {}", self.filename);
        }
    }
}

/// An image bound to a pixel cache.
#[derive(Debug)]
pub struct Image {
    core: ImageCore,
    nexus: Nexus,
}

impl Image {
    /// DirectClass RGB image; the cache is materialized on first access.
    pub fn new(registry: &Arc<ResourceRegistry>, columns: usize, rows: usize) -> Self {
        let storage_class = StorageClass::Direct;
        let colorspace = Colorspace::Rgb;
        let geometry = StoreGeometry::new(columns, rows, storage_class, colorspace);
        Self {
            core: ImageCore {
                filename: String::new(),
                columns,
                rows,
                storage_class,
                colorspace,
                background_color: DEFAULT_BACKGROUND,
                clip_mask: None,
                taint: AtomicBool::new(false),
                cache: Mutex::new(Arc::new(CacheInfo::undefined(registry, geometry, ""))),
                views: Mutex::new(Vec::new()),
                registry: Arc::clone(registry),
            },
            nexus: Nexus::new(DEFAULT_NEXUS),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.core.filename = filename.into();
        self
    }

    pub fn with_storage_class(mut self, storage_class: StorageClass) -> Self {
        self.set_storage_class(storage_class);
        self
    }

    pub fn with_colorspace(mut self, colorspace: Colorspace) -> Self {
        self.set_colorspace(colorspace);
        self
    }

    pub fn with_background_color(mut self, color: PixelPacket) -> Self {
        self.core.background_color = color;
        self
    }

    pub(crate) fn core(&self) -> &ImageCore {
        &self.core
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    pub fn filename(&self) -> &str {
        &self.core.filename
    }

    pub fn columns(&self) -> usize {
        self.core.columns
    }

    pub fn rows(&self) -> usize {
        self.core.rows
    }

    pub fn storage_class(&self) -> StorageClass {
        self.core.storage_class
    }

    pub fn colorspace(&self) -> Colorspace {
        self.core.colorspace
    }

    pub fn background_color(&self) -> PixelPacket {
        self.core.background_color
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.core.registry
    }

    /// Change the extent. Existing pixels survive in the overlapping
    /// rectangle on the next access.
    pub fn set_extent(&mut self, columns: usize, rows: usize) {
        self.nexus.reset();
        self.core.columns = columns;
        self.core.rows = rows;
    }

    pub fn set_storage_class(&mut self, storage_class: StorageClass) {
        self.nexus.reset();
        self.core.storage_class = storage_class;
    }

    pub fn set_colorspace(&mut self, colorspace: Colorspace) {
        self.nexus.reset();
        self.core.colorspace = colorspace;
    }

    pub fn set_background_color(&mut self, color: PixelPacket) {
        self.core.background_color = color;
    }

    /// Attach or remove the mask that gates commits.
    ///
    /// Where the mask is white, commits leave the stored pixel unchanged.
    pub fn set_clip_mask(&mut self, mask: Option<Image>) {
        self.nexus.reset();
        self.core.clip_mask = mask.map(Box::new);
    }

    pub fn clip_mask(&self) -> Option<&Image> {
        self.core.clip_mask.as_deref()
    }

    /// Returns true once any commit has been attempted on this image.
    pub fn is_tainted(&self) -> bool {
        self.core.taint.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Cache Metadata
    // -------------------------------------------------------------------------

    /// Materialize the cache now instead of on first access.
    pub fn open_cache(&self) -> Result<()> {
        cache::sync_cache(&self.core).map(|_| ())
    }

    pub fn cache_type(&self) -> CacheType {
        self.core.cache().store().cache_type()
    }

    /// Storage class the cache was opened with.
    pub fn cache_storage_class(&self) -> StorageClass {
        self.core.cache().store().storage_class()
    }

    /// Colorspace the cache was opened with.
    pub fn cache_colorspace(&self) -> Colorspace {
        self.core.cache().store().colorspace()
    }

    /// Pixels held by the cache.
    pub fn cache_area(&self) -> u64 {
        self.core.cache().store().number_pixels() as u64
    }

    /// Bytes held by the cache.
    pub fn cache_length(&self) -> u64 {
        self.core.cache().store().length()
    }

    /// Backing file of the cache, if it has one.
    pub fn cache_filename(&self) -> Option<PathBuf> {
        self.core.cache().store().cache_filename()
    }

    pub fn reference_count(&self) -> usize {
        self.core.cache().reference_count()
    }

    /// Nexus slots reserved on the cache, the default slot included.
    pub fn nexus_in_use(&self) -> usize {
        self.core.cache().nexus_in_use()
    }

    pub fn virtual_pixel_method(&self) -> VirtualPixelMethod {
        self.core.cache().virtual_pixel_method()
    }

    /// Set the policy for out-of-bounds reads, returning the previous one.
    ///
    /// The method belongs to the cache, so images sharing it see the change.
    pub fn set_virtual_pixel_method(&self, method: VirtualPixelMethod) -> VirtualPixelMethod {
        self.core.cache().set_virtual_pixel_method(method)
    }

    // -------------------------------------------------------------------------
    // Pixel Access
    // -------------------------------------------------------------------------

    /// Read-only pixels for a region; pixels outside the image are virtual.
    pub fn acquire_pixels(
        &mut self,
        x: i64,
        y: i64,
        columns: usize,
        rows: usize,
    ) -> Result<&[PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        cache::acquire_cache_nexus(&self.core, &mut self.nexus, region)
    }

    /// Writable pixels holding the current contents of an in-bounds region.
    pub fn get_pixels(
        &mut self,
        x: i64,
        y: i64,
        columns: usize,
        rows: usize,
    ) -> Result<&mut [PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        cache::get_cache_nexus(&self.core, &mut self.nexus, region)
    }

    /// Writable pixels for an in-bounds region, contents unspecified.
    pub fn set_pixels(
        &mut self,
        x: i64,
        y: i64,
        columns: usize,
        rows: usize,
    ) -> Result<&mut [PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        cache::set_cache_nexus(&self.core, &mut self.nexus, region)
    }

    /// Commit the last `get_pixels` or `set_pixels` region.
    pub fn sync_pixels(&mut self) -> Result<()> {
        cache::sync_cache_nexus(&self.core, &mut self.nexus)
    }

    /// Pixels of the last request.
    ///
    /// Takes `&mut self` because the default nexus may alias an in-core
    /// store, which open views must not be writing at the same time.
    pub fn pixels(&mut self) -> &[PixelPacket] {
        self.nexus.pixels()
    }

    /// Index records of the last request, if the image keeps them.
    pub fn indexes(&mut self) -> Option<&[IndexPacket]> {
        self.nexus.indexes()
    }

    pub fn indexes_mut(&mut self) -> Option<&mut [IndexPacket]> {
        self.nexus.indexes_mut()
    }

    /// One pixel, or the background color if it cannot be read.
    pub fn acquire_one_pixel(&mut self, x: i64, y: i64) -> PixelPacket {
        let background = self.core.background_color;
        match self.acquire_pixels(x, y, 1, 1) {
            Ok(pixels) => pixels[0],
            Err(e) => {
                debug!("unable to read pixel ({}, {}): {}", x, y, e);
                background
            }
        }
    }

    /// One pixel through the write path, or the background color.
    pub fn get_one_pixel(&mut self, x: i64, y: i64) -> PixelPacket {
        let background = self.core.background_color;
        self.get_pixels(x, y, 1, 1)
            .map(|pixels| pixels[0])
            .unwrap_or(background)
    }

    /// Open an explicit view for one thread of access.
    pub fn open_view(&self) -> Result<CacheView<'_>> {
        CacheView::open(&self.core)
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Bind to pixels persisted at `path` starting at `offset`.
    ///
    /// The file must hold this image's geometry. `offset` advances to the
    /// page-aligned position after the store.
    pub fn attach_persistent_store(&mut self, path: impl AsRef<Path>, offset: &mut u64) -> Result<()> {
        self.nexus.reset();
        cache::attach_cache(&self.core, path.as_ref(), offset)
    }

    /// Persist the pixels to `path` at `offset`, advancing `offset` to the
    /// page-aligned position after the store.
    pub fn persist(&mut self, path: impl AsRef<Path>, offset: &mut u64) -> Result<()> {
        self.nexus.reset();
        cache::persist_cache(&self.core, path.as_ref(), offset)
    }

    /// Persist to the start of `path`, renaming the temporary cache file when
    /// possible. Returns the next free offset.
    pub fn detach_with_rename(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let mut offset = 0;
        self.persist(path, &mut offset)?;
        Ok(offset)
    }
}

impl Clone for Image {
    /// Shares the cache; the first write through either image copies it.
    fn clone(&self) -> Self {
        let info = self.core.cache();
        info.reference();
        Self {
            core: ImageCore {
                filename: self.core.filename.clone(),
                columns: self.core.columns,
                rows: self.core.rows,
                storage_class: self.core.storage_class,
                colorspace: self.core.colorspace,
                background_color: self.core.background_color,
                clip_mask: self.core.clip_mask.clone(),
                taint: AtomicBool::new(self.is_tainted()),
                cache: Mutex::new(info),
                views: Mutex::new(Vec::new()),
                registry: Arc::clone(&self.core.registry),
            },
            nexus: Nexus::new(DEFAULT_NEXUS),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
