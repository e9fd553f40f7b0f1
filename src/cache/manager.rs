//! Cache Manager
//!
//! Moves pixels between nexus buffers and the store bound to an image, and
//! owns the lifecycle of that binding.
//!
//! # Architecture
//!
//! ```text
//!   Image ── Mutex<Arc<CacheInfo>> ──► CacheInfo ──► Arc<CacheStore>
//!     │                                  │ reference_count (owners)
//!     │                                  │ semaphore (count + rebinding)
//!     │                                  │ nexus pool (slot availability)
//!     │                                  └ virtual pixel method
//!     ├── Nexus (slot 0, may alias an in-core store)
//!     └── view ids ◄── CacheView ── staged Nexus (slot n)
//!
//!  read    acquire_cache_nexus: sync ─► set region ─► read-through
//!                               (straddling regions: runs + virtual pixels)
//!  write   set_cache_nexus:     sync ─► copy-on-write ─► validate ─► set region
//!  commit  sync_cache_nexus:    taint ─► clip mask blend ─► write-through
//! ```
//!
//! The reference count is separate from the `Arc` strong count: it counts
//! image owners, while the `Arc` also keeps a store alive for views and
//! in-core nexus buffers that still point into it.
//!
//! A view's slot is reserved on whichever binding the image currently holds.
//! When the image moves to a new binding its view slots move with it, and
//! slots reserved by other images sharing the old binding stay behind.

use std::path::Path;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::io::{page_align, MapMode};
use super::nexus::{Nexus, NexusId, NexusPool};
use super::resource::ResourceRegistry;
use super::store::{CacheStore, CacheType, Region, StoreGeometry, StoreTarget};
use super::virtual_pixel::{self, VirtualPixelMethod};
use crate::error::{Error, Result};
use crate::image::{Image, ImageCore};
use crate::pixel::{IndexPacket, PixelPacket};

// =============================================================================
// Cache Info
// =============================================================================

/// A store plus the bookkeeping shared by every image bound to it.
#[derive(Debug)]
pub struct CacheInfo {
    store: Arc<CacheStore>,
    reference_count: AtomicUsize,
    semaphore: Mutex<()>,
    nexus_pool: Mutex<NexusPool>,
    virtual_pixel_method: AtomicU8,
}

impl CacheInfo {
    fn new(store: CacheStore, method: VirtualPixelMethod, pool: NexusPool) -> Self {
        Self {
            store: Arc::new(store),
            reference_count: AtomicUsize::new(1),
            semaphore: Mutex::new(()),
            nexus_pool: Mutex::new(pool),
            virtual_pixel_method: AtomicU8::new(method as u8),
        }
    }

    /// Binding for a new image: no backing storage yet, one owner.
    pub(crate) fn undefined(
        registry: &Arc<ResourceRegistry>,
        geometry: StoreGeometry,
        filename: &str,
    ) -> Self {
        let config = registry.config();
        Self::new(
            CacheStore::undefined(Arc::clone(registry), geometry, filename),
            config.virtual_pixel_method,
            NexusPool::new(config.number_views),
        )
    }

    /// Same method as `self`, over a different store, with a fresh pool
    /// holding only the slots of `image`'s open views.
    fn successor(&self, image: &ImageCore, store: CacheStore) -> Self {
        let mut pool = NexusPool::new(image.registry.config().number_views);
        for &id in image.views.lock().iter() {
            pool.claim(id);
        }
        Self::new(store, self.virtual_pixel_method(), pool)
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Number of images bound to this store, plus one per persistence pin.
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Add an owner.
    pub(crate) fn reference(&self) -> usize {
        let _semaphore = self.semaphore.lock();
        self.reference_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop an owner, returning how many remain.
    pub(crate) fn release_reference(&self) -> usize {
        let _semaphore = self.semaphore.lock();
        let previous = self
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn virtual_pixel_method(&self) -> VirtualPixelMethod {
        VirtualPixelMethod::from_u8(self.virtual_pixel_method.load(Ordering::Relaxed))
    }

    /// Replace the method, returning the previous one.
    pub(crate) fn set_virtual_pixel_method(&self, method: VirtualPixelMethod) -> VirtualPixelMethod {
        VirtualPixelMethod::from_u8(self.virtual_pixel_method.swap(method as u8, Ordering::Relaxed))
    }

    /// Reserve a nexus slot. Pool nexuses are staged and never alias the
    /// store.
    pub(crate) fn acquire_nexus(&self) -> Result<Nexus> {
        match self.nexus_pool.lock().acquire() {
            Some(id) => Ok(Nexus::staged(id)),
            None => Err(Error::UnableToGetCacheNexus {
                filename: self.store.filename().to_string(),
            }),
        }
    }

    /// Return a nexus slot to the pool.
    pub(crate) fn release_nexus(&self, id: NexusId) {
        self.nexus_pool.lock().release(id);
    }

    /// Reserved slots, the default slot included.
    pub fn nexus_in_use(&self) -> usize {
        self.nexus_pool.lock().in_use()
    }
}

/// Swap the binding in `slot`, dropping the old owner reference.
fn rebind(image: &ImageCore, slot: &mut Arc<CacheInfo>, info: CacheInfo) -> Arc<CacheInfo> {
    slot.release_reference();
    install(image, slot, Arc::new(info))
}

/// Point `slot` at `info`, handing the image's view slots over from the old
/// binding. The new binding claimed them in `CacheInfo::successor`.
fn install(image: &ImageCore, slot: &mut Arc<CacheInfo>, info: Arc<CacheInfo>) -> Arc<CacheInfo> {
    for &id in image.views.lock().iter() {
        slot.release_nexus(id);
    }
    *slot = Arc::clone(&info);
    info
}

/// Reserve a view slot on the image's current binding.
pub(crate) fn open_view_nexus(image: &ImageCore) -> Result<Nexus> {
    let slot = image.cache.lock();
    let nexus = slot.acquire_nexus()?;
    image.views.lock().push(nexus.id());
    Ok(nexus)
}

/// Return a view slot to whichever binding the image holds now.
pub(crate) fn close_view_nexus(image: &ImageCore, id: NexusId) {
    let slot = image.cache.lock();
    image.views.lock().retain(|&view| view != id);
    slot.release_nexus(id);
}

// =============================================================================
// Open / Copy-on-Write
// =============================================================================

/// Bring the image's store in line with its geometry.
///
/// An undefined store is materialized; a store whose layout no longer
/// matches is replaced by a new one holding the cloned pixels. Class or
/// colorspace changes that keep the layout only retag the store.
pub(crate) fn sync_cache(image: &ImageCore) -> Result<Arc<CacheInfo>> {
    let geometry = image.geometry();
    let mut slot = image.cache.lock();
    let store = slot.store();
    if store.cache_type() != CacheType::Undefined {
        if store.geometry() == geometry {
            return Ok(Arc::clone(&slot));
        }
        if store.same_layout(&geometry) {
            store.retag(&geometry);
            return Ok(Arc::clone(&slot));
        }
    }

    let info = open_cache(image, &slot, geometry)?;
    Ok(rebind(image, &mut slot, info))
}

#[instrument(level = "debug", skip_all, fields(filename = %image.filename))]
fn open_cache(image: &ImageCore, previous: &CacheInfo, geometry: StoreGeometry) -> Result<CacheInfo> {
    let store = CacheStore::open(
        &image.registry,
        geometry,
        &image.filename,
        &StoreTarget::Anonymous,
    )?;
    if previous.store().cache_type() != CacheType::Undefined {
        store.clone_pixels(previous.store())?;
    }
    Ok(previous.successor(image, store))
}

/// Give the image a private store before it writes.
///
/// The count check and the clone run under the shared store's semaphore, so
/// two owners racing to write never both skip the clone.
pub(crate) fn modify_cache(image: &ImageCore) -> Result<Arc<CacheInfo>> {
    let mut slot = image.cache.lock();
    let current = Arc::clone(&slot);
    let private = {
        let _semaphore = current.semaphore.lock();
        if current.reference_count() <= 1 {
            None
        } else {
            let store = CacheStore::open(
                &image.registry,
                current.store().geometry(),
                &image.filename,
                &StoreTarget::Anonymous,
            )?;
            store.clone_pixels(current.store())?;
            current.reference_count.fetch_sub(1, Ordering::AcqRel);
            Some(current.successor(image, store))
        }
    };
    let Some(private) = private else {
        return Ok(current);
    };

    image.registry.metrics().record_copy_on_write();
    debug!(
        "copy-on-write {} ({} owners left on the shared store)",
        image.filename,
        current.reference_count()
    );
    Ok(install(image, &mut slot, Arc::new(private)))
}

// =============================================================================
// Read Path
// =============================================================================

/// Read `region` into `nexus`, synthesizing virtual pixels outside the store.
pub(crate) fn acquire_cache_nexus<'n>(
    image: &ImageCore,
    nexus: &'n mut Nexus,
    region: Region,
) -> Result<&'n [PixelPacket]> {
    if region.columns == 0 || region.rows == 0 || !is_addressable(&region) {
        return Err(out_of_bounds(image, &region));
    }
    let info = sync_cache(image)?;
    let store = info.store();
    nexus.set_region(store, region, image.clip_mask.is_some())?;
    record_residency(image, nexus);

    if store.is_inside(&region) {
        read_cache_nexus(store, nexus)?;
        return Ok(nexus.pixels());
    }

    let mut scratch = info.acquire_nexus()?;
    let result = read_virtual_region(image, &info, nexus, &mut scratch);
    info.release_nexus(scratch.id());
    result?;
    Ok(nexus.pixels())
}

/// Fill a private nexus from the store.
fn read_cache_nexus(store: &CacheStore, nexus: &mut Nexus) -> Result<()> {
    if nexus.is_in_core() {
        return Ok(());
    }
    let region = nexus.region();
    let (pixels, indexes) = nexus.pixels_and_indexes_mut();
    store.read_pixels(&region, pixels)?;
    if let Some(indexes) = indexes {
        store.read_indexes(&region, indexes)?;
    }
    Ok(())
}

/// Walk a region that is not inside the store rectangle run by run.
///
/// In-bounds runs are copied through `scratch`; each out-of-bounds pixel is
/// resolved by the virtual pixel method and read through `scratch` as a
/// one-pixel region. The nexus is private here: set_region() never aliases
/// a region that reaches outside the store.
fn read_virtual_region(
    image: &ImageCore,
    info: &CacheInfo,
    nexus: &mut Nexus,
    scratch: &mut Nexus,
) -> Result<()> {
    let store = info.store();
    let (columns, rows) = (store.columns(), store.rows());
    let method = info.virtual_pixel_method();
    let metrics = image.registry.metrics();
    let region = nexus.region();
    let (pixels, mut indexes) = nexus.pixels_and_indexes_mut();

    let mut q = 0;
    for v in 0..region.rows {
        let y = region.y + v as i64;
        let mut u = 0;
        while u < region.columns {
            let x = region.x + u as i64;
            let length = (columns as i64).saturating_sub(x).min((region.columns - u) as i64);
            if x < 0 || y < 0 || y >= rows as i64 || length <= 0 {
                let resolved =
                    virtual_pixel::resolve(method, columns, rows, x, y, image.background_color);
                scratch.set_region(store, Region::new(resolved.x, resolved.y, 1, 1), false)?;
                read_cache_nexus(store, scratch)?;
                pixels[q] = resolved.color.unwrap_or(scratch.pixels()[0]);
                if let (Some(dest), Some(src)) = (indexes.as_deref_mut(), scratch.indexes()) {
                    dest[q] = src[0];
                }
                metrics.record_virtual_pixel();
                q += 1;
                u += 1;
                continue;
            }
            let run = length as usize;
            scratch.set_region(store, Region::new(x, y, run, 1), false)?;
            read_cache_nexus(store, scratch)?;
            pixels[q..q + run].copy_from_slice(scratch.pixels());
            if let (Some(dest), Some(src)) = (indexes.as_deref_mut(), scratch.indexes()) {
                dest[q..q + run].copy_from_slice(src);
            }
            q += run;
            u += run;
        }
    }
    Ok(())
}

// =============================================================================
// Write Path
// =============================================================================

/// Hand out a writable buffer for `region`.
///
/// Only addressable regions are accepted: writing virtual pixels has no
/// meaning.
pub(crate) fn set_cache_nexus<'n>(
    image: &ImageCore,
    nexus: &'n mut Nexus,
    region: Region,
) -> Result<&'n mut [PixelPacket]> {
    sync_cache(image)?;
    let info = modify_cache(image)?;
    let store = info.store();
    if !store.contains(&region) {
        return Err(out_of_bounds(image, &region));
    }
    nexus.set_region(store, region, image.clip_mask.is_some())?;
    record_residency(image, nexus);
    Ok(nexus.pixels_mut())
}

/// Like [`set_cache_nexus`], with the current pixels read into the buffer.
pub(crate) fn get_cache_nexus<'n>(
    image: &ImageCore,
    nexus: &'n mut Nexus,
    region: Region,
) -> Result<&'n mut [PixelPacket]> {
    set_cache_nexus(image, nexus, region)?;
    let info = image.cache();
    read_cache_nexus(info.store(), nexus)?;
    Ok(nexus.pixels_mut())
}

/// Write the nexus buffer back to the store.
///
/// Marks the image tainted even when there is nothing to copy.
pub(crate) fn sync_cache_nexus(image: &ImageCore, nexus: &mut Nexus) -> Result<()> {
    image.set_tainted();
    if !nexus.is_set() {
        return Err(Error::PixelCacheIsNotOpen {
            filename: image.filename.clone(),
        });
    }
    if nexus.is_in_core() {
        return Ok(());
    }
    let info = image.cache();
    let store = info.store();
    if let Some(mask) = image.clip_mask.as_deref() {
        clip_cache_nexus(store, nexus, mask)?;
    }
    let region = nexus.region();
    store.write_pixels(&region, nexus.pixels())?;
    if let Some(indexes) = nexus.indexes() {
        store.write_indexes(&region, indexes)?;
    }
    Ok(())
}

/// Restore the stored value wherever the clip mask is fully transparent.
fn clip_cache_nexus(store: &CacheStore, nexus: &mut Nexus, mask: &Image) -> Result<()> {
    let region = nexus.region();
    let mut original: Vec<PixelPacket> = Vec::new();
    original
        .try_reserve_exact(nexus.len())
        .map_err(|_| Error::MemoryAllocationFailed {
            filename: store.filename().to_string(),
            size: (nexus.len() * std::mem::size_of::<PixelPacket>()) as u64,
        })?;
    original.resize(nexus.len(), PixelPacket::default());
    store.read_pixels(&region, &mut original)?;
    let mut original_indexes: Vec<IndexPacket> = Vec::new();
    if nexus.has_indexes() {
        original_indexes.resize(nexus.len(), 0);
        store.read_indexes(&region, &mut original_indexes)?;
    }

    let mask = mask.core();
    let mask_info = sync_cache(mask)?;
    let mut mask_nexus = mask_info.acquire_nexus()?;
    let result = acquire_cache_nexus(mask, &mut mask_nexus, region).map(|mask_pixels| {
        let (pixels, mut indexes) = nexus.pixels_and_indexes_mut();
        for (i, mask_pixel) in mask_pixels.iter().enumerate() {
            if mask_pixel.is_transparent_mask() {
                pixels[i] = original[i];
                if let Some(indexes) = indexes.as_deref_mut() {
                    indexes[i] = original_indexes[i];
                }
            }
        }
    });
    mask_info.release_nexus(mask_nexus.id());
    result
}

fn record_residency(image: &ImageCore, nexus: &Nexus) {
    let metrics = image.registry.metrics();
    if nexus.is_in_core() {
        metrics.record_in_core();
    } else {
        metrics.record_staged();
    }
}

/// Returns true if the far corner of `region` is representable.
fn is_addressable(region: &Region) -> bool {
    let fits = |origin: i64, extent: usize| {
        i64::try_from(extent)
            .ok()
            .and_then(|extent| origin.checked_add(extent))
            .is_some()
    };
    fits(region.x, region.columns) && fits(region.y, region.rows)
}

fn out_of_bounds(image: &ImageCore, region: &Region) -> Error {
    Error::RegionOutOfBounds {
        filename: image.filename.clone(),
        x: region.x,
        y: region.y,
        columns: region.columns,
        rows: region.rows,
    }
}

// =============================================================================
// Persistence
// =============================================================================

/// Next offset after a store of `length` bytes placed at `offset`.
fn next_offset(path: &Path, offset: u64, length: u64) -> Result<u64> {
    offset
        .checked_add(length)
        .map(page_align)
        .ok_or_else(|| Error::UnableToPersistPixelCache {
            path: path.to_path_buf(),
            reason: format!("offset {} overflows", offset),
        })
}

/// Bind the image to pixels already persisted at `path` starting at `offset`.
///
/// The store is mapped copy-on-write when the budgets allow and read with
/// positioned reads otherwise. It is pinned, so any write copies it first
/// and the file is never modified. On
/// success `offset` advances past the store to the next page boundary.
#[instrument(level = "debug", skip(image), fields(filename = %image.filename))]
pub(crate) fn attach_cache(image: &ImageCore, path: &Path, offset: &mut u64) -> Result<()> {
    let target = StoreTarget::File {
        path: path.to_path_buf(),
        offset: *offset,
        mode: MapMode::Read,
    };
    let store = CacheStore::open(&image.registry, image.geometry(), &image.filename, &target)?;
    let next = next_offset(path, *offset, store.length())?;

    let mut slot = image.cache.lock();
    let attached = slot.successor(image, store);
    let info = rebind(image, &mut slot, attached);
    info.reference();
    debug!("attach {} ({}[{}])", image.filename, path.display(), *offset);
    *offset = next;
    image.registry.metrics().record_persist();
    Ok(())
}

/// Persist the image's pixels to `path` at `offset` and pin the result.
///
/// A sole owner whose file-backed store starts at offset zero is persisted by
/// renaming its temporary file; everything else is copied into a new store
/// on `path`, memory-mapped when the budgets allow. On success `offset` advances past the store to the next
/// page boundary.
#[instrument(level = "debug", skip(image), fields(filename = %image.filename))]
pub(crate) fn persist_cache(image: &ImageCore, path: &Path, offset: &mut u64) -> Result<()> {
    let info = sync_cache(image)?;
    let mut slot = image.cache.lock();

    {
        let _semaphore = info.semaphore.lock();
        let store = info.store();
        let renameable = info.reference_count() == 1
            && matches!(store.cache_type(), CacheType::Map | CacheType::Disk)
            && store.offset() == 0
            && *offset == 0
            && !store.is_persistent();
        if renameable {
            match store.usurp(path) {
                Ok(()) => {
                    info.reference_count.fetch_add(1, Ordering::AcqRel);
                    *offset = next_offset(path, 0, store.length())?;
                    image.registry.metrics().record_persist();
                    debug!("persist {} => {} (renamed)", image.filename, path.display());
                    return Ok(());
                }
                Err(e) => debug!("unable to rename cache for {}: {}", image.filename, e),
            }
        }
    }

    let target = StoreTarget::File {
        path: path.to_path_buf(),
        offset: *offset,
        mode: MapMode::ReadWrite,
    };
    let store = CacheStore::open(
        &image.registry,
        info.store().geometry(),
        &image.filename,
        &target,
    )?;
    store.clone_pixels(info.store())?;
    store.flush()?;
    let next = next_offset(path, *offset, store.length())?;

    let persisted = rebind(image, &mut slot, info.successor(image, store));
    persisted.reference();
    debug!(
        "persist {} => {}[{}] (copied)",
        image.filename,
        path.display(),
        *offset
    );
    *offset = next;
    image.registry.metrics().record_persist();
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
