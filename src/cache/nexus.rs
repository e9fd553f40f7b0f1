//! Nexus
//!
//! A nexus is one rectangular view into a store. Its buffer either aliases
//! the store's own memory (in-core) or is a private scratch buffer that is
//! filled by a read-through and emptied by a write-through.
//!
//! Nexus slots are handed out from a per-store [`NexusPool`] by integer id,
//! so growing the pool never invalidates an id held elsewhere. Slot 0 is the
//! image's default nexus and is never handed out.

use std::sync::Arc;

use super::store::{CacheStore, Region};
use crate::error::{fatal, Error, Result};
use crate::pixel::{IndexPacket, PixelPacket};

/// Index of a nexus slot in its store's pool.
pub type NexusId = usize;

/// Slot used by the image-level pixel entry points.
pub const DEFAULT_NEXUS: NexusId = 0;

// =============================================================================
// Pool
// =============================================================================

/// Availability of nexus slots for one store.
#[derive(Debug, Clone)]
pub struct NexusPool {
    available: Vec<bool>,
}

impl NexusPool {
    /// Pool with `number_views` slots; slot 0 starts reserved.
    pub fn new(number_views: usize) -> Self {
        let mut available = vec![true; number_views.max(1)];
        available[DEFAULT_NEXUS] = false;
        Self { available }
    }

    /// Reserve the lowest available slot, growing the pool when all are
    /// taken. Returns `None` only if the pool cannot grow.
    pub fn acquire(&mut self) -> Option<NexusId> {
        if let Some(id) = self.available.iter().skip(1).position(|a| *a) {
            let id = id + 1;
            self.available[id] = false;
            return Some(id);
        }
        self.available.try_reserve(1).ok()?;
        self.available.push(false);
        Some(self.available.len() - 1)
    }

    /// Mark `id` reserved, growing the pool if needed.
    pub fn claim(&mut self, id: NexusId) {
        if id >= self.available.len() {
            self.available.resize(id + 1, true);
        }
        self.available[id] = false;
    }

    /// Return `id` to the pool. The default slot is never returned.
    pub fn release(&mut self, id: NexusId) -> bool {
        match self.available.get_mut(id) {
            Some(slot) if id != DEFAULT_NEXUS && !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    /// Returns true if `id` is free.
    pub fn is_available(&self, id: NexusId) -> bool {
        self.available.get(id).copied().unwrap_or(false)
    }

    /// Number of slots, available or not.
    pub fn len(&self) -> usize {
        self.available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Number of reserved slots, the default slot included.
    pub fn in_use(&self) -> usize {
        self.available.iter().filter(|a| !**a).count()
    }
}

// =============================================================================
// Nexus
// =============================================================================

/// What a nexus buffer is.
#[derive(Debug, Default)]
pub enum NexusBacking {
    /// No region requested yet
    #[default]
    Unset,
    /// Aliases the store starting at pixel `offset`
    InCore {
        store: Arc<CacheStore>,
        offset: usize,
    },
    /// Owned scratch buffers, at least as long as the region
    Private {
        pixels: Vec<PixelPacket>,
        indexes: Vec<IndexPacket>,
    },
}

/// One view into a store.
#[derive(Debug)]
pub struct Nexus {
    id: NexusId,
    region: Region,
    length: usize,
    has_indexes: bool,
    staged: bool,
    backing: NexusBacking,
}

impl Nexus {
    pub fn new(id: NexusId) -> Self {
        Self {
            id,
            region: Region::default(),
            length: 0,
            has_indexes: false,
            staged: false,
            backing: NexusBacking::Unset,
        }
    }

    /// A nexus that never aliases store memory. Every region gets a private
    /// buffer, and data moves in and out under the store's access lock.
    pub fn staged(id: NexusId) -> Self {
        Self {
            staged: true,
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> NexusId {
        self.id
    }

    /// Region of the last request.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Pixels in the last request.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_in_core(&self) -> bool {
        matches!(self.backing, NexusBacking::InCore { .. })
    }

    pub fn is_set(&self) -> bool {
        !matches!(self.backing, NexusBacking::Unset)
    }

    pub fn has_indexes(&self) -> bool {
        self.has_indexes
    }

    /// Bind the nexus to `region` of `store`.
    ///
    /// The buffer aliases the store only when the store is in memory, the
    /// nexus is not staged, `stage` is false, and the region is one
    /// contiguous run inside the store rectangle: a single row, or full rows.
    /// Everything else gets a private buffer of at least one store row.
    pub fn set_region(&mut self, store: &Arc<CacheStore>, region: Region, stage: bool) -> Result<()> {
        let length = region.area();
        let columns = store.columns();
        let contiguous = region.rows == 1 || (region.x == 0 && region.columns == columns);

        self.region = region;
        self.length = length;
        self.has_indexes = store.has_indexes();

        if !stage && !self.staged && store.is_in_core() && store.is_inside(&region) && contiguous {
            let offset = region.y as usize * columns + region.x as usize;
            self.backing = NexusBacking::InCore {
                store: Arc::clone(store),
                offset,
            };
            return Ok(());
        }

        let needed = length.max(columns);
        if let NexusBacking::Private { pixels, indexes } = &self.backing {
            if pixels.len() >= needed && (!self.has_indexes || indexes.len() >= needed) {
                return Ok(());
            }
        }
        let pixels = scratch_buffer(needed, store.filename())?;
        let indexes = if self.has_indexes {
            scratch_buffer(needed, store.filename())?
        } else {
            Vec::new()
        };
        self.backing = NexusBacking::Private { pixels, indexes };
        Ok(())
    }

    /// Forget the region and free the scratch buffer.
    pub fn reset(&mut self) {
        self.region = Region::default();
        self.length = 0;
        self.has_indexes = false;
        self.backing = NexusBacking::Unset;
    }

    /// Pixels of the last request.
    pub fn pixels(&self) -> &[PixelPacket] {
        match &self.backing {
            NexusBacking::Unset => &[],
            NexusBacking::InCore { store, offset } => {
                let ptr = in_core_pixels(store, *offset);
                // SAFETY: set_region() only aliases regions inside the store
                // rectangle, so offset + length stays inside the pixel records,
                // and `store` keeps the memory alive for the borrow.
                unsafe { std::slice::from_raw_parts(ptr, self.length) }
            }
            NexusBacking::Private { pixels, .. } => &pixels[..self.length],
        }
    }

    /// Index records of the last request, if the store keeps them.
    pub fn indexes(&self) -> Option<&[IndexPacket]> {
        if !self.has_indexes {
            return None;
        }
        match &self.backing {
            NexusBacking::Unset => None,
            NexusBacking::InCore { store, offset } => {
                let ptr = in_core_indexes(store, *offset);
                // SAFETY: as in pixels().
                Some(unsafe { std::slice::from_raw_parts(ptr, self.length) })
            }
            NexusBacking::Private { indexes, .. } => Some(&indexes[..self.length]),
        }
    }

    /// Writable pixels of the last request.
    pub fn pixels_mut(&mut self) -> &mut [PixelPacket] {
        self.pixels_and_indexes_mut().0
    }

    /// Writable index records of the last request.
    pub fn indexes_mut(&mut self) -> Option<&mut [IndexPacket]> {
        self.pixels_and_indexes_mut().1
    }

    /// Both writable buffers at once.
    pub fn pixels_and_indexes_mut(&mut self) -> (&mut [PixelPacket], Option<&mut [IndexPacket]>) {
        let length = self.length;
        let has_indexes = self.has_indexes;
        match &mut self.backing {
            NexusBacking::Unset => (&mut [], None),
            NexusBacking::InCore { store, offset } => {
                let pixels = in_core_pixels(store, *offset);
                // SAFETY: as in pixels(). The pixel and index record arrays
                // never overlap, and concurrent views must use disjoint regions.
                let pixels = unsafe { std::slice::from_raw_parts_mut(pixels, length) };
                let indexes = has_indexes.then(|| {
                    let ptr = in_core_indexes(store, *offset);
                    // SAFETY: as above.
                    unsafe { std::slice::from_raw_parts_mut(ptr, length) }
                });
                (pixels, indexes)
            }
            NexusBacking::Private { pixels, indexes } => {
                let indexes = has_indexes.then(|| &mut indexes[..length]);
                (&mut pixels[..length], indexes)
            }
        }
    }
}

fn scratch_buffer<T: Clone + Default>(length: usize, filename: &str) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(length)
        .map_err(|_| Error::PixelCacheAllocationFailed {
            filename: filename.to_string(),
        })?;
    buffer.resize(length, T::default());
    Ok(buffer)
}

fn in_core_pixels(store: &CacheStore, offset: usize) -> *mut PixelPacket {
    match store.pixel_ptr(offset) {
        Some(ptr) => ptr.as_ptr(),
        None => fatal("ImpossibleNexusState", "in-core nexus over a store without memory"),
    }
}

fn in_core_indexes(store: &CacheStore, offset: usize) -> *mut IndexPacket {
    match store.index_ptr(offset) {
        Some(ptr) => ptr.as_ptr(),
        None => fatal("ImpossibleNexusState", "in-core nexus over a store without indexes"),
    }
}

// =============================================================================
// Tests
// =============================================================================
