//! Cache Views
//!
//! A view is an explicit nexus handle for one thread of access. Each view
//! reserves its own slot in the store's nexus pool, so workers on disjoint
//! regions of one image never share a buffer.
//!
//! View buffers are always private. Reads copy out of the store and `sync`
//! copies back under the store's access lock, so two views over the same
//! region never hold aliasing slices; the last commit wins.

use tracing::trace;

use super::manager;
use super::nexus::{Nexus, NexusId};
use super::store::Region;
use crate::error::Result;
use crate::image::ImageCore;
use crate::pixel::{IndexPacket, PixelPacket};

/// An explicit nexus over one image.
///
/// Closing (or dropping) the view returns its slot to the pool.
#[derive(Debug)]
pub struct CacheView<'a> {
    image: &'a ImageCore,
    nexus: Nexus,
}

impl<'a> CacheView<'a> {
    /// Materialize the image's cache and reserve a nexus slot.
    pub(crate) fn open(image: &'a ImageCore) -> Result<Self> {
        manager::sync_cache(image)?;
        let nexus = manager::open_view_nexus(image)?;
        trace!(id = nexus.id(), "open cache view on {}", image.filename);
        Ok(Self { image, nexus })
    }

    pub fn id(&self) -> NexusId {
        self.nexus.id()
    }

    /// Read-only pixels for a region; out-of-bounds pixels are virtual.
    pub fn acquire(&mut self, x: i64, y: i64, columns: usize, rows: usize) -> Result<&[PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        manager::acquire_cache_nexus(self.image, &mut self.nexus, region)
    }

    /// Writable pixels holding the current contents of an in-bounds region.
    pub fn get(&mut self, x: i64, y: i64, columns: usize, rows: usize) -> Result<&mut [PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        manager::get_cache_nexus(self.image, &mut self.nexus, region)
    }

    /// Writable pixels for an in-bounds region, contents unspecified.
    pub fn set(&mut self, x: i64, y: i64, columns: usize, rows: usize) -> Result<&mut [PixelPacket]> {
        let region = Region::new(x, y, columns, rows);
        manager::set_cache_nexus(self.image, &mut self.nexus, region)
    }

    /// Commit the last `get` or `set` to the store.
    pub fn sync(&mut self) -> Result<()> {
        manager::sync_cache_nexus(self.image, &mut self.nexus)
    }

    /// Pixels of the last request.
    pub fn pixels(&self) -> &[PixelPacket] {
        self.nexus.pixels()
    }

    pub fn pixels_mut(&mut self) -> &mut [PixelPacket] {
        self.nexus.pixels_mut()
    }

    /// Index records of the last request, if the image keeps them.
    pub fn indexes(&self) -> Option<&[IndexPacket]> {
        self.nexus.indexes()
    }

    pub fn indexes_mut(&mut self) -> Option<&mut [IndexPacket]> {
        self.nexus.indexes_mut()
    }

    /// Return the slot to the pool.
    pub fn close(self) {}
}

impl Drop for CacheView<'_> {
    fn drop(&mut self) {
        let id = self.nexus.id();
        self.nexus.reset();
        manager::close_view_nexus(self.image, id);
        trace!(id, "close cache view on {}", self.image.filename);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::cache::resource::ResourceRegistry;
    use crate::cache::CacheType;
    use crate::config::CacheConfig;
    use crate::image::Image;
    use crate::pixel::PixelPacket;

    #[test]
    fn test_views_reserve_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let image = Image::new(&registry, 4, 4);
        let a = image.open_view().unwrap();
        let b = image.open_view().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
        assert_eq!(image.nexus_in_use(), 3);
        a.close();
        drop(b);
        assert_eq!(image.nexus_in_use(), 1);
    }

    #[test]
    fn test_view_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let image = Image::new(&registry, 4, 4);
        let mut view = image.open_view().unwrap();
        view.set(1, 1, 2, 1).unwrap().fill(PixelPacket::rgb(5, 6, 7));
        view.sync().unwrap();

        let row = view.acquire(0, 1, 4, 1).unwrap();
        assert_eq!(row[0], PixelPacket::default());
        assert_eq!(row[1], PixelPacket::rgb(5, 6, 7));
        assert_eq!(row[2], PixelPacket::rgb(5, 6, 7));
        assert_eq!(view.pixels().len(), 4);
        assert!(view.indexes().is_none());
        assert!(image.is_tainted());
    }

    #[test]
    fn test_view_get_reads_existing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let image = Image::new(&registry, 4, 2);
        let mut view = image.open_view().unwrap();
        view.set(0, 0, 4, 2).unwrap().fill(PixelPacket::rgb(1, 1, 1));
        view.sync().unwrap();

        let pixels = view.get(1, 0, 2, 2).unwrap();
        assert!(pixels.iter().all(|p| *p == PixelPacket::rgb(1, 1, 1)));
        pixels[0].red = 40;
        view.sync().unwrap();
        assert_eq!(view.acquire(1, 0, 1, 1).unwrap()[0].red, 40);
    }

    #[test]
    fn test_overlapping_views_do_not_alias() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let image = Image::new(&registry, 4, 4);
        image.open_cache().unwrap();
        assert_eq!(image.cache_type(), CacheType::Memory);

        let mut a = image.open_view().unwrap();
        let mut b = image.open_view().unwrap();
        let first = a.set(0, 0, 4, 1).unwrap();
        let second = b.set(0, 0, 4, 1).unwrap();
        assert_ne!(first.as_ptr(), second.as_ptr());
        first.fill(PixelPacket::rgb(1, 1, 1));
        second.fill(PixelPacket::rgb(2, 2, 2));
        assert_eq!(a.pixels()[0], PixelPacket::rgb(1, 1, 1));

        a.sync().unwrap();
        b.sync().unwrap();
        assert_eq!(a.acquire(0, 0, 4, 1).unwrap(), &[PixelPacket::rgb(2, 2, 2); 4]);
    }

    #[test]
    fn test_view_slots_follow_the_writer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let a = Image::new(&registry, 4, 4);
        a.open_cache().unwrap();
        let b = a.clone();
        let a_view = a.open_view().unwrap();
        let mut b_view = b.open_view().unwrap();
        assert_eq!(a.nexus_in_use(), 3);

        // b copies on write and takes only its own view slot along
        b_view.set(0, 0, 1, 1).unwrap()[0] = PixelPacket::rgb(9, 9, 9);
        b_view.sync().unwrap();
        assert_eq!(b.reference_count(), 1);
        assert_eq!(b.nexus_in_use(), 2);
        assert_eq!(a.nexus_in_use(), 2);

        drop(b_view);
        assert_eq!(b.nexus_in_use(), 1);
        assert_eq!(a.nexus_in_use(), 2);
        drop(a_view);
        assert_eq!(a.nexus_in_use(), 1);
    }

    #[test]
    fn test_view_slot_moves_with_copy_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ResourceRegistry::new(CacheConfig::unlimited(dir.path())).unwrap();
        let a = Image::new(&registry, 4, 4);
        a.open_cache().unwrap();
        let b = a.clone();
        let mut view = a.open_view().unwrap();
        view.set(0, 0, 4, 1).unwrap().fill(PixelPacket::rgb(3, 3, 3));
        view.sync().unwrap();

        assert_eq!(a.reference_count(), 1);
        assert_eq!(a.nexus_in_use(), 2);
        assert_eq!(b.nexus_in_use(), 1);
        view.close();
        assert_eq!(a.nexus_in_use(), 1);
        assert_eq!(b.nexus_in_use(), 1);
    }
}
