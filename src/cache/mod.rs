//! Pixel Cache
//!
//! Backing storage for image pixels with region views, virtual pixels at the
//! edges, copy-on-write sharing, and persistence to named files.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Manager                                  │
//! │     read / write / commit paths, copy-on-write, persistence              │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Nexus pool           │ Virtual pixel policy  │ Cache views              │
//! │  (slot 0 = default)   │ edge/mirror/tile/...  │ one nexus per thread     │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                            Cache Store                                   │
//! │  Memory (heap)        │ Map (mmap temp file)  │ Disk (pread/pwrite)      │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │        Resource registry: area / memory / map / disk / file budgets      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - Tier choice is made once per store; a store never changes tier
//! - Nexus slots are addressed by index so the pool can grow freely
//! - In-core nexus buffers alias the store; everything else is staged
//! - Budgets are cooperative counters credited back when a store drops

mod io;
mod manager;
mod metrics;
mod nexus;
mod proptest;
mod resource;
mod store;
mod view;
pub mod virtual_pixel;

pub use io::{page_align, page_size, MapMode};
pub use manager::CacheInfo;
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use nexus::{Nexus, NexusBacking, NexusId, NexusPool, DEFAULT_NEXUS};
pub use resource::{ResourceGuard, ResourceRegistry, ResourceType, ResourceUsage};
pub use store::{format_size, CacheStore, CacheType, Region, StoreGeometry, StoreTarget};
pub use view::CacheView;
pub use virtual_pixel::VirtualPixelMethod;

pub(crate) use manager::{
    acquire_cache_nexus, attach_cache, get_cache_nexus, persist_cache, set_cache_nexus,
    sync_cache, sync_cache_nexus,
};

/// Nexus slots reserved per store before the pool has to grow
pub const DEFAULT_NUMBER_VIEWS: usize = 6;

/// Alignment of heap-backed stores (x86-64 cache line)
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_line_alignment() {
        assert!(CACHE_LINE_SIZE.is_power_of_two());
        assert_eq!(CACHE_LINE_SIZE % std::mem::align_of::<crate::pixel::PixelPacket>(), 0);
    }

    #[test]
    fn test_default_views_leave_room_past_slot_zero() {
        let pool = NexusPool::new(DEFAULT_NUMBER_VIEWS);
        assert_eq!(pool.len(), DEFAULT_NUMBER_VIEWS);
        assert_eq!(pool.in_use(), 1);
    }
}
