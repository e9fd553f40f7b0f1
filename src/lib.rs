//! Pixel Cache - Tiered Backing Storage for Image Pixels
//!
//! Stores the pixels of an image in heap memory, a memory-mapped temporary
//! file, or a plain disk file, and hands out rectangular views into them.
//! Reads outside the image are answered with virtual pixels, cheap image
//! clones share one store until the first write, and stores can be persisted
//! to named files and attached again later.
//!
//! # Architecture
//!
//! ```text
//! Image ──► Cache Manager ──► Cache Store ──► Memory | Map | Disk
//!   │            │                 │
//!   │            ├─ Nexus pool     └─ Resource registry (budgets)
//!   │            └─ Virtual pixel policy
//!   └─ CacheView (one per thread)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pixel_cache::{CacheConfig, Image, PixelPacket, ResourceRegistry};
//!
//! # fn main() -> pixel_cache::Result<()> {
//! let registry = ResourceRegistry::new(CacheConfig::from_env()?)?;
//! let mut image = Image::new(&registry, 640, 480);
//! image.set_pixels(0, 0, 640, 1)?.fill(PixelPacket::rgb(0, 0, 65535));
//! image.sync_pixels()?;
//! let edge = image.acquire_pixels(-2, 0, 4, 1)?;
//! assert_eq!(edge.len(), 4);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Store, nexus, views, virtual pixels, budgets, metrics
//! - [`config`] - Resource limits and cache configuration
//! - [`error`] - Error types
//! - [`image`] - The image that owns a cache binding
//! - [`pixel`] - Pixel and index records

pub mod cache;
pub mod config;
pub mod error;
pub mod image;
pub mod pixel;

// Re-export commonly used types
pub use cache::{
    CacheMetrics, CacheStore, CacheType, CacheView, MetricsSnapshot, Region, ResourceRegistry,
    ResourceType, VirtualPixelMethod,
};
pub use config::{CacheConfig, ResourceLimits};
pub use error::{Error, Result, Severity};
pub use image::Image;
pub use pixel::{
    Colorspace, IndexPacket, PixelPacket, Quantum, StorageClass, QUANTUM_RANGE,
};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
