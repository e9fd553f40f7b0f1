//! Property-Based Tests for the Pixel Cache
//!
//! # Test Properties
//!
//! 1. **Round Trip**: commit then read of an in-bounds region returns the
//!    written pixels and indexes on every tier
//! 2. **Identity**: every virtual pixel method maps in-bounds coordinates
//!    to themselves
//! 3. **Determinism**: resolving the same coordinate twice gives the same
//!    result
//! 4. **Pool Safety**: slots in use are never handed out twice

#![cfg(test)]

use std::collections::HashSet;

use proptest::prelude::*;

use super::nexus::{NexusPool, DEFAULT_NEXUS};
use super::resource::ResourceRegistry;
use super::virtual_pixel::{resolve, VirtualPixelMethod};
use crate::config::{CacheConfig, ResourceLimits};
use crate::image::Image;
use crate::pixel::{Colorspace, PixelPacket, StorageClass};

// =============================================================================
// Property Strategies
// =============================================================================

fn method_strategy() -> impl Strategy<Value = VirtualPixelMethod> {
    (0u8..=6).prop_map(VirtualPixelMethod::from_u8)
}

/// Image extent plus an in-bounds region of it.
fn region_strategy() -> impl Strategy<Value = (usize, usize, i64, i64, usize, usize)> {
    (1usize..=12, 1usize..=12).prop_flat_map(|(columns, rows)| {
        (0..columns, 0..rows).prop_flat_map(move |(x, y)| {
            (
                Just(columns),
                Just(rows),
                Just(x as i64),
                Just(y as i64),
                1..=columns - x,
                1..=rows - y,
            )
        })
    })
}

fn limits_for(tier: usize) -> ResourceLimits {
    match tier {
        0 => ResourceLimits::unlimited(),
        1 => ResourceLimits {
            memory: Some(0),
            ..ResourceLimits::unlimited()
        },
        _ => ResourceLimits {
            memory: Some(0),
            map: Some(0),
            ..ResourceLimits::unlimited()
        },
    }
}

/// Pool operations: true acquires, false releases the oldest reservation.
fn pool_ops_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 1..200)
}

// =============================================================================
// Round Trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: committed pixels and indexes read back unchanged.
    #[test]
    fn prop_commit_then_read(
        (columns, rows, x, y, w, h) in region_strategy(),
        tier in 0usize..3,
        seed in any::<u16>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            limits: limits_for(tier),
            ..CacheConfig::unlimited(dir.path())
        };
        let registry = ResourceRegistry::new(config)?;
        let mut image = Image::new(&registry, columns, rows)
            .with_storage_class(StorageClass::Pseudo)
            .with_colorspace(Colorspace::Rgb);

        let written: Vec<PixelPacket> = (0..w * h)
            .map(|i| PixelPacket::rgba(seed.wrapping_add(i as u16), i as u16, seed, 0))
            .collect();
        let written_indexes: Vec<u16> = (0..w * h).map(|i| (i as u16) ^ seed).collect();

        image.set_pixels(x, y, w, h)?.copy_from_slice(&written);
        image.indexes_mut().unwrap().copy_from_slice(&written_indexes);
        image.sync_pixels()?;

        let read = image.acquire_pixels(x, y, w, h)?.to_vec();
        prop_assert_eq!(read, written);
        prop_assert_eq!(image.indexes().unwrap().to_vec(), written_indexes);
    }
}

// =============================================================================
// Virtual Pixel Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: in-bounds coordinates resolve to themselves with no color.
    #[test]
    fn prop_in_bounds_identity(
        method in method_strategy(),
        columns in 1usize..64,
        rows in 1usize..64,
        fx in 0.0f64..1.0,
        fy in 0.0f64..1.0,
    ) {
        let x = (fx * columns as f64) as i64;
        let y = (fy * rows as f64) as i64;
        let v = resolve(method, columns, rows, x, y, PixelPacket::rgb(1, 2, 3));
        prop_assert_eq!((v.x, v.y, v.color), (x, y, None));
    }

    /// Property: resolution is deterministic and always lands in bounds.
    #[test]
    fn prop_out_of_bounds_deterministic(
        method in method_strategy(),
        columns in 1usize..64,
        rows in 1usize..64,
        x in -500i64..500,
        y in -500i64..500,
    ) {
        let background = PixelPacket::rgb(4, 5, 6);
        let first = resolve(method, columns, rows, x, y, background);
        let second = resolve(method, columns, rows, x, y, background);
        prop_assert_eq!(first, second);
        prop_assert!((0..columns as i64).contains(&first.x));
        prop_assert!((0..rows as i64).contains(&first.y));
    }
}

// =============================================================================
// Pool Safety
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: no slot is reserved twice, and slot 0 is never handed out.
    #[test]
    fn prop_pool_never_aliases(ops in pool_ops_strategy(), views in 1usize..8) {
        let mut pool = NexusPool::new(views);
        let mut held: Vec<usize> = Vec::new();
        for acquire in ops {
            if acquire || held.is_empty() {
                let id = pool.acquire().unwrap();
                prop_assert_ne!(id, DEFAULT_NEXUS);
                prop_assert!(!held.contains(&id));
                held.push(id);
            } else {
                let id = held.remove(0);
                prop_assert!(pool.release(id));
            }
            let unique: HashSet<_> = held.iter().collect();
            prop_assert_eq!(unique.len(), held.len());
            prop_assert_eq!(pool.in_use(), held.len() + 1);
        }
    }
}
