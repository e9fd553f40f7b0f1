//! Resource Registry
//!
//! Process-wide cooperative budgets for the pixel cache, held behind an
//! explicit handle instead of global state. Every store receives an
//! `Arc<ResourceRegistry>` at construction and charges its tier against it.
//!
//! # Design
//!
//! - `acquire` commits a charge only when it fits and hands back a
//!   [`ResourceGuard`] that credits the charge when dropped
//! - temporary cache files are created with unique names and tracked so
//!   `teardown` can remove any that are still on disk
//! - `initialize`/`teardown` are serialized by an init lock and publish a
//!   ready flag

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::metrics::CacheMetrics;
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Prefix for temporary cache file names.
const TEMPORARY_PREFIX: &str = "pixel-cache-";

/// Budgeted resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceType {
    /// Per-request pixel area
    Area,
    /// Heap bytes
    Memory,
    /// Memory-mapped bytes
    Map,
    /// Disk bytes
    Disk,
    /// Open temporary files
    File,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Area => write!(f, "area"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Map => write!(f, "map"),
            ResourceType::Disk => write!(f, "disk"),
            ResourceType::File => write!(f, "file"),
        }
    }
}

/// Point-in-time budget usage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    pub memory: u64,
    pub map: u64,
    pub disk: u64,
    pub file: u64,
    pub temporary_files: usize,
}

// =============================================================================
// Registry
// =============================================================================

/// Explicit handle for the cooperative resource budgets.
pub struct ResourceRegistry {
    memory: AtomicU64,
    map: AtomicU64,
    disk: AtomicU64,
    file: AtomicU64,
    temporary_files: DashSet<PathBuf>,
    metrics: CacheMetrics,
    config: CacheConfig,
    init_lock: Mutex<()>,
    ready: AtomicBool,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("limits", &self.config.limits)
            .field("temporary_path", &self.config.temporary_path)
            .field("usage", &self.usage())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl ResourceRegistry {
    /// Create and initialize a registry for `config`.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(Self {
            memory: AtomicU64::new(0),
            map: AtomicU64::new(0),
            disk: AtomicU64::new(0),
            file: AtomicU64::new(0),
            temporary_files: DashSet::new(),
            metrics: CacheMetrics::new(),
            config,
            init_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
        });
        registry.initialize()?;
        Ok(registry)
    }

    /// Registry with the environment-derived configuration.
    pub fn from_env() -> Result<Arc<Self>> {
        Self::new(CacheConfig::from_env()?)
    }

    /// Prepare the temporary directory and mark the registry ready.
    ///
    /// Calling this on a ready registry is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let _guard = self.init_lock.lock();
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        std::fs::create_dir_all(&self.config.temporary_path).map_err(|source| {
            Error::UnableToOpenFile {
                path: self.config.temporary_path.clone(),
                source,
            }
        })?;
        self.ready.store(true, Ordering::Release);
        debug!(
            path = %self.config.temporary_path.display(),
            "resource registry ready"
        );
        Ok(())
    }

    /// Remove every temporary file still tracked and clear the ready flag.
    pub fn teardown(&self) {
        let _guard = self.init_lock.lock();
        let paths: Vec<PathBuf> = self.temporary_files.iter().map(|p| p.clone()).collect();
        for path in paths {
            self.relinquish_unique_file(&path);
        }
        self.ready.store(false, Ordering::Release);
        info!("resource registry torn down");
    }

    /// Returns true between `initialize` and `teardown`.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Configuration the registry was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Shared cache metrics.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Directory used for temporary cache files.
    pub fn temporary_path(&self) -> &Path {
        &self.config.temporary_path
    }

    // -------------------------------------------------------------------------
    // Budgets
    // -------------------------------------------------------------------------

    /// Configured limit for `kind` (`None` is unlimited).
    pub fn limit(&self, kind: ResourceType) -> Option<u64> {
        match kind {
            ResourceType::Area => self.config.limits.area,
            ResourceType::Memory => self.config.limits.memory,
            ResourceType::Map => self.config.limits.map,
            ResourceType::Disk => self.config.limits.disk,
            ResourceType::File => self.config.limits.file,
        }
    }

    /// Current charge against `kind`. Area is never accumulated.
    pub fn current(&self, kind: ResourceType) -> u64 {
        self.counter(kind)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn counter(&self, kind: ResourceType) -> Option<&AtomicU64> {
        match kind {
            ResourceType::Area => None,
            ResourceType::Memory => Some(&self.memory),
            ResourceType::Map => Some(&self.map),
            ResourceType::Disk => Some(&self.disk),
            ResourceType::File => Some(&self.file),
        }
    }

    /// Check whether `size` more of `kind` fits without charging it.
    pub fn fits(&self, kind: ResourceType, size: u64) -> bool {
        let Some(limit) = self.limit(kind) else {
            return true;
        };
        match self.counter(kind) {
            None => size < limit,
            Some(c) => c
                .load(Ordering::Acquire)
                .checked_add(size)
                .is_some_and(|total| total < limit),
        }
    }

    /// Charge `size` against `kind` if it fits.
    ///
    /// The charge is committed only on success and is credited back when the
    /// returned guard drops. Area is checked per request and never charged.
    pub fn acquire(self: &Arc<Self>, kind: ResourceType, size: u64) -> Option<ResourceGuard> {
        let limit = self.limit(kind);
        if let Some(counter) = self.counter(kind) {
            let committed = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let total = cur.checked_add(size)?;
                match limit {
                    Some(limit) if total >= limit => None,
                    _ => Some(total),
                }
            });
            if committed.is_err() {
                debug!(%kind, size, ?limit, "resource budget exhausted");
                return None;
            }
        } else if limit.is_some_and(|limit| size >= limit) {
            debug!(%kind, size, ?limit, "resource budget exhausted");
            return None;
        }
        Some(ResourceGuard {
            registry: Arc::clone(self),
            kind,
            size,
        })
    }

    fn release(&self, kind: ResourceType, size: u64) {
        if let Some(counter) = self.counter(kind) {
            let previous = counter.fetch_sub(size, Ordering::AcqRel);
            if previous < size {
                warn!(%kind, size, previous, "resource budget credited more than charged");
                counter.store(0, Ordering::Release);
            }
        }
    }

    /// Snapshot of every counter.
    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory: self.current(ResourceType::Memory),
            map: self.current(ResourceType::Map),
            disk: self.current(ResourceType::Disk),
            file: self.current(ResourceType::File),
            temporary_files: self.temporary_files.len(),
        }
    }

    // -------------------------------------------------------------------------
    // Temporary Files
    // -------------------------------------------------------------------------

    /// Create a new uniquely named read/write file in the temporary directory.
    ///
    /// The file handle budget is charged for the life of the returned guard.
    pub fn acquire_unique_file(self: &Arc<Self>) -> Result<(File, PathBuf, ResourceGuard)> {
        let guard = self.acquire(ResourceType::File, 1).ok_or_else(|| {
            Error::CacheResourcesExhausted {
                filename: self.config.temporary_path.display().to_string(),
            }
        })?;
        let path = self
            .temporary_path()
            .join(format!("{}{}", TEMPORARY_PREFIX, Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| Error::UnableToOpenFile {
                path: path.clone(),
                source,
            })?;
        self.temporary_files.insert(path.clone());
        debug!(path = %path.display(), "acquired unique file");
        Ok((file, path, guard))
    }

    /// Returns true if `path` is a tracked temporary file.
    pub fn is_temporary(&self, path: &Path) -> bool {
        self.temporary_files.contains(path)
    }

    /// Stop tracking `path` without removing it (the file became persistent).
    pub fn forget_unique_file(&self, path: &Path) -> bool {
        self.temporary_files.remove(path).is_some()
    }

    /// Remove a temporary file and stop tracking it.
    pub fn relinquish_unique_file(&self, path: &Path) -> bool {
        let tracked = self.temporary_files.remove(path).is_some();
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "unable to remove temporary file: {}", e);
            }
        }
        tracked
    }
}

// =============================================================================
// Guard
// =============================================================================

/// A committed budget charge, credited back on drop.
pub struct ResourceGuard {
    registry: Arc<ResourceRegistry>,
    kind: ResourceType,
    size: u64,
}

impl ResourceGuard {
    /// Resource kind charged.
    pub fn kind(&self) -> ResourceType {
        self.kind
    }

    /// Bytes (or handles) charged.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.registry.release(self.kind, self.size);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;

    fn make_registry(limits: ResourceLimits) -> (tempfile::TempDir, Arc<ResourceRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            limits,
            ..CacheConfig::unlimited(dir.path())
        };
        let registry = ResourceRegistry::new(config).unwrap();
        (dir, registry)
    }

    #[test]
    fn test_registry_ready_after_new() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        assert!(registry.is_ready());
        registry.teardown();
        assert!(!registry.is_ready());
        registry.initialize().unwrap();
        assert!(registry.is_ready());
    }

    #[test]
    fn test_acquire_and_release() {
        let limits = ResourceLimits {
            memory: Some(1000),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);

        let guard = registry.acquire(ResourceType::Memory, 600).unwrap();
        assert_eq!(registry.current(ResourceType::Memory), 600);
        assert!(registry.acquire(ResourceType::Memory, 600).is_none());
        // A refused request leaves the counter alone
        assert_eq!(registry.current(ResourceType::Memory), 600);

        drop(guard);
        assert_eq!(registry.current(ResourceType::Memory), 0);
        assert!(registry.acquire(ResourceType::Memory, 600).is_some());
    }

    #[test]
    fn test_limit_is_strict() {
        let limits = ResourceLimits {
            disk: Some(100),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        assert!(registry.acquire(ResourceType::Disk, 100).is_none());
        assert!(registry.acquire(ResourceType::Disk, 99).is_some());
    }

    #[test]
    fn test_zero_limit_refuses_everything() {
        let limits = ResourceLimits {
            map: Some(0),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        assert!(registry.acquire(ResourceType::Map, 0).is_none());
        assert!(!registry.fits(ResourceType::Map, 1));
    }

    #[test]
    fn test_area_is_per_request() {
        let limits = ResourceLimits {
            area: Some(100),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        let a = registry.acquire(ResourceType::Area, 80).unwrap();
        let b = registry.acquire(ResourceType::Area, 80).unwrap();
        assert!(registry.acquire(ResourceType::Area, 100).is_none());
        assert_eq!(registry.current(ResourceType::Area), 0);
        drop((a, b));
    }

    #[test]
    fn test_unique_files_are_tracked_and_removed() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let (_file, path, guard) = registry.acquire_unique_file().unwrap();
        let (_file2, path2, _guard2) = registry.acquire_unique_file().unwrap();
        assert_ne!(path, path2);
        assert!(path.exists());
        assert!(registry.is_temporary(&path));
        assert_eq!(registry.usage().temporary_files, 2);
        assert_eq!(registry.current(ResourceType::File), 2);

        assert!(registry.relinquish_unique_file(&path));
        assert!(!path.exists());
        drop(guard);
        assert_eq!(registry.current(ResourceType::File), 1);

        registry.teardown();
        assert!(!path2.exists());
        assert_eq!(registry.usage().temporary_files, 0);
    }

    #[test]
    fn test_file_budget_exhausted() {
        let limits = ResourceLimits {
            file: Some(1),
            ..ResourceLimits::unlimited()
        };
        let (_dir, registry) = make_registry(limits);
        let err = registry.acquire_unique_file().unwrap_err();
        assert_eq!(err.code(), "CacheResourcesExhausted");
    }

    #[test]
    fn test_forget_keeps_file() {
        let (_dir, registry) = make_registry(ResourceLimits::unlimited());
        let (_file, path, _guard) = registry.acquire_unique_file().unwrap();
        assert!(registry.forget_unique_file(&path));
        registry.teardown();
        assert!(path.exists());
    }
}
