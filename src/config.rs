//! Cache Configuration
//!
//! Resource limits and runtime knobs for the pixel cache. Limits default to
//! values derived from the host and can be overridden from the environment:
//!
//! | Variable | Unit |
//! |---|---|
//! | `MAGICK_AREA_LIMIT` | megabytes |
//! | `MAGICK_MEMORY_LIMIT` | megabytes |
//! | `MAGICK_MAP_LIMIT` | megabytes |
//! | `MAGICK_DISK_LIMIT` | gigabytes |
//! | `MAGICK_FILES_LIMIT` | open files |
//! | `MAGICK_TMPDIR` | directory |

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{VirtualPixelMethod, DEFAULT_NUMBER_VIEWS};
use crate::error::{Error, Result};

const MEGABYTE: u64 = 1024 * 1024;
const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Memory assumed when the host cannot report physical pages.
const FALLBACK_MEMORY_LIMIT: u64 = 256 * MEGABYTE;

/// Floor for the open-file budget.
const MIN_FILE_LIMIT: u64 = 8;

// =============================================================================
// Resource Limits
// =============================================================================

/// Cooperative budgets, in bytes (files in handles). `None` is unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Largest single store that may live in memory or a mapping
    pub area: Option<u64>,
    /// Heap budget shared by all stores
    pub memory: Option<u64>,
    /// Memory-mapped budget shared by all stores
    pub map: Option<u64>,
    /// Disk budget shared by all stores
    pub disk: Option<u64>,
    /// Temporary file handles
    pub file: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_system()
    }
}

impl ResourceLimits {
    /// No budget is enforced.
    pub fn unlimited() -> Self {
        Self {
            area: None,
            memory: None,
            map: None,
            disk: None,
            file: None,
        }
    }

    /// Limits derived from the host's physical memory and open-file limit.
    pub fn from_system() -> Self {
        let memory = physical_memory().unwrap_or(FALLBACK_MEMORY_LIMIT);
        let file = open_file_limit()
            .map(|max| (3 * max / 4).max(MIN_FILE_LIMIT))
            .unwrap_or(MIN_FILE_LIMIT);
        Self {
            area: Some(memory / 2),
            memory: Some(memory),
            map: Some(memory.saturating_mul(2)),
            disk: None,
            file: Some(file),
        }
    }

    /// System limits with `MAGICK_*_LIMIT` overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut limits = Self::from_system();
        limits.apply_env(|name| std::env::var(name).ok())?;
        Ok(limits)
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAGICK_AREA_LIMIT") {
            self.area = Some(parse_limit("MAGICK_AREA_LIMIT", &v, MEGABYTE)?);
        }
        if let Some(v) = lookup("MAGICK_MEMORY_LIMIT") {
            self.memory = Some(parse_limit("MAGICK_MEMORY_LIMIT", &v, MEGABYTE)?);
        }
        if let Some(v) = lookup("MAGICK_MAP_LIMIT") {
            self.map = Some(parse_limit("MAGICK_MAP_LIMIT", &v, MEGABYTE)?);
        }
        if let Some(v) = lookup("MAGICK_DISK_LIMIT") {
            self.disk = Some(parse_limit("MAGICK_DISK_LIMIT", &v, GIGABYTE)?);
        }
        if let Some(v) = lookup("MAGICK_FILES_LIMIT") {
            self.file = Some(parse_limit("MAGICK_FILES_LIMIT", &v, 1)?);
        }
        Ok(())
    }
}

fn parse_limit(name: &str, value: &str, unit: u64) -> Result<u64> {
    let n: u64 = value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be an integer, got {:?}", name, value)))?;
    Ok(n.saturating_mul(unit))
}

#[cfg(unix)]
fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || pagesize <= 0 {
        return None;
    }
    Some((pages as u64).saturating_mul(pagesize as u64))
}

#[cfg(not(unix))]
fn physical_memory() -> Option<u64> {
    None
}

#[cfg(unix)]
fn open_file_limit() -> Option<u64> {
    // SAFETY: sysconf has no preconditions.
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    (max > 0).then_some(max as u64)
}

#[cfg(not(unix))]
fn open_file_limit() -> Option<u64> {
    None
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// Pixel cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resource budgets
    pub limits: ResourceLimits,
    /// Directory for temporary cache files
    pub temporary_path: PathBuf,
    /// Nexus slots reserved per store
    pub number_views: usize,
    /// Policy assigned to newly created stores
    pub virtual_pixel_method: VirtualPixelMethod,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            temporary_path: std::env::temp_dir(),
            number_views: DEFAULT_NUMBER_VIEWS,
            virtual_pixel_method: VirtualPixelMethod::Edge,
        }
    }
}

impl CacheConfig {
    /// Default configuration with environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            limits: ResourceLimits::from_env()?,
            ..Self::default()
        };
        if let Ok(dir) = std::env::var("MAGICK_TMPDIR") {
            if !dir.is_empty() {
                config.temporary_path = PathBuf::from(dir);
            }
        }
        debug!(?config, "loaded pixel cache configuration");
        Ok(config)
    }

    /// Configuration with no budgets, rooted at `temporary_path`.
    pub fn unlimited(temporary_path: impl Into<PathBuf>) -> Self {
        Self {
            limits: ResourceLimits::unlimited(),
            temporary_path: temporary_path.into(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_system_limits_relationships() {
        let limits = ResourceLimits::from_system();
        let memory = limits.memory.unwrap();
        assert_eq!(limits.area, Some(memory / 2));
        assert_eq!(limits.map, Some(memory * 2));
        assert_eq!(limits.disk, None);
        assert!(limits.file.unwrap() >= MIN_FILE_LIMIT);
    }

    #[test]
    fn test_env_overrides_units() {
        let vars: HashMap<&str, &str> = [
            ("MAGICK_MEMORY_LIMIT", "64"),
            ("MAGICK_MAP_LIMIT", "128"),
            ("MAGICK_DISK_LIMIT", "2"),
            ("MAGICK_FILES_LIMIT", "16"),
        ]
        .into_iter()
        .collect();
        let mut limits = ResourceLimits::unlimited();
        limits
            .apply_env(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(limits.memory, Some(64 * MEGABYTE));
        assert_eq!(limits.map, Some(128 * MEGABYTE));
        assert_eq!(limits.disk, Some(2 * GIGABYTE));
        assert_eq!(limits.file, Some(16));
        assert_eq!(limits.area, None);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut limits = ResourceLimits::unlimited();
        let result = limits.apply_env(|name| {
            (name == "MAGICK_AREA_LIMIT").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.number_views, DEFAULT_NUMBER_VIEWS);
        assert_eq!(config.virtual_pixel_method, VirtualPixelMethod::Edge);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = CacheConfig::unlimited("/tmp");
        let json = serde_json::to_string(&config).unwrap();
        let back: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.limits, ResourceLimits::unlimited());
        assert_eq!(back.temporary_path, PathBuf::from("/tmp"));
    }
}
