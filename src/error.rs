//! Error types for the pixel cache

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification reported alongside every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// A cooperative budget or allocator refused the request
    ResourceLimitError,
    /// The cache could not service the request
    CacheError,
    /// A backing file could not be opened
    FileOpenError,
    /// The caller passed an unusable argument
    OptionError,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::ResourceLimitError => write!(f, "ResourceLimitError"),
            Severity::CacheError => write!(f, "CacheError"),
            Severity::FileOpenError => write!(f, "FileOpenError"),
            Severity::OptionError => write!(f, "OptionError"),
        }
    }
}

/// Errors that can occur in the pixel cache
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Resource Exhaustion
    // =========================================================================
    /// Every tier refused the store
    #[error("cache resources exhausted `{filename}'")]
    CacheResourcesExhausted { filename: String },

    /// Heap allocation failed
    #[error("memory allocation failed `{filename}' ({size} bytes)")]
    MemoryAllocationFailed { filename: String, size: u64 },

    /// A nexus scratch buffer could not be allocated
    #[error("pixel cache allocation failed `{filename}'")]
    PixelCacheAllocationFailed { filename: String },

    /// The store length is not representable
    #[error("cache allocation failed `{filename}': {columns}x{rows} overflows")]
    CacheAllocationFailed {
        filename: String,
        columns: usize,
        rows: usize,
    },

    // =========================================================================
    // I/O Failures
    // =========================================================================
    /// The cache backing file could not be opened
    #[error("unable to open cache `{}': {source}", path.display())]
    UnableToOpenCache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A unique temporary file could not be created
    #[error("unable to open file `{}': {source}", path.display())]
    UnableToOpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A positioned read came back short
    #[error("unable to read pixel cache `{filename}'")]
    UnableToReadPixelCache { filename: String },

    /// A positioned write came back short
    #[error("unable to write pixel cache `{filename}'")]
    UnableToWritePixelCache { filename: String },

    /// The backing file could not be sized to the store length
    #[error("unable to extend cache `{}'", path.display())]
    UnableToExtendCache { path: PathBuf },

    /// The backing file could not be renamed or cloned to its persistent path
    #[error("unable to persist pixel cache `{}': {reason}", path.display())]
    UnableToPersistPixelCache { path: PathBuf, reason: String },

    // =========================================================================
    // Cache / Geometry
    // =========================================================================
    /// The image has zero columns or rows
    #[error("no pixels defined in cache `{filename}'")]
    NoPixelsDefinedInCache { filename: String },

    /// No nexus could be reserved for a virtual pixel lookup
    #[error("unable to get cache nexus `{filename}'")]
    UnableToGetCacheNexus { filename: String },

    /// The store has no backing storage
    #[error("pixel cache is not open `{filename}'")]
    PixelCacheIsNotOpen { filename: String },

    /// The region is empty or not addressable in the store
    #[error("region {columns}x{rows}{x:+}{y:+} is outside the pixel cache `{filename}'")]
    RegionOutOfBounds {
        filename: String,
        x: i64,
        y: i64,
        columns: usize,
        rows: usize,
    },

    // =========================================================================
    // General
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Symbolic error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::CacheResourcesExhausted { .. } => "CacheResourcesExhausted",
            Error::MemoryAllocationFailed { .. } => "MemoryAllocationFailed",
            Error::PixelCacheAllocationFailed { .. } => "PixelCacheAllocationFailed",
            Error::CacheAllocationFailed { .. } => "CacheAllocationFailed",
            Error::UnableToOpenCache { .. } => "UnableToOpenCache",
            Error::UnableToOpenFile { .. } => "UnableToOpenFile",
            Error::UnableToReadPixelCache { .. } => "UnableToReadPixelCache",
            Error::UnableToWritePixelCache { .. } => "UnableToWritePixelCache",
            Error::UnableToExtendCache { .. } => "UnableToExtendCache",
            Error::UnableToPersistPixelCache { .. } => "UnableToPersistPixelCache",
            Error::NoPixelsDefinedInCache { .. } => "NoPixelsDefinedInCache",
            Error::UnableToGetCacheNexus { .. } => "UnableToGetCacheNexus",
            Error::PixelCacheIsNotOpen { .. } => "PixelCacheIsNotOpen",
            Error::RegionOutOfBounds { .. } => "RegionOutOfBounds",
            Error::Io(_) => "IoError",
            Error::Config(_) => "InvalidConfiguration",
        }
    }

    /// Severity class of the error.
    pub fn severity(&self) -> Severity {
        match self {
            Error::CacheResourcesExhausted { .. }
            | Error::MemoryAllocationFailed { .. }
            | Error::PixelCacheAllocationFailed { .. }
            | Error::CacheAllocationFailed { .. } => Severity::ResourceLimitError,
            Error::UnableToOpenCache { .. } | Error::UnableToOpenFile { .. } => {
                Severity::FileOpenError
            }
            Error::Config(_) | Error::RegionOutOfBounds { .. } => Severity::OptionError,
            _ => Severity::CacheError,
        }
    }

    /// Filename the error refers to, if any.
    pub fn filename(&self) -> Option<&str> {
        match self {
            Error::CacheResourcesExhausted { filename }
            | Error::MemoryAllocationFailed { filename, .. }
            | Error::PixelCacheAllocationFailed { filename }
            | Error::CacheAllocationFailed { filename, .. }
            | Error::UnableToReadPixelCache { filename }
            | Error::UnableToWritePixelCache { filename }
            | Error::NoPixelsDefinedInCache { filename }
            | Error::UnableToGetCacheNexus { filename }
            | Error::PixelCacheIsNotOpen { filename }
            | Error::RegionOutOfBounds { filename, .. } => Some(filename),
            Error::UnableToOpenCache { path, .. }
            | Error::UnableToOpenFile { path, .. }
            | Error::UnableToExtendCache { path }
            | Error::UnableToPersistPixelCache { path, .. } => path.to_str(),
            Error::Io(_) | Error::Config(_) => None,
        }
    }

    /// Returns true for recoverable budget or allocator refusals.
    pub fn is_resource_exhaustion(&self) -> bool {
        self.severity() == Severity::ResourceLimitError
    }
}

/// Report an invariant violation and abort the process. Never unwinds.
#[cold]
pub fn fatal(code: &str, context: &str) -> ! {
    tracing::error!(code, "fatal pixel cache error: {}", context);
    std::process::abort()
}

// =============================================================================
// Tests
// =============================================================================
