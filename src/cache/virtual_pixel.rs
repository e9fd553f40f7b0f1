//! Virtual Pixel Policy
//!
//! Maps coordinates outside `[0, columns) x [0, rows)` onto the store, or onto
//! a synthesized color. Every function here is pure; in-bounds coordinates
//! always map to themselves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::pixel::PixelPacket;

/// Policy for out-of-bounds reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum VirtualPixelMethod {
    /// Treated as `Edge`
    #[default]
    Undefined = 0,
    /// Image background color
    Background = 1,
    /// Image background color
    Constant = 2,
    /// Clamp to the nearest edge
    Edge = 3,
    /// Reflect at the boundary
    Mirror = 4,
    /// Wrap periodically
    Tile = 5,
    /// Fully transparent black
    Transparent = 6,
}

impl VirtualPixelMethod {
    /// Decode a value stored with `as u8`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Background,
            2 => Self::Constant,
            3 => Self::Edge,
            4 => Self::Mirror,
            5 => Self::Tile,
            6 => Self::Transparent,
            _ => Self::Undefined,
        }
    }
}

impl fmt::Display for VirtualPixelMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Background => "background",
            Self::Constant => "constant",
            Self::Edge => "edge",
            Self::Mirror => "mirror",
            Self::Tile => "tile",
            Self::Transparent => "transparent",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for VirtualPixelMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "undefined" => Ok(Self::Undefined),
            "background" => Ok(Self::Background),
            "constant" => Ok(Self::Constant),
            "edge" => Ok(Self::Edge),
            "mirror" => Ok(Self::Mirror),
            "tile" => Ok(Self::Tile),
            "transparent" => Ok(Self::Transparent),
            other => Err(Error::Config(format!(
                "unrecognized virtual pixel method {:?}",
                other
            ))),
        }
    }
}

/// Where a virtual pixel comes from.
///
/// The coordinate is always in bounds; it supplies the index record, and
/// the pixel record too unless `color` overrides it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPixel {
    pub x: i64,
    pub y: i64,
    pub color: Option<PixelPacket>,
}

/// Clamp `x` into `[0, extent)`.
#[inline]
pub fn edge(extent: i64, x: i64) -> i64 {
    if x < 0 {
        0
    } else if x >= extent {
        extent - 1
    } else {
        x
    }
}

/// Wrap `x` periodically into `[0, extent)`.
#[inline]
pub fn tile(extent: i64, x: i64) -> i64 {
    if x < 0 {
        extent + ((x + 1) % extent) - 1
    } else if x >= extent {
        x % extent
    } else {
        x
    }
}

/// Reflect `x` at the boundary.
#[inline]
pub fn mirror(extent: i64, x: i64) -> i64 {
    if x < 0 || x >= extent {
        extent - tile(extent, x) - 1
    } else {
        x
    }
}

/// Resolve `(x, y)` against a `columns x rows` store under `method`.
///
/// `columns` and `rows` must be non-zero.
pub fn resolve(
    method: VirtualPixelMethod,
    columns: usize,
    rows: usize,
    x: i64,
    y: i64,
    background: PixelPacket,
) -> VirtualPixel {
    let (c, r) = (columns as i64, rows as i64);
    if (0..c).contains(&x) && (0..r).contains(&y) {
        return VirtualPixel { x, y, color: None };
    }
    match method {
        VirtualPixelMethod::Background | VirtualPixelMethod::Constant => VirtualPixel {
            x: edge(c, x),
            y: edge(r, y),
            color: Some(background),
        },
        VirtualPixelMethod::Transparent => VirtualPixel {
            x: edge(c, x),
            y: edge(r, y),
            color: Some(PixelPacket::transparent()),
        },
        VirtualPixelMethod::Mirror => VirtualPixel {
            x: mirror(c, x),
            y: mirror(r, y),
            color: None,
        },
        VirtualPixelMethod::Tile => VirtualPixel {
            x: tile(c, x),
            y: tile(r, y),
            color: None,
        },
        VirtualPixelMethod::Edge | VirtualPixelMethod::Undefined => VirtualPixel {
            x: edge(c, x),
            y: edge(r, y),
            color: None,
        },
    }
}

// =============================================================================
// Tests
// =============================================================================
