//! Pixel Records
//!
//! Fixed-depth channel tuples stored by the pixel cache, plus the index
//! record that carries palette entries (PseudoClass) or the black channel
//! (CMYK).
//!
//! # Layout
//!
//! ```text
//! PixelPacket (8 bytes, #[repr(C)])
//! ┌────────┬────────┬────────┬─────────┐
//! │  red   │ green  │  blue  │ opacity │   u16 each
//! └────────┴────────┴────────┴─────────┘
//!
//! IndexPacket (2 bytes)
//! ┌────────┐
//! │ index  │
//! └────────┘
//! ```
//!
//! Opacity follows the inverted alpha convention: `OPAQUE_OPACITY` (0) is
//! fully opaque and `TRANSPARENT_OPACITY` (`QUANTUM_RANGE`) fully transparent.

use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// One color or opacity channel value.
pub type Quantum = u16;

/// One index record (palette entry or CMYK black).
pub type IndexPacket = u16;

/// Maximum channel value.
pub const QUANTUM_RANGE: Quantum = Quantum::MAX;

/// Opacity of a fully opaque pixel.
pub const OPAQUE_OPACITY: Quantum = 0;

/// Opacity of a fully transparent pixel.
pub const TRANSPARENT_OPACITY: Quantum = QUANTUM_RANGE;

/// Size in bytes of one pixel record.
pub const PIXEL_PACKET_SIZE: usize = std::mem::size_of::<PixelPacket>();

/// Size in bytes of one index record.
pub const INDEX_PACKET_SIZE: usize = std::mem::size_of::<IndexPacket>();

// =============================================================================
// Pixel Packet
// =============================================================================

/// A single pixel record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable, Serialize, Deserialize)]
pub struct PixelPacket {
    /// Red channel
    pub red: Quantum,
    /// Green channel
    pub green: Quantum,
    /// Blue channel
    pub blue: Quantum,
    /// Opacity (0 = opaque)
    pub opacity: Quantum,
}

impl PixelPacket {
    /// Create an opaque pixel from its color channels.
    pub const fn rgb(red: Quantum, green: Quantum, blue: Quantum) -> Self {
        Self {
            red,
            green,
            blue,
            opacity: OPAQUE_OPACITY,
        }
    }

    /// Create a pixel from all four channels.
    pub const fn rgba(red: Quantum, green: Quantum, blue: Quantum, opacity: Quantum) -> Self {
        Self {
            red,
            green,
            blue,
            opacity,
        }
    }

    /// The pixel returned for the transparent virtual pixel policy.
    pub const fn transparent() -> Self {
        Self {
            red: 0,
            green: 0,
            blue: 0,
            opacity: TRANSPARENT_OPACITY,
        }
    }

    /// Luminance of the pixel scaled to the quantum range.
    ///
    /// Uses the Rec. 601 weights and rounds to the nearest quantum.
    pub fn intensity(&self) -> Quantum {
        let value = 0.299 * f64::from(self.red)
            + 0.587 * f64::from(self.green)
            + 0.114 * f64::from(self.blue)
            + 0.5;
        if value >= f64::from(QUANTUM_RANGE) {
            QUANTUM_RANGE
        } else {
            value as Quantum
        }
    }

    /// Returns true if the mask rule treats this pixel as fully transparent.
    #[inline]
    pub fn is_transparent_mask(&self) -> bool {
        self.intensity() == TRANSPARENT_OPACITY
    }
}

impl fmt::Display for PixelPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.red, self.green, self.blue, self.opacity
        )
    }
}

// =============================================================================
// Storage Class / Colorspace
// =============================================================================

/// Whether pixel color is stored directly or as a palette index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    /// Class not yet decided
    #[default]
    Undefined,
    /// Color stored in the pixel record
    Direct,
    /// Color stored as an index into a palette
    Pseudo,
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageClass::Undefined => write!(f, "Undefined"),
            StorageClass::Direct => write!(f, "DirectClass"),
            StorageClass::Pseudo => write!(f, "PseudoClass"),
        }
    }
}

/// Colorspace tag carried by the store.
///
/// The cache only cares whether the colorspace needs an index channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    #[default]
    Undefined,
    Rgb,
    Srgb,
    Gray,
    Transparent,
    Cmyk,
}

impl Colorspace {
    /// Returns true if pixels in this colorspace carry an index channel.
    #[inline]
    pub fn needs_indexes(&self) -> bool {
        matches!(self, Colorspace::Cmyk)
    }
}

impl fmt::Display for Colorspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Colorspace::Undefined => "Undefined",
            Colorspace::Rgb => "RGB",
            Colorspace::Srgb => "sRGB",
            Colorspace::Gray => "Gray",
            Colorspace::Transparent => "Transparent",
            Colorspace::Cmyk => "CMYK",
        };
        write!(f, "{}", name)
    }
}

/// Returns true if a store with this class and colorspace keeps index records.
#[inline]
pub fn has_indexes(storage_class: StorageClass, colorspace: Colorspace) -> bool {
    storage_class == StorageClass::Pseudo || colorspace.needs_indexes()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_packet_layout() {
        assert_eq!(PIXEL_PACKET_SIZE, 8);
        assert_eq!(INDEX_PACKET_SIZE, 2);
        assert_eq!(std::mem::align_of::<PixelPacket>(), 2);
    }

    #[test]
    fn test_pixel_packet_bytes() {
        let pixels = [PixelPacket::rgba(1, 2, 3, 4)];
        let bytes: &[u8] = bytemuck::cast_slice(&pixels);
        assert_eq!(bytes.len(), 8);
        let back: &[PixelPacket] = bytemuck::cast_slice(bytes);
        assert_eq!(back[0], pixels[0]);
    }

    #[test]
    fn test_intensity() {
        assert_eq!(PixelPacket::rgb(0, 0, 0).intensity(), 0);
        assert_eq!(
            PixelPacket::rgb(QUANTUM_RANGE, QUANTUM_RANGE, QUANTUM_RANGE).intensity(),
            QUANTUM_RANGE
        );
        assert_eq!(PixelPacket::rgb(1000, 1000, 1000).intensity(), 1000);
    }

    #[test]
    fn test_transparent_mask() {
        let white = PixelPacket::rgb(QUANTUM_RANGE, QUANTUM_RANGE, QUANTUM_RANGE);
        assert!(white.is_transparent_mask());
        assert!(!PixelPacket::rgb(QUANTUM_RANGE, 0, QUANTUM_RANGE).is_transparent_mask());
    }

    #[test]
    fn test_transparent_pixel() {
        let p = PixelPacket::transparent();
        assert_eq!((p.red, p.green, p.blue), (0, 0, 0));
        assert_eq!(p.opacity, TRANSPARENT_OPACITY);
    }

    #[test]
    fn test_has_indexes() {
        assert!(has_indexes(StorageClass::Pseudo, Colorspace::Rgb));
        assert!(has_indexes(StorageClass::Direct, Colorspace::Cmyk));
        assert!(!has_indexes(StorageClass::Direct, Colorspace::Rgb));
    }

    #[test]
    fn test_display() {
        assert_eq!(PixelPacket::rgba(1, 2, 3, 4).to_string(), "(1,2,3,4)");
        assert_eq!(StorageClass::Pseudo.to_string(), "PseudoClass");
        assert_eq!(Colorspace::Cmyk.to_string(), "CMYK");
    }
}
