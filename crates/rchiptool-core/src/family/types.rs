//! Chip family type definitions

use core::fmt;

use super::rules::IdentRule;
use crate::checksum;

/// Bootloader protocol spoken by a family
///
/// Each kind maps to one variant of the flashing protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProtocolKind {
    /// Fixed 16-byte blocks, ACK/NAK per block, byte sum sent at end of image
    StopAndWait,
    /// Variable-size chunks with a CRC-32 per frame and optional CRC readback
    ChunkedCrc,
}

impl ProtocolKind {
    /// Short lowercase name, as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::StopAndWait => "stop-and-wait",
            Self::ChunkedCrc => "chunked-crc",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A contiguous range of flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// Start offset in bytes
    pub offset: u32,
    /// Length in bytes
    pub size: u32,
}

impl FlashRegion {
    /// Create a new region
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    /// Check whether `[start, start + len)` intersects this region
    pub fn overlaps(&self, start: u32, len: usize) -> bool {
        if len == 0 || self.size == 0 {
            return false;
        }
        let end = start as u64 + len as u64;
        (start as u64) < self.end() && (self.offset as u64) < end
    }
}

/// Flash geometry of a chip family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Smallest erasable unit in bytes (power of two)
    pub sector_size: u32,
    /// Total flash size in bytes
    pub total_size: u32,
    /// Region holding the vendor bootloader, if any
    pub bootloader: Option<FlashRegion>,
}

impl FlashGeometry {
    /// Number of sectors in the flash
    pub fn sector_count(&self) -> u32 {
        self.total_size / self.sector_size
    }

    /// Round `addr` down to a sector boundary
    pub fn align_down(&self, addr: u64) -> u64 {
        addr & !(self.sector_size as u64 - 1)
    }

    /// Round `addr` up to a sector boundary
    pub fn align_up(&self, addr: u64) -> u64 {
        let mask = self.sector_size as u64 - 1;
        (addr + mask) & !mask
    }

    /// Check that `[addr, addr + len)` lies entirely within the flash
    pub fn fits(&self, addr: u32, len: usize) -> bool {
        addr as u64 + len as u64 <= self.total_size as u64
    }

    /// Check whether `[addr, addr + len)` touches the bootloader region
    pub fn touches_bootloader(&self, addr: u32, len: usize) -> bool {
        self.bootloader
            .is_some_and(|region| region.overlaps(addr, len))
    }
}

/// Checksum algorithm used by an embedded image header
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChecksumAlgorithm {
    /// CRC-32 (IEEE)
    Crc32,
    /// Wrapping 32-bit byte sum
    Sum32,
}

impl ChecksumAlgorithm {
    /// Compute this checksum over `data`
    pub fn compute(&self, data: &[u8]) -> u32 {
        match self {
            Self::Crc32 => checksum::crc32(data),
            Self::Sum32 => checksum::sum32(data),
        }
    }
}

/// Location of an embedded checksum and the range it covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumField {
    /// Offset of the little-endian u32 checksum value
    pub offset: u32,
    /// Algorithm used to compute it
    pub algorithm: ChecksumAlgorithm,
    /// First byte covered; coverage runs to the declared (or actual) image end
    pub start: u32,
}

/// Layout of the metadata a family's firmware images carry in their header
///
/// All fields are little-endian u32 values at fixed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderLayout {
    /// Offset of the declared total image length
    pub length_offset: Option<u32>,
    /// Offset of the declared load address
    pub load_address_offset: Option<u32>,
    /// Embedded checksum, if the format has one
    pub checksum: Option<ChecksumField>,
}

/// A supported chip family
///
/// Families are immutable once loaded into a [`Registry`](super::Registry)
/// and are referred to everywhere else by their `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    /// Family code (the same 32-bit ID stored in containers)
    pub code: u32,
    /// Short name, e.g. "bk7231n"
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Bootloader protocol
    pub protocol: ProtocolKind,
    /// Detection priority; higher wins before scores are compared
    pub priority: i32,
    /// Flash geometry
    pub geometry: FlashGeometry,
    /// Identification rules, all of which must match
    pub rules: Vec<IdentRule>,
    /// Embedded header layout, if images of this family carry one
    pub header: Option<HeaderLayout>,
}

impl Family {
    /// Total number of concrete bytes pinned by this family's rules
    pub fn rule_specificity(&self) -> usize {
        self.rules.iter().map(|r| r.specificity()).sum()
    }

    /// Check the binary against every identification rule
    ///
    /// Returns the match score, or `None` if any rule fails or the family
    /// has no rules at all.
    pub fn match_score(&self, data: &[u8]) -> Option<usize> {
        if self.rules.is_empty() {
            return None;
        }
        if self.rules.iter().all(|r| r.matches(data)) {
            Some(self.rule_specificity())
        } else {
            None
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name, self.code)
    }
}
