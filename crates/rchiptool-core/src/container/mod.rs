//! Multi-image firmware container
//!
//! A container bundles one or more firmware payloads, each tagged with its
//! target family, load address and checksum, so that a single file describes
//! a complete multi-partition flash layout.
//!
//! # File format
//!
//! All integers are little endian.
//!
//! ```text
//! +--------------------------------------------+
//! | magic "RCTPACK\x1A" | version | rsvd | count|  file header (16 bytes)
//! +--------------------------------------------+
//! | tag | flags | length | payload offset      |  frame header (12 bytes)
//! | payload (length bytes)                     |
//! +--------------------------------------------+
//! | ... count frames in total                  |
//! +--------------------------------------------+
//! ```
//!
//! Each image is written as `FAMILY_ID, LOAD_ADDRESS, [LABEL], [VERSION],
//! IMAGE, CHECKSUM`. The checksum is the CRC-32 of the image payload.

mod codec;
mod types;

pub use codec::*;
pub use types::*;

use core::fmt;

/// Block tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Tag {
    /// Image payload bytes
    Image = 1,
    /// Target family code (u32)
    FamilyId = 2,
    /// CRC-32 of the preceding image payload (u32)
    Checksum = 3,
    /// Flash offset the image is written to (u32)
    LoadAddress = 4,
    /// Partition label (UTF-8)
    Label = 5,
    /// Firmware version string (UTF-8)
    Version = 6,
}

impl Tag {
    /// Raw tag value
    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Short name used in error messages
    pub fn name(self) -> &'static str {
        match self {
            Tag::Image => "IMAGE",
            Tag::FamilyId => "FAMILY_ID",
            Tag::Checksum => "CHECKSUM",
            Tag::LoadAddress => "LOAD_ADDRESS",
            Tag::Label => "LABEL",
            Tag::Version => "VERSION",
        }
    }
}

impl TryFrom<u16> for Tag {
    type Error = u16;

    fn try_from(value: u16) -> core::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Tag::Image),
            2 => Ok(Tag::FamilyId),
            3 => Ok(Tag::Checksum),
            4 => Ok(Tag::LoadAddress),
            5 => Ok(Tag::Label),
            6 => Ok(Tag::Version),
            other => Err(other),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Container encode/decode/validation errors
///
/// Image indices count from zero in container order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    /// Input ended before a complete structure could be read
    #[error("truncated container: needed {needed} bytes at offset 0x{offset:X}")]
    Truncated {
        /// Offset of the structure being read
        offset: usize,
        /// Bytes needed from that offset
        needed: usize,
    },
    /// Input does not start with the container magic
    #[error("not a container (bad magic)")]
    BadMagic,
    /// Container format version is not supported
    #[error("unsupported container version {0}")]
    UnsupportedVersion(u16),
    /// Stored checksum does not match the image payload
    #[error("checksum mismatch in image {image}: stored 0x{declared:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch {
        /// Image index
        image: usize,
        /// Checksum stored in the container
        declared: u32,
        /// Checksum of the payload as read
        computed: u32,
    },
    /// Block with a tag this version does not know
    #[error("unknown block tag {tag} at offset 0x{offset:X}")]
    UnknownTag {
        /// Offset of the frame header
        offset: usize,
        /// Raw tag value
        tag: u16,
    },
    /// Block framing or payload is invalid
    #[error("malformed block at offset 0x{offset:X}: {reason}")]
    MalformedBlock {
        /// Offset of the frame header (or of the trailing data)
        offset: usize,
        /// What is wrong
        reason: &'static str,
    },
    /// A block required by the image structure is absent
    #[error("image {image} is missing its {tag} block")]
    MissingBlock {
        /// Image index
        image: usize,
        /// Missing block kind
        tag: Tag,
    },
    /// Block payload exceeds the configured maximum
    #[error("block of {len} bytes exceeds the {max}-byte limit")]
    BlockTooLarge {
        /// Payload length
        len: usize,
        /// Configured maximum
        max: usize,
    },
    /// Two images of the same family overlap in flash
    #[error("images {first} and {second} overlap")]
    OverlappingImages {
        /// Index of the earlier image
        first: usize,
        /// Index of the later image
        second: usize,
    },
    /// Image extends past the end of the addressable flash
    #[error("image {image} ends at 0x{end:X}, beyond the flash limit 0x{limit:X}")]
    AddressOutOfRange {
        /// Image index
        image: usize,
        /// Exclusive end address of the image
        end: u64,
        /// Flash size (or the 32-bit address space limit)
        limit: u64,
    },
    /// Image targets a family the registry does not know
    #[error("image {image} targets unknown family 0x{code:08X}")]
    UnknownFamily {
        /// Image index
        image: usize,
        /// Family code
        code: u32,
    },
}

/// Result type for container operations
pub type Result<T> = core::result::Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_from_raw() {
        for tag in [
            Tag::Image,
            Tag::FamilyId,
            Tag::Checksum,
            Tag::LoadAddress,
            Tag::Label,
            Tag::Version,
        ] {
            assert_eq!(Tag::try_from(tag.raw()), Ok(tag));
        }
        assert_eq!(Tag::try_from(0), Err(0));
        assert_eq!(Tag::try_from(7), Err(7));
        assert_eq!(Tag::LoadAddress.to_string(), "LOAD_ADDRESS");
    }
}
