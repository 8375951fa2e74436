//! Container encoding and decoding

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::types::{Container, Image};
use super::{ContainerError, Result, Tag};
use crate::checksum::crc32;

/// Container magic: "RCTPACK" followed by a DOS EOF byte
pub const MAGIC: [u8; 8] = *b"RCTPACK\x1A";

/// Current container format version
pub const FORMAT_VERSION: u16 = 1;

/// Size of the file header
pub const FILE_HEADER_LEN: usize = 16;

/// Size of each frame header
pub const FRAME_HEADER_LEN: usize = 12;

/// Default bound on a single block payload (16 MiB)
pub const DEFAULT_MAX_BLOCK_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct FileHeader {
    magic: [u8; 8],
    version: U16,
    reserved: U16,
    block_count: U32,
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct FrameHeader {
    tag: U16,
    flags: U16,
    length: U32,
    offset: U32,
}

/// Codec limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// Largest payload accepted for a single block
    pub max_block_len: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            max_block_len: DEFAULT_MAX_BLOCK_LEN,
        }
    }
}

impl Container {
    /// Encode with default limits
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with(&CodecOptions::default())
    }

    /// Encode into the container file format
    ///
    /// Checksum blocks are always recomputed from the payloads.
    pub fn encode_with(&self, options: &CodecOptions) -> Result<Vec<u8>> {
        self.check_layout()?;

        let blocks = self.blocks();
        let block_count = u32::try_from(blocks.len()).map_err(|_| ContainerError::BlockTooLarge {
            len: blocks.len(),
            max: u32::MAX as usize,
        })?;

        let total = FILE_HEADER_LEN
            + blocks
                .iter()
                .map(|b| FRAME_HEADER_LEN + b.payload.len())
                .sum::<usize>();
        let mut out = Vec::with_capacity(total);

        let header = FileHeader {
            magic: MAGIC,
            version: U16::new(FORMAT_VERSION),
            reserved: U16::new(0),
            block_count: U32::new(block_count),
        };
        out.extend_from_slice(header.as_bytes());

        for block in &blocks {
            let len = block.payload.len();
            if len > options.max_block_len {
                return Err(ContainerError::BlockTooLarge {
                    len,
                    max: options.max_block_len,
                });
            }
            let payload_offset = out.len() + FRAME_HEADER_LEN;
            let (Ok(length), Ok(offset)) = (u32::try_from(len), u32::try_from(payload_offset))
            else {
                return Err(ContainerError::BlockTooLarge {
                    len,
                    max: u32::MAX as usize,
                });
            };

            let frame = FrameHeader {
                tag: U16::new(block.tag.raw()),
                flags: U16::new(0),
                length: U32::new(length),
                offset: U32::new(offset),
            };
            out.extend_from_slice(frame.as_bytes());
            out.extend_from_slice(&block.payload);
        }

        log::debug!(
            "container: encoded {} images in {} blocks ({} bytes)",
            self.len(),
            blocks.len(),
            out.len()
        );
        Ok(out)
    }

    /// Decode with default limits
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::decode_with(bytes, &CodecOptions::default())
    }

    /// Decode a container
    ///
    /// Any error aborts the whole decode.
    pub fn decode_with(bytes: &[u8], options: &CodecOptions) -> Result<Self> {
        // Magic first, so unrelated input is rejected before anything else.
        // A short input that is a prefix of the magic is merely truncated.
        let probe = bytes.len().min(MAGIC.len());
        if bytes[..probe] != MAGIC[..probe] {
            return Err(ContainerError::BadMagic);
        }

        let (header, mut rest) =
            FileHeader::read_from_prefix(bytes).map_err(|_| ContainerError::Truncated {
                offset: 0,
                needed: FILE_HEADER_LEN,
            })?;
        debug_assert_eq!(header.magic, MAGIC);
        if header.version.get() != FORMAT_VERSION {
            return Err(ContainerError::UnsupportedVersion(header.version.get()));
        }
        if header.reserved.get() != 0 {
            return Err(ContainerError::MalformedBlock {
                offset: 0,
                reason: "non-zero reserved header field",
            });
        }

        let block_count = header.block_count.get();
        let mut offset = FILE_HEADER_LEN;
        let mut assembler = Assembler::default();

        for _ in 0..block_count {
            let (frame, after) =
                FrameHeader::read_from_prefix(rest).map_err(|_| ContainerError::Truncated {
                    offset,
                    needed: FRAME_HEADER_LEN,
                })?;

            let raw_tag = frame.tag.get();
            let tag = Tag::try_from(raw_tag).map_err(|tag| ContainerError::UnknownTag {
                offset,
                tag,
            })?;
            if frame.flags.get() != 0 {
                return Err(ContainerError::MalformedBlock {
                    offset,
                    reason: "non-zero frame flags",
                });
            }

            let len = frame.length.get() as usize;
            if len > options.max_block_len {
                return Err(ContainerError::BlockTooLarge {
                    len,
                    max: options.max_block_len,
                });
            }

            let payload_offset = offset + FRAME_HEADER_LEN;
            if frame.offset.get() as usize != payload_offset {
                return Err(ContainerError::MalformedBlock {
                    offset,
                    reason: "payload offset does not follow its frame header",
                });
            }

            let payload = after.get(..len).ok_or(ContainerError::Truncated {
                offset: payload_offset,
                needed: len,
            })?;
            assembler.push(tag, payload, offset)?;

            rest = &after[len..];
            offset = payload_offset + len;
        }

        if !rest.is_empty() {
            return Err(ContainerError::MalformedBlock {
                offset,
                reason: "trailing data after the last block",
            });
        }

        let container = Container::new(assembler.finish()?);
        container.check_layout()?;

        log::debug!(
            "container: decoded {} images from {} blocks",
            container.len(),
            block_count
        );
        Ok(container)
    }
}

/// Groups the block stream back into images
#[derive(Default)]
struct Assembler {
    images: Vec<Image>,
    family: Option<u32>,
    load_address: Option<u32>,
    label: Option<String>,
    version: Option<String>,
    payload: Option<Vec<u8>>,
}

impl Assembler {
    fn index(&self) -> usize {
        self.images.len()
    }

    fn has_pending_metadata(&self) -> bool {
        self.family.is_some()
            || self.load_address.is_some()
            || self.label.is_some()
            || self.version.is_some()
    }

    fn missing(&self, tag: Tag) -> ContainerError {
        ContainerError::MissingBlock {
            image: self.index(),
            tag,
        }
    }

    fn push(&mut self, tag: Tag, payload: &[u8], offset: usize) -> Result<()> {
        // Once the IMAGE block is in, only its CHECKSUM may follow
        if self.payload.is_some() && tag != Tag::Checksum {
            return Err(self.missing(Tag::Checksum));
        }

        match tag {
            Tag::FamilyId => {
                if self.family.is_some() {
                    return Err(duplicate(offset));
                }
                self.family = Some(read_u32(payload, offset)?);
            }
            Tag::LoadAddress => {
                if self.family.is_none() {
                    return Err(self.missing(Tag::FamilyId));
                }
                if self.load_address.is_some() {
                    return Err(duplicate(offset));
                }
                self.load_address = Some(read_u32(payload, offset)?);
            }
            Tag::Label | Tag::Version => {
                if self.family.is_none() {
                    return Err(self.missing(Tag::FamilyId));
                }
                let slot = if tag == Tag::Label {
                    &mut self.label
                } else {
                    &mut self.version
                };
                if slot.is_some() {
                    return Err(duplicate(offset));
                }
                let text = core::str::from_utf8(payload).map_err(|_| {
                    ContainerError::MalformedBlock {
                        offset,
                        reason: "text block is not valid UTF-8",
                    }
                })?;
                *slot = Some(text.to_owned());
            }
            Tag::Image => {
                if self.family.is_none() {
                    return Err(self.missing(Tag::FamilyId));
                }
                if self.load_address.is_none() {
                    return Err(self.missing(Tag::LoadAddress));
                }
                self.payload = Some(payload.to_vec());
            }
            Tag::Checksum => {
                let declared = read_u32(payload, offset)?;
                let (Some(family), Some(load_address), Some(data)) =
                    (self.family, self.load_address, self.payload.take())
                else {
                    return Err(self.missing(Tag::Image));
                };

                let computed = crc32(&data);
                if declared != computed {
                    return Err(ContainerError::ChecksumMismatch {
                        image: self.index(),
                        declared,
                        computed,
                    });
                }

                let mut image = Image::new(family, load_address, data);
                if let Some(label) = self.label.take() {
                    image = image.with_label(label);
                }
                if let Some(version) = self.version.take() {
                    image = image.with_version(version);
                }
                self.family = None;
                self.load_address = None;
                self.images.push(image);
            }
        }

        Ok(())
    }

    fn finish(self) -> Result<Vec<Image>> {
        if self.payload.is_some() {
            return Err(self.missing(Tag::Checksum));
        }
        if self.has_pending_metadata() {
            return Err(self.missing(Tag::Image));
        }
        Ok(self.images)
    }
}

fn duplicate(offset: usize) -> ContainerError {
    ContainerError::MalformedBlock {
        offset,
        reason: "duplicate metadata block for one image",
    }
}

fn read_u32(payload: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| ContainerError::MalformedBlock {
            offset,
            reason: "expected a 4-byte payload",
        })?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Container {
        Container::new(vec![
            Image::new(0x7B3E_F230, 0x11000, vec![1, 2, 3, 4, 5]).with_label("app"),
            Image::new(0xE08F_7564, 0x8000, vec![0xFF]).with_version("v1.2"),
        ])
    }

    /// Build a raw container from (tag, payload) pairs with correct framing
    fn raw(blocks: &[(u16, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(blocks.len() as u32).to_le_bytes());
        for (tag, payload) in blocks {
            let offset = out.len() + FRAME_HEADER_LEN;
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(core::mem::size_of::<FileHeader>(), FILE_HEADER_LEN);
        assert_eq!(core::mem::size_of::<FrameHeader>(), FRAME_HEADER_LEN);
    }

    #[test]
    fn test_round_trip() {
        let container = sample();
        let bytes = container.encode().unwrap();
        assert_eq!(&bytes[..8], &MAGIC);
        assert_eq!(Container::decode(&bytes).unwrap(), container);
    }

    #[test]
    fn test_empty_container() {
        let bytes = Container::default().encode().unwrap();
        assert_eq!(bytes.len(), FILE_HEADER_LEN);
        assert!(Container::decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(
            Container::decode(b"NOTACONTAINER AT ALL"),
            Err(ContainerError::BadMagic)
        );
        assert_eq!(Container::decode(b"XY"), Err(ContainerError::BadMagic));
        assert_eq!(
            Container::decode(b"RCT"),
            Err(ContainerError::Truncated {
                offset: 0,
                needed: FILE_HEADER_LEN
            })
        );
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[8] = 2;
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().encode().unwrap();
        for cut in [10, FILE_HEADER_LEN + 4, bytes.len() - 1] {
            assert!(
                matches!(
                    Container::decode(&bytes[..cut]),
                    Err(ContainerError::Truncated { .. })
                ),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn test_unknown_tag() {
        let bytes = raw(&[(0x99, &[0])]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::UnknownTag {
                offset: FILE_HEADER_LEN,
                tag: 0x99
            })
        );
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut bytes = sample().encode().unwrap();
        // Payload of the first image: header, FAMILY_ID, LOAD_ADDRESS, LABEL("app"), IMAGE frame
        let payload_start = FILE_HEADER_LEN + 3 * FRAME_HEADER_LEN + 4 + 4 + 3 + FRAME_HEADER_LEN;
        assert_eq!(&bytes[payload_start..payload_start + 5], &[1, 2, 3, 4, 5]);
        bytes[payload_start + 2] ^= 0x01;
        assert!(matches!(
            Container::decode(&bytes),
            Err(ContainerError::ChecksumMismatch { image: 0, .. })
        ));
    }

    #[test]
    fn test_missing_blocks() {
        let family = 1u32.to_le_bytes();
        let addr = 0u32.to_le_bytes();
        let sum = crc32(&[9]).to_le_bytes();

        // IMAGE with no LOAD_ADDRESS
        let bytes = raw(&[(2, &family), (1, &[9]), (3, &sum)]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::MissingBlock {
                image: 0,
                tag: Tag::LoadAddress
            })
        );

        // IMAGE with no CHECKSUM
        let bytes = raw(&[(2, &family), (4, &addr), (1, &[9])]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::MissingBlock {
                image: 0,
                tag: Tag::Checksum
            })
        );

        // Metadata with no IMAGE
        let bytes = raw(&[(2, &family), (4, &addr)]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::MissingBlock {
                image: 0,
                tag: Tag::Image
            })
        );

        // CHECKSUM with nothing before it
        let bytes = raw(&[(3, &sum)]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::MissingBlock {
                image: 0,
                tag: Tag::Image
            })
        );
    }

    #[test]
    fn test_malformed_blocks() {
        let family = 1u32.to_le_bytes();

        // Wrong-width family id
        let bytes = raw(&[(2, &[1, 2])]);
        assert!(matches!(
            Container::decode(&bytes),
            Err(ContainerError::MalformedBlock { .. })
        ));

        // Invalid UTF-8 label
        let bytes = raw(&[(2, &family), (5, &[0xFF, 0xFE])]);
        assert!(matches!(
            Container::decode(&bytes),
            Err(ContainerError::MalformedBlock { .. })
        ));

        // Trailing bytes
        let mut bytes = Container::default().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            Container::decode(&bytes),
            Err(ContainerError::MalformedBlock { .. })
        ));

        // Payload offset that does not follow the frame header
        let mut bytes = raw(&[(2, &family)]);
        bytes[FILE_HEADER_LEN + 8] ^= 0x01;
        assert!(matches!(
            Container::decode(&bytes),
            Err(ContainerError::MalformedBlock { .. })
        ));
    }

    #[test]
    fn test_block_too_large() {
        let container = Container::new(vec![Image::new(1, 0, vec![0; 64])]);
        let options = CodecOptions { max_block_len: 32 };
        assert_eq!(
            container.encode_with(&options),
            Err(ContainerError::BlockTooLarge { len: 64, max: 32 })
        );

        let bytes = container.encode().unwrap();
        assert_eq!(
            Container::decode_with(&bytes, &options),
            Err(ContainerError::BlockTooLarge { len: 64, max: 32 })
        );
    }

    #[test]
    fn test_decode_rejects_overlap() {
        let sum = crc32(&[0, 0]).to_le_bytes();
        let family = 1u32.to_le_bytes();
        let bytes = raw(&[
            (2, &family),
            (4, &0u32.to_le_bytes()),
            (1, &[0, 0]),
            (3, &sum),
            (2, &family),
            (4, &1u32.to_le_bytes()),
            (1, &[0, 0]),
            (3, &sum),
        ]);
        assert_eq!(
            Container::decode(&bytes),
            Err(ContainerError::OverlappingImages {
                first: 0,
                second: 1
            })
        );
    }
}
