//! Container data model

use super::{ContainerError, Result, Tag};
use crate::checksum::crc32;
use crate::family::Registry;

/// Size of the 32-bit flash address space
pub const ADDRESS_SPACE_LIMIT: u64 = 1 << 32;

/// One tagged unit of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block kind
    pub tag: Tag,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl Block {
    fn u32(tag: Tag, value: u32) -> Self {
        Self {
            tag,
            payload: value.to_le_bytes().to_vec(),
        }
    }
}

/// A firmware payload destined for one flash offset of one family
///
/// The checksum is always derived from the payload, so an `Image` can never
/// carry a stale value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    family_code: u32,
    load_address: u32,
    payload: Vec<u8>,
    checksum: u32,
    label: Option<String>,
    version: Option<String>,
}

impl Image {
    /// Create an image
    pub fn new(family_code: u32, load_address: u32, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let checksum = crc32(&payload);
        Self {
            family_code,
            load_address,
            payload,
            checksum,
            label: None,
            version: None,
        }
    }

    /// Attach a partition label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Attach a firmware version string
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Target family code
    pub fn family_code(&self) -> u32 {
        self.family_code
    }

    /// Flash offset the payload is written to
    pub fn load_address(&self) -> u32 {
        self.load_address
    }

    /// Payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the image, returning its payload
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// CRC-32 of the payload
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Partition label, if any
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Firmware version, if any
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.load_address as u64 + self.payload.len() as u64
    }

    fn overlaps(&self, other: &Image) -> bool {
        self.family_code == other.family_code
            && !self.is_empty()
            && !other.is_empty()
            && (self.load_address as u64) < other.end()
            && (other.load_address as u64) < self.end()
    }

    fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        let label = self.label.as_ref().map(|l| Block {
            tag: Tag::Label,
            payload: l.as_bytes().to_vec(),
        });
        let version = self.version.as_ref().map(|v| Block {
            tag: Tag::Version,
            payload: v.as_bytes().to_vec(),
        });

        [
            Some(Block::u32(Tag::FamilyId, self.family_code)),
            Some(Block::u32(Tag::LoadAddress, self.load_address)),
            label,
            version,
            Some(Block {
                tag: Tag::Image,
                payload: self.payload.clone(),
            }),
            Some(Block::u32(Tag::Checksum, self.checksum)),
        ]
        .into_iter()
        .flatten()
    }
}

/// An ordered set of images
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    images: Vec<Image>,
}

impl Container {
    /// Create a container from images, in flashing order
    pub fn new(images: Vec<Image>) -> Self {
        Self { images }
    }

    /// Append an image
    pub fn push(&mut self, image: Image) {
        self.images.push(image);
    }

    /// Images in container order
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Consume the container, returning its images
    pub fn into_images(self) -> Vec<Image> {
        self.images
    }

    /// Number of images
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// True if the container holds no images
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Iterate over images targeting `family_code`, with their container index
    pub fn images_for_family(&self, family_code: u32) -> impl Iterator<Item = (usize, &Image)> {
        self.images
            .iter()
            .enumerate()
            .filter(move |(_, image)| image.family_code == family_code)
    }

    /// Flatten the container into its block sequence
    pub fn blocks(&self) -> Vec<Block> {
        self.images.iter().flat_map(Image::blocks).collect()
    }

    /// Check the invariants that hold without a registry
    ///
    /// Images must fit in the 32-bit address space and images of the same
    /// family must not overlap.
    pub fn check_layout(&self) -> Result<()> {
        for (i, image) in self.images.iter().enumerate() {
            if image.end() > ADDRESS_SPACE_LIMIT {
                return Err(ContainerError::AddressOutOfRange {
                    image: i,
                    end: image.end(),
                    limit: ADDRESS_SPACE_LIMIT,
                });
            }
        }

        for (i, first) in self.images.iter().enumerate() {
            for (j, second) in self.images.iter().enumerate().skip(i + 1) {
                if first.overlaps(second) {
                    return Err(ContainerError::OverlappingImages {
                        first: i,
                        second: j,
                    });
                }
            }
        }

        Ok(())
    }

    /// Check every image against its family
    ///
    /// On top of [`check_layout`](Self::check_layout), every family must be
    /// known and every image must end within its family's flash.
    pub fn validate(&self, registry: &Registry) -> Result<()> {
        self.check_layout()?;

        for (i, image) in self.images.iter().enumerate() {
            let family =
                registry
                    .lookup(image.family_code)
                    .ok_or(ContainerError::UnknownFamily {
                        image: i,
                        code: image.family_code,
                    })?;
            let limit = family.geometry.total_size as u64;
            if image.end() > limit {
                return Err(ContainerError::AddressOutOfRange {
                    image: i,
                    end: image.end(),
                    limit,
                });
            }
        }

        Ok(())
    }
}

impl FromIterator<Image> for Container {
    fn from_iter<I: IntoIterator<Item = Image>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
