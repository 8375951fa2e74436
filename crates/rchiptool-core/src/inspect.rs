//! Raw firmware image inspection
//!
//! Detection runs the registry's signature matching over a raw binary. When
//! exactly one family comes out on top its embedded header (if the family
//! declares one) is parsed and checked against the data. Problems found in
//! the header are reported as advisory issues and never abort detection.

use core::fmt;

use crate::family::{Family, HeaderLayout, Registry};

/// A family that matched the binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Family code
    pub code: u32,
    /// Family name
    pub name: String,
    /// Number of concrete bytes matched
    pub score: usize,
    /// Family detection priority
    pub priority: i32,
}

impl Candidate {
    fn from_family(family: &Family, score: usize) -> Self {
        Self {
            code: family.code,
            name: family.name.clone(),
            score,
            priority: family.priority,
        }
    }

    fn ranks_equal(&self, other: &Candidate) -> bool {
        self.priority == other.priority && self.score == other.score
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X}, score {})", self.name, self.code, self.score)
    }
}

/// Several families tie for the best match
///
/// Candidates are listed in registry declaration order. This is a reported
/// condition; callers that need a unique family can propagate it as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionAmbiguous {
    /// The tied candidates
    pub candidates: Vec<Candidate>,
}

impl fmt::Display for DetectionAmbiguous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ambiguous family detection: ")?;
        for (i, c) in self.candidates.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl std::error::Error for DetectionAmbiguous {}

/// Outcome of family detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// No family's rules matched
    Unknown,
    /// A single best family
    Detected(Candidate),
    /// Several families tie for the best match
    Ambiguous(DetectionAmbiguous),
}

/// A problem found in a binary's embedded metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataIssue {
    /// Declared image length differs from the actual data length
    LengthMismatch {
        /// Length stored in the header
        declared: u32,
        /// Length of the data
        actual: usize,
    },
    /// Declared checksum differs from the checksum of the data
    ChecksumMismatch {
        /// Checksum stored in the header
        declared: u32,
        /// Checksum computed over the covered range
        computed: u32,
    },
    /// A header field lies beyond the end of the data
    FieldOutOfBounds {
        /// Field name
        field: &'static str,
        /// Field offset
        offset: u32,
    },
    /// The image is larger than the family's flash
    ExceedsFlash {
        /// Image size
        size: usize,
        /// Flash size
        total: u32,
    },
}

impl fmt::Display for MetadataIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "declared length {} does not match actual length {}",
                declared, actual
            ),
            Self::ChecksumMismatch { declared, computed } => write!(
                f,
                "declared checksum 0x{:08X} does not match computed 0x{:08X}",
                declared, computed
            ),
            Self::FieldOutOfBounds { field, offset } => {
                write!(f, "{} field at 0x{:X} is past the end of the image", field, offset)
            }
            Self::ExceedsFlash { size, total } => write!(
                f,
                "image size {} exceeds flash size {}",
                size, total
            ),
        }
    }
}

/// Metadata extracted from a binary's embedded header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// Declared total image length
    pub declared_length: Option<u32>,
    /// Declared load address
    pub load_address: Option<u32>,
    /// Declared checksum
    pub declared_checksum: Option<u32>,
    /// Checksum computed over the covered range
    pub computed_checksum: Option<u32>,
    /// Advisory problems
    pub issues: Vec<MetadataIssue>,
}

impl ImageMetadata {
    /// True if no issues were found
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Result of inspecting a raw binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    /// Detection outcome
    pub detection: Detection,
    /// Every matching family, best first
    pub candidates: Vec<Candidate>,
    /// Embedded metadata of the detected family, if any
    pub metadata: Option<ImageMetadata>,
    /// Size of the binary
    pub size: usize,
}

impl DetectionResult {
    /// The uniquely detected family, if any
    pub fn family(&self) -> Option<&Candidate> {
        match &self.detection {
            Detection::Detected(c) => Some(c),
            _ => None,
        }
    }

    /// Require a unique family
    ///
    /// Returns `Ok(None)` for unknown binaries and the ambiguity as an error.
    pub fn unique(&self) -> Result<Option<&Candidate>, DetectionAmbiguous> {
        match &self.detection {
            Detection::Unknown => Ok(None),
            Detection::Detected(c) => Ok(Some(c)),
            Detection::Ambiguous(a) => Err(a.clone()),
        }
    }

    /// Advisory issues found in the metadata
    pub fn issues(&self) -> &[MetadataIssue] {
        self.metadata
            .as_ref()
            .map(|m| m.issues.as_slice())
            .unwrap_or_default()
    }
}

/// Inspect a raw firmware binary
pub fn inspect(registry: &Registry, data: &[u8]) -> DetectionResult {
    let matches = registry.match_signature(data);
    let candidates: Vec<Candidate> = matches
        .iter()
        .map(|m| Candidate::from_family(m.family, m.score))
        .collect();

    let detection = match candidates.as_slice() {
        [] => Detection::Unknown,
        [best, rest @ ..] => {
            // Candidates are sorted, so ties form a prefix in declaration order
            let tied: Vec<Candidate> = core::iter::once(best)
                .chain(rest.iter().take_while(|c| c.ranks_equal(best)))
                .cloned()
                .collect();
            if tied.len() > 1 {
                Detection::Ambiguous(DetectionAmbiguous { candidates: tied })
            } else {
                Detection::Detected(best.clone())
            }
        }
    };

    let metadata = match (&detection, matches.first()) {
        (Detection::Detected(_), Some(best)) => Some(extract_metadata(best.family, data)),
        _ => None,
    };

    match &detection {
        Detection::Unknown => log::debug!("inspect: no family matched {} bytes", data.len()),
        Detection::Detected(c) => log::debug!("inspect: detected {}", c),
        Detection::Ambiguous(a) => log::debug!("inspect: {}", a),
    }

    DetectionResult {
        detection,
        candidates,
        metadata,
        size: data.len(),
    }
}

fn read_field(
    data: &[u8],
    offset: u32,
    field: &'static str,
    issues: &mut Vec<MetadataIssue>,
) -> Option<u32> {
    let start = offset as usize;
    let value = start
        .checked_add(4)
        .and_then(|end| data.get(start..end))
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    if value.is_none() {
        issues.push(MetadataIssue::FieldOutOfBounds { field, offset });
    }
    value
}

/// Extract and check the embedded header of `family` in `data`
pub fn extract_metadata(family: &Family, data: &[u8]) -> ImageMetadata {
    let mut meta = ImageMetadata::default();

    if data.len() as u64 > family.geometry.total_size as u64 {
        meta.issues.push(MetadataIssue::ExceedsFlash {
            size: data.len(),
            total: family.geometry.total_size,
        });
    }

    let Some(layout) = family.header else {
        return meta;
    };
    let HeaderLayout {
        length_offset,
        load_address_offset,
        checksum,
    } = layout;

    if let Some(offset) = length_offset {
        meta.declared_length = read_field(data, offset, "length", &mut meta.issues);
        if let Some(declared) = meta.declared_length {
            if declared as usize != data.len() {
                meta.issues.push(MetadataIssue::LengthMismatch {
                    declared,
                    actual: data.len(),
                });
            }
        }
    }

    if let Some(offset) = load_address_offset {
        meta.load_address = read_field(data, offset, "load address", &mut meta.issues);
    }

    if let Some(field) = checksum {
        meta.declared_checksum = read_field(data, field.offset, "checksum", &mut meta.issues);

        // Cover up to the declared length when it is plausible, else the data end
        let end = meta
            .declared_length
            .map(|l| l as usize)
            .filter(|&l| l <= data.len())
            .unwrap_or(data.len());
        match data.get(field.start as usize..end) {
            Some(covered) => {
                let computed = field.algorithm.compute(covered);
                meta.computed_checksum = Some(computed);
                if let Some(declared) = meta.declared_checksum {
                    if declared != computed {
                        meta.issues
                            .push(MetadataIssue::ChecksumMismatch { declared, computed });
                    }
                }
            }
            None => meta.issues.push(MetadataIssue::FieldOutOfBounds {
                field: "checksum range",
                offset: field.start,
            }),
        }
    }

    meta
}
