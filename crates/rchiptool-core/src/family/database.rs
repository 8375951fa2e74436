//! Family registry for runtime loading and lookup
//!
//! This module provides the [`Registry`] type, which holds chip family
//! definitions loaded from RON files. A registry is built once, then shared
//! read-only between inspectors and flashing sessions.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::rules::{BytePattern, Endian, IdentRule};
use super::types::{
    ChecksumAlgorithm, ChecksumField, Family, FlashGeometry, FlashRegion, HeaderLayout,
    ProtocolKind,
};

/// Family database shipped with the tool
const BUILTIN_DATABASE: &[(&str, &str)] = &[
    ("beken.ron", include_str!("../../../../families/beken.ron")),
    ("realtek.ron", include_str!("../../../../families/realtek.ron")),
    ("lightning.ron", include_str!("../../../../families/lightning.ron")),
];

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// I/O error reading a database file or directory
    #[error("failed to read {path}: {source}")]
    Io {
        /// File or directory being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// RON syntax or schema error
    #[error("parse error: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// Two families share a code
    #[error("duplicate family code 0x{code:08X} ({name})")]
    DuplicateFamily {
        /// Family code
        code: u32,
        /// Name of the second family declaring it
        name: String,
    },
    /// A family entry is inconsistent
    #[error("malformed family entry '{family}': {reason}")]
    MalformedEntry {
        /// Family name (or code if the name is empty)
        family: String,
        /// What is wrong
        reason: String,
    },
}

// ============================================================================
// RON deserialization types (intermediate format)
// ============================================================================

/// Size specification with human-readable units (for RON parsing)
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub enum Size {
    /// Size in bytes
    B(u32),
    /// Size in kibibytes (1024 bytes)
    KiB(u32),
    /// Size in mebibytes (1024 * 1024 bytes)
    MiB(u32),
}

impl Size {
    /// Convert to bytes, or `None` if the value does not fit in a u32
    pub fn to_bytes(self) -> Option<u32> {
        match self {
            Size::B(n) => Some(n),
            Size::KiB(n) => n.checked_mul(1024),
            Size::MiB(n) => n.checked_mul(1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct RegionDef {
    offset: u32,
    size: Size,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct GeometryDef {
    sector_size: Size,
    total_size: Size,
    #[serde(default)]
    bootloader: Option<RegionDef>,
}

#[derive(Debug, Clone, serde::Deserialize)]
enum RuleDef {
    Bytes {
        offset: u32,
        bytes: Vec<u8>,
    },
    Magic {
        offset: u32,
        value: u32,
        #[serde(default)]
        endian: Endian,
    },
    Pattern {
        offset: u32,
        pattern: String,
    },
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
struct ChecksumDef {
    offset: u32,
    algorithm: ChecksumAlgorithm,
    #[serde(default)]
    start: u32,
}

#[derive(Debug, Clone, Copy, Default, serde::Deserialize)]
#[serde(default)]
struct HeaderDef {
    length_offset: Option<u32>,
    load_address_offset: Option<u32>,
    checksum: Option<ChecksumDef>,
}

/// Single family definition in RON format
#[derive(Debug, Clone, serde::Deserialize)]
struct FamilyDef {
    code: u32,
    name: String,
    #[serde(default)]
    description: String,
    protocol: ProtocolKind,
    #[serde(default)]
    priority: i32,
    geometry: GeometryDef,
    rules: Vec<RuleDef>,
    #[serde(default)]
    header: Option<HeaderDef>,
}

/// Top-level RON document
#[derive(Debug, Clone, serde::Deserialize)]
struct FamilyFile {
    families: Vec<FamilyDef>,
}

impl FamilyDef {
    fn into_family(self) -> Result<Family, RegistryError> {
        let label = if self.name.is_empty() {
            format!("0x{:08X}", self.code)
        } else {
            self.name.clone()
        };
        let malformed = |reason: String| RegistryError::MalformedEntry {
            family: label.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(malformed("empty name".into()));
        }

        let sector_size = self
            .geometry
            .sector_size
            .to_bytes()
            .ok_or_else(|| malformed("sector size overflows".into()))?;
        let total_size = self
            .geometry
            .total_size
            .to_bytes()
            .ok_or_else(|| malformed("total size overflows".into()))?;

        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(malformed(format!(
                "sector size {} is not a power of two",
                sector_size
            )));
        }
        if total_size == 0 || total_size % sector_size != 0 {
            return Err(malformed(format!(
                "total size {} is not a non-zero multiple of the sector size",
                total_size
            )));
        }

        let bootloader = match self.geometry.bootloader {
            Some(region) => {
                let size = region
                    .size
                    .to_bytes()
                    .ok_or_else(|| malformed("bootloader size overflows".into()))?;
                let region = FlashRegion::new(region.offset, size);
                if region.end() > total_size as u64 {
                    return Err(malformed(format!(
                        "bootloader region 0x{:X}..0x{:X} exceeds flash size 0x{:X}",
                        region.offset,
                        region.end(),
                        total_size
                    )));
                }
                Some(region)
            }
            None => None,
        };

        if self.rules.is_empty() {
            return Err(malformed("no identification rules".into()));
        }
        let rules = self
            .rules
            .into_iter()
            .map(|rule| match rule {
                RuleDef::Bytes { offset, bytes } => {
                    if bytes.is_empty() {
                        Err(malformed(format!("empty byte rule at 0x{:X}", offset)))
                    } else {
                        Ok(IdentRule::Bytes { offset, bytes })
                    }
                }
                RuleDef::Magic {
                    offset,
                    value,
                    endian,
                } => Ok(IdentRule::Magic {
                    offset,
                    value,
                    endian,
                }),
                RuleDef::Pattern { offset, pattern } => pattern
                    .parse::<BytePattern>()
                    .map(|pattern| IdentRule::Pattern { offset, pattern })
                    .map_err(|e| malformed(e.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let header = match self.header {
            Some(def) => Some(validate_header(def).map_err(malformed)?),
            None => None,
        };

        Ok(Family {
            code: self.code,
            name: self.name,
            description: self.description,
            protocol: self.protocol,
            priority: self.priority,
            geometry: FlashGeometry {
                sector_size,
                total_size,
                bootloader,
            },
            rules,
            header,
        })
    }
}

fn validate_header(def: HeaderDef) -> Result<HeaderLayout, String> {
    let field_ok = |offset: u32| offset.checked_add(4).is_some();
    for (name, offset) in [
        ("length", def.length_offset),
        ("load address", def.load_address_offset),
        ("checksum", def.checksum.map(|c| c.offset)),
    ] {
        if let Some(offset) = offset {
            if !field_ok(offset) {
                return Err(format!("{} field offset 0x{:X} overflows", name, offset));
            }
        }
    }

    let checksum = def.checksum.map(|c| ChecksumField {
        offset: c.offset,
        algorithm: c.algorithm,
        start: c.start,
    });
    if let Some(field) = checksum {
        // The covered range runs from `start` to the end of the image, so the
        // stored value must sit before it.
        if field.offset as u64 + 4 > field.start as u64 {
            return Err(format!(
                "checksum field at 0x{:X} lies inside its covered range starting at 0x{:X}",
                field.offset, field.start
            ));
        }
    }

    Ok(HeaderLayout {
        length_offset: def.length_offset,
        load_address_offset: def.load_address_offset,
        checksum,
    })
}

// ============================================================================
// Registry
// ============================================================================

/// One family that matched a binary's identification rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureMatch<'a> {
    /// Matched family
    pub family: &'a Family,
    /// Number of concrete bytes the family's rules pinned
    pub score: usize,
}

/// Runtime family registry
///
/// Families keep their declaration order; lookups by code go through a
/// hash index.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    families: Vec<Family>,
    index: HashMap<u32, usize>,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the database compiled into the tool
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (name, content) in BUILTIN_DATABASE {
            let count = registry.load_ron(content)?;
            log::trace!("registry: loaded {} families from builtin {}", count, name);
        }
        Ok(registry)
    }

    /// Build a registry from a single RON document
    pub fn from_ron_str(content: &str) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        registry.load_ron(content)?;
        Ok(registry)
    }

    /// Load family definitions from a RON string
    ///
    /// Either every family in the document is added or none is.
    pub fn load_ron(&mut self, content: &str) -> Result<usize, RegistryError> {
        let file: FamilyFile = ron::from_str(content)?;

        let mut pending: Vec<Family> = Vec::with_capacity(file.families.len());
        for def in file.families {
            let family = def.into_family()?;
            if self.index.contains_key(&family.code)
                || pending.iter().any(|f| f.code == family.code)
            {
                return Err(RegistryError::DuplicateFamily {
                    code: family.code,
                    name: family.name,
                });
            }
            pending.push(family);
        }

        let count = pending.len();
        for family in pending {
            self.index.insert(family.code, self.families.len());
            self.families.push(family);
        }
        Ok(count)
    }

    /// Load family definitions from a single RON file
    pub fn load_file(&mut self, path: &Path) -> Result<usize, RegistryError> {
        let content = fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let count = self.load_ron(&content)?;
        log::debug!("registry: loaded {} families from {}", count, path.display());
        Ok(count)
    }

    /// Load all RON files from a directory
    ///
    /// Files are loaded in file-name order so declaration order, and with it
    /// detection tie-breaking, does not depend on directory iteration order.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, RegistryError> {
        let io_err = |source: io::Error| RegistryError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|ext| ext == "ron") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut total = 0;
        for path in paths {
            total += self.load_file(&path)?;
        }
        Ok(total)
    }

    /// Get all families in declaration order
    pub fn families(&self) -> &[Family] {
        &self.families
    }

    /// Get the number of families in the registry
    pub fn len(&self) -> usize {
        self.families.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Look up a family by code
    pub fn lookup(&self, code: u32) -> Option<&Family> {
        self.index.get(&code).map(|&i| &self.families[i])
    }

    /// Find a family by exact name (case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Option<&Family> {
        self.families
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Resolve a family given either its name or its code
    ///
    /// Codes may be written in hex with a `0x` prefix or in decimal.
    pub fn resolve(&self, name_or_code: &str) -> Option<&Family> {
        if let Some(family) = self.find_by_name(name_or_code) {
            return Some(family);
        }
        let code = match name_or_code
            .strip_prefix("0x")
            .or_else(|| name_or_code.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => name_or_code.parse().ok(),
        }?;
        self.lookup(code)
    }

    /// Match a binary against every family's identification rules
    ///
    /// Returns every fully matching family, ordered by priority (highest
    /// first), then score (highest first), then declaration order. The
    /// result is deterministic for a given registry and input.
    pub fn match_signature(&self, data: &[u8]) -> Vec<SignatureMatch<'_>> {
        let mut matches: Vec<(usize, SignatureMatch<'_>)> = self
            .families
            .iter()
            .enumerate()
            .filter_map(|(i, family)| {
                family
                    .match_score(data)
                    .map(|score| (i, SignatureMatch { family, score }))
            })
            .collect();

        matches.sort_by(|(ia, a), (ib, b)| {
            b.family
                .priority
                .cmp(&a.family.priority)
                .then(b.score.cmp(&a.score))
                .then(ia.cmp(ib))
        });

        matches.into_iter().map(|(_, m)| m).collect()
    }

    /// Iterate over all families
    pub fn iter(&self) -> impl Iterator<Item = &Family> {
        self.families.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FAMILIES: &str = r#"
    (
        families: [
            (
                code: 0x11111111,
                name: "alpha",
                description: "Alpha test family",
                protocol: StopAndWait,
                geometry: (
                    sector_size: KiB(4),
                    total_size: MiB(2),
                    bootloader: Some((offset: 0x0, size: KiB(64))),
                ),
                rules: [
                    Bytes(offset: 0x0, bytes: [0xAA, 0xBB]),
                ],
            ),
            (
                code: 0x22222222,
                name: "beta",
                protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: MiB(4)),
                rules: [
                    Magic(offset: 0x0, value: 0x0000BBAA),
                ],
                header: Some((
                    length_offset: Some(0x8),
                    checksum: Some((offset: 0xC, algorithm: Crc32, start: 0x10)),
                )),
            ),
        ],
    )
    "#;

    #[test]
    fn test_load_ron() {
        let registry = Registry::from_ron_str(TWO_FAMILIES).unwrap();
        assert_eq!(registry.len(), 2);

        let alpha = registry.lookup(0x1111_1111).unwrap();
        assert_eq!(alpha.name, "alpha");
        assert_eq!(alpha.protocol, ProtocolKind::StopAndWait);
        assert_eq!(alpha.geometry.total_size, 2 * 1024 * 1024);
        assert_eq!(
            alpha.geometry.bootloader,
            Some(FlashRegion::new(0, 64 * 1024))
        );
        assert!(alpha.header.is_none());

        let beta = registry.lookup(0x2222_2222).unwrap();
        assert_eq!(beta.description, "");
        let header = beta.header.unwrap();
        assert_eq!(header.length_offset, Some(8));
        assert_eq!(header.load_address_offset, None);
        assert_eq!(header.checksum.unwrap().algorithm, ChecksumAlgorithm::Crc32);

        assert!(registry.lookup(0x3333_3333).is_none());
    }

    #[test]
    fn test_resolve() {
        let registry = Registry::from_ron_str(TWO_FAMILIES).unwrap();
        assert_eq!(registry.resolve("ALPHA").unwrap().code, 0x1111_1111);
        assert_eq!(registry.resolve("0x22222222").unwrap().name, "beta");
        assert_eq!(registry.resolve("286331153").unwrap().name, "alpha");
        assert!(registry.resolve("gamma").is_none());
    }

    #[test]
    fn test_duplicate_family() {
        let mut registry = Registry::from_ron_str(TWO_FAMILIES).unwrap();
        let err = registry.load_ron(TWO_FAMILIES).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::DuplicateFamily { code: 0x1111_1111, .. }
        ));
        // Nothing from the rejected document was added
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_malformed_entries() {
        let cases = [
            // Sector size not a power of two
            r#"(families: [(code: 1, name: "x", protocol: StopAndWait,
                geometry: (sector_size: B(3000), total_size: B(6000)),
                rules: [Bytes(offset: 0, bytes: [1])])])"#,
            // Bootloader outside flash
            r#"(families: [(code: 1, name: "x", protocol: StopAndWait,
                geometry: (sector_size: KiB(4), total_size: KiB(8),
                           bootloader: Some((offset: 0x1000, size: KiB(8)))),
                rules: [Bytes(offset: 0, bytes: [1])])])"#,
            // Wildcard-only pattern
            r#"(families: [(code: 1, name: "x", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [Pattern(offset: 0, pattern: "?? ??")])])"#,
            // No rules
            r#"(families: [(code: 1, name: "x", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [])])"#,
            // Checksum field inside its own range
            r#"(families: [(code: 1, name: "x", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [Bytes(offset: 0, bytes: [1])],
                header: Some((checksum: Some((offset: 0x10, algorithm: Sum32, start: 0x0)))))])"#,
            // Empty name
            r#"(families: [(code: 1, name: "", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [Bytes(offset: 0, bytes: [1])])])"#,
        ];

        for case in cases {
            let err = Registry::from_ron_str(case).unwrap_err();
            assert!(
                matches!(err, RegistryError::MalformedEntry { .. }),
                "expected MalformedEntry for {}, got {:?}",
                case,
                err
            );
        }
    }

    #[test]
    fn test_parse_error() {
        let err = Registry::from_ron_str("(families: [(code: ").unwrap_err();
        assert!(matches!(err, RegistryError::Parse(_)));
    }

    #[test]
    fn test_match_signature_order() {
        let registry = Registry::from_ron_str(TWO_FAMILIES).unwrap();

        // Both match with score 2 and 4; beta pins more bytes
        let data = [0xAA, 0xBB, 0x00, 0x00, 0x00];
        let matches = registry.match_signature(&data);
        let names: Vec<_> = matches.iter().map(|m| m.family.name.as_str()).collect();
        assert_eq!(names, ["beta", "alpha"]);
        assert_eq!(matches[0].score, 4);
        assert_eq!(matches[1].score, 2);

        // Only alpha matches
        let matches = registry.match_signature(&[0xAA, 0xBB, 0x01, 0x00]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].family.name, "alpha");

        assert!(registry.match_signature(&[]).is_empty());
    }

    #[test]
    fn test_priority_beats_score() {
        let ron = r#"(families: [
            (code: 1, name: "specific", protocol: ChunkedCrc,
             geometry: (sector_size: KiB(4), total_size: KiB(8)),
             rules: [Bytes(offset: 0, bytes: [1, 2, 3, 4])]),
            (code: 2, name: "preferred", protocol: ChunkedCrc, priority: 10,
             geometry: (sector_size: KiB(4), total_size: KiB(8)),
             rules: [Bytes(offset: 0, bytes: [1])]),
        ])"#;
        let registry = Registry::from_ron_str(ron).unwrap();
        let matches = registry.match_signature(&[1, 2, 3, 4]);
        assert_eq!(matches[0].family.name, "preferred");
        assert_eq!(matches[1].family.name, "specific");
    }

    #[test]
    fn test_builtin() {
        let registry = Registry::builtin().unwrap();
        assert!(!registry.is_empty());
        assert!(registry.find_by_name("bk7231n").is_some());
        assert!(registry.find_by_name("rtl8710b").is_some());
    }

    #[test]
    fn test_load_dir_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("b.ron"),
            r#"(families: [(code: 2, name: "second", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [Bytes(offset: 0, bytes: [1])])])"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("a.ron"),
            r#"(families: [(code: 1, name: "first", protocol: ChunkedCrc,
                geometry: (sector_size: KiB(4), total_size: KiB(8)),
                rules: [Bytes(offset: 0, bytes: [1])])])"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = Registry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 2);
        let names: Vec<_> = registry.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);

        let err = registry
            .load_dir(&dir.path().join("missing"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Io { .. }));
    }

    #[test]
    fn test_size_conversion() {
        assert_eq!(Size::B(256).to_bytes(), Some(256));
        assert_eq!(Size::KiB(4).to_bytes(), Some(4096));
        assert_eq!(Size::MiB(16).to_bytes(), Some(16 * 1024 * 1024));
        assert_eq!(Size::MiB(4096).to_bytes(), None);
    }
}
