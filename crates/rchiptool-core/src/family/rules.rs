//! Family identification rules
//!
//! Rules are matched against the start of a raw firmware binary. A rule
//! never matches if it would read past the end of the data.

use core::fmt;
use core::str::FromStr;

/// Byte order of a magic number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Endian {
    /// Least significant byte first
    #[default]
    Little,
    /// Most significant byte first
    Big,
}

/// Byte pattern with `??` wildcards, e.g. `"42 4B ?? 37"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern(Vec<Option<u8>>);

/// Error parsing a [`BytePattern`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternError(String);

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid byte pattern: {}", self.0)
    }
}

impl std::error::Error for PatternError {}

impl FromStr for BytePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = Vec::new();
        for token in s.split_whitespace() {
            if token == "??" {
                bytes.push(None);
                continue;
            }
            if token.len() != 2 {
                return Err(PatternError(format!("bad token '{}'", token)));
            }
            let value = u8::from_str_radix(token, 16)
                .map_err(|_| PatternError(format!("bad hex byte '{}'", token)))?;
            bytes.push(Some(value));
        }

        if bytes.is_empty() {
            return Err(PatternError("empty pattern".into()));
        }
        if bytes.iter().all(Option::is_none) {
            return Err(PatternError("pattern has no concrete bytes".into()));
        }

        Ok(Self(bytes))
    }
}

impl BytePattern {
    /// Number of positions (concrete and wildcard)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a parsed pattern
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of concrete (non-wildcard) bytes
    pub fn concrete_len(&self) -> usize {
        self.0.iter().filter(|b| b.is_some()).count()
    }

    fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.0.len()
            && self
                .0
                .iter()
                .zip(window)
                .all(|(expected, actual)| expected.map_or(true, |e| e == *actual))
    }
}

impl fmt::Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match b {
                Some(b) => write!(f, "{:02X}", b)?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// A single identification rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentRule {
    /// Exact bytes at a fixed offset
    Bytes {
        /// Offset into the binary
        offset: u32,
        /// Expected bytes
        bytes: Vec<u8>,
    },
    /// A 32-bit magic value at a fixed offset
    Magic {
        /// Offset into the binary
        offset: u32,
        /// Expected value
        value: u32,
        /// Byte order of the stored value
        endian: Endian,
    },
    /// Wildcard byte pattern at a fixed offset
    Pattern {
        /// Offset into the binary
        offset: u32,
        /// Pattern to match
        pattern: BytePattern,
    },
}

impl IdentRule {
    /// Offset this rule inspects
    pub fn offset(&self) -> u32 {
        match self {
            Self::Bytes { offset, .. } | Self::Magic { offset, .. } | Self::Pattern { offset, .. } => {
                *offset
            }
        }
    }

    /// Number of bytes this rule reads
    pub fn len(&self) -> usize {
        match self {
            Self::Bytes { bytes, .. } => bytes.len(),
            Self::Magic { .. } => 4,
            Self::Pattern { pattern, .. } => pattern.len(),
        }
    }

    /// True if the rule reads no bytes (never the case for a loaded rule)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of concrete bytes the rule pins; used as its match score
    pub fn specificity(&self) -> usize {
        match self {
            Self::Bytes { bytes, .. } => bytes.len(),
            Self::Magic { .. } => 4,
            Self::Pattern { pattern, .. } => pattern.concrete_len(),
        }
    }

    /// Check this rule against a binary
    pub fn matches(&self, data: &[u8]) -> bool {
        let start = self.offset() as usize;
        let Some(end) = start.checked_add(self.len()) else {
            return false;
        };
        let Some(window) = data.get(start..end) else {
            return false;
        };

        match self {
            Self::Bytes { bytes, .. } => window == bytes.as_slice(),
            Self::Magic { value, endian, .. } => {
                let raw = [window[0], window[1], window[2], window[3]];
                let found = match endian {
                    Endian::Little => u32::from_le_bytes(raw),
                    Endian::Big => u32::from_be_bytes(raw),
                };
                found == *value
            }
            Self::Pattern { pattern, .. } => pattern.matches(window),
        }
    }
}
