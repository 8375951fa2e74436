//! Flashing options
//!
//! Options can be loaded from a TOML file:
//!
//! ```toml
//! verify = true
//! max_retries = 5
//! handshake_timeout_ms = 500
//! chunk_size_override = 1024
//! target_family = "0x7B3EF230"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error loading options
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    /// Could not read the options file
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Invalid TOML or unknown field
    #[error("invalid options: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Flashing session configuration
///
/// Every timeout and retry bound the engine uses comes from here.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashOptions {
    /// Upper bound on the chunk size, below the variant and transport limits
    pub chunk_size_override: Option<u32>,
    /// Ask the device to verify each image after writing
    pub verify: bool,
    /// Total attempts per chunk (values below 1 are treated as 1)
    pub max_retries: u32,
    /// Timeout of the first handshake attempt
    pub handshake_timeout_ms: u32,
    /// Number of handshake attempts
    pub handshake_attempts: u32,
    /// Cap on the doubling handshake timeout
    pub max_handshake_timeout_ms: u32,
    /// How long to wait for each acknowledgement
    pub ack_timeout_ms: u32,
    /// How long the transport may take to accept a write
    pub write_timeout_ms: u32,
    /// Family to flash; defaults to the family of the first image
    #[serde(deserialize_with = "deserialize_opt_hex_u32")]
    pub target_family: Option<u32>,
    /// Allow images that overlap the bootloader region
    pub allow_bootloader_write: bool,
    /// Reset the device once flashing succeeded
    pub reset_after: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            chunk_size_override: None,
            verify: true,
            max_retries: 3,
            handshake_timeout_ms: 300,
            handshake_attempts: 3,
            max_handshake_timeout_ms: 2000,
            ack_timeout_ms: 1000,
            write_timeout_ms: 1000,
            target_family: None,
            allow_bootloader_write: false,
            reset_after: true,
        }
    }
}

impl FlashOptions {
    /// Parse options from a TOML string; missing fields keep their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, OptionsError> {
        Ok(toml::from_str(content)?)
    }

    /// Load options from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Total attempts allowed per chunk
    pub fn attempts_per_chunk(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms as u64)
    }

    /// Transport write timeout
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms as u64)
    }

    /// Timeout for every handshake attempt: doubling from
    /// `handshake_timeout_ms`, capped at `max_handshake_timeout_ms`
    pub fn handshake_schedule(&self) -> Vec<Duration> {
        let cap = self.max_handshake_timeout_ms.max(self.handshake_timeout_ms);
        let mut timeout = self.handshake_timeout_ms;
        (0..self.handshake_attempts.max(1))
            .map(|_| {
                let current = timeout;
                timeout = timeout.saturating_mul(2).min(cap);
                Duration::from_millis(current as u64)
            })
            .collect()
    }
}

/// Deserialize an optional u32 that can be an integer or a hex/decimal string
fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HexOrInt {
        Int(u32),
        Str(String),
    }

    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(Some(n)),
        HexOrInt::Str(s) => parse_number(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid number: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = FlashOptions::default();
        assert!(options.verify);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.handshake_timeout_ms, 300);
        assert_eq!(options.chunk_size_override, None);
        assert_eq!(FlashOptions::from_toml_str("").unwrap(), options);
    }

    #[test]
    fn test_from_toml() {
        let options = FlashOptions::from_toml_str(
            r#"
            verify = false
            max_retries = 5
            chunk_size_override = 256
            target_family = "0x7B3EF230"
            "#,
        )
        .unwrap();
        assert!(!options.verify);
        assert_eq!(options.max_retries, 5);
        assert_eq!(options.chunk_size_override, Some(256));
        assert_eq!(options.target_family, Some(0x7B3E_F230));
        assert_eq!(options.ack_timeout_ms, 1000);

        let options = FlashOptions::from_toml_str("target_family = 42").unwrap();
        assert_eq!(options.target_family, Some(42));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            FlashOptions::from_toml_str("retries = 2"),
            Err(OptionsError::Parse(_))
        ));
    }

    #[test]
    fn test_handshake_schedule_doubles_and_caps() {
        let options = FlashOptions {
            handshake_timeout_ms: 300,
            handshake_attempts: 5,
            max_handshake_timeout_ms: 2000,
            ..Default::default()
        };
        let schedule: Vec<u64> = options
            .handshake_schedule()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(schedule, [300, 600, 1200, 2000, 2000]);
    }

    #[test]
    fn test_attempts_floor() {
        let options = FlashOptions {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(options.attempts_per_chunk(), 1);
    }
}
