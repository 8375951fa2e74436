//! CLI command implementations
//!
//! Each command returns a [`Status`] that `main` turns into the process exit
//! code. Hard errors (unreadable files, malformed containers) are returned as
//! `Err` and exit with 1.

pub mod flash;
pub mod inspect;
mod list;
pub mod pack;
pub mod unpack;

pub use list::{list_families, list_transports};

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// How a command ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Everything requested was done
    Ok,
    /// Done, but with a result the caller must look at (partial flash,
    /// undetected or ambiguous family)
    Incomplete,
    /// The operation failed without a usable result
    Failed,
}

impl Status {
    /// Process exit code
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::Incomplete => 2,
            Status::Failed => 3,
        }
    }
}

/// Read file contents into a Vec
fn read_file(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut file =
        File::open(path).map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    log::debug!("Read {} bytes from {}", data.len(), path.display());
    Ok(data)
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(2 * 1024 * 1024), "2 MiB");
        assert_eq!(format_size(68 * 1024), "68 KiB");
        assert_eq!(format_size(1500), "1500 B");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(Status::Ok.exit_code(), 0);
        assert_ne!(Status::Incomplete.exit_code(), Status::Failed.exit_code());
        assert_ne!(Status::Failed.exit_code(), 1);
    }
}
