//! Inspect command implementation

use std::path::Path;

use rchiptool_core::inspect::Detection;
use rchiptool_core::Registry;

use super::{read_file, Status};

/// Run the inspect command
pub fn run(registry: &Registry, input: &Path) -> Result<Status, Box<dyn std::error::Error>> {
    let data = read_file(input)?;
    let result = rchiptool_core::inspect(registry, &data);

    println!("File: {} ({} bytes)", input.display(), result.size);

    let status = match &result.detection {
        Detection::Unknown => {
            println!("Family: unknown (no identification rules matched)");
            Status::Incomplete
        }
        Detection::Detected(candidate) => {
            println!("Family: {}", candidate);
            if let Some(family) = registry.lookup(candidate.code) {
                println!("  {} ({})", family.description, family.protocol);
            }
            Status::Ok
        }
        Detection::Ambiguous(ambiguous) => {
            println!("Family: {}", ambiguous);
            Status::Incomplete
        }
    };

    if result.candidates.len() > 1 {
        println!("Candidates:");
        for candidate in &result.candidates {
            println!("  {}", candidate);
        }
    }

    if let Some(metadata) = &result.metadata {
        println!("Header:");
        if let Some(len) = metadata.declared_length {
            println!("  Declared length:  {}", len);
        }
        if let Some(addr) = metadata.load_address {
            println!("  Load address:     0x{:08X}", addr);
        }
        if let Some(sum) = metadata.declared_checksum {
            println!("  Declared checksum: 0x{:08X}", sum);
        }
        if let Some(sum) = metadata.computed_checksum {
            println!("  Computed checksum: 0x{:08X}", sum);
        }
    }

    for issue in result.issues() {
        log::warn!("{}", issue);
    }
    if !result.issues().is_empty() {
        println!("{} header issue(s) found", result.issues().len());
    }

    Ok(status)
}
