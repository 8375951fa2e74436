//! Unpack command implementation

use std::fs;
use std::path::{Path, PathBuf};

use rchiptool_core::{Image, Registry};

use super::{read_file, Status};

/// File name an extracted image is written to
fn image_file_name(registry: &Registry, index: usize, image: &Image) -> PathBuf {
    let family = registry
        .lookup(image.family_code())
        .map(|f| f.name.clone())
        .unwrap_or_else(|| format!("{:08x}", image.family_code()));
    let label: String = image
        .label()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();

    let mut name = format!("{:02}_{}_{:08x}", index, family, image.load_address());
    if !label.is_empty() {
        name.push('_');
        name.push_str(&label);
    }
    name.push_str(".bin");
    PathBuf::from(name)
}

/// Run the unpack command
pub fn run(
    registry: &Registry,
    input: &Path,
    output: Option<&Path>,
) -> Result<Status, Box<dyn std::error::Error>> {
    let data = read_file(input)?;
    let images = rchiptool_core::unpack(&data)?;

    println!("{}: {} image(s)", input.display(), images.len());
    for (i, image) in images.iter().enumerate() {
        let family = registry
            .lookup(image.family_code())
            .map_or_else(|| format!("0x{:08X}", image.family_code()), |f| f.name.clone());
        print!(
            "  [{}] {} @ 0x{:08X}, {} bytes, crc32 0x{:08X}",
            i,
            family,
            image.load_address(),
            image.len(),
            image.checksum()
        );
        if let Some(label) = image.label() {
            print!(", label {}", label);
        }
        if let Some(version) = image.version() {
            print!(", version {}", version);
        }
        println!();
    }

    let Some(dir) = output else {
        return Ok(Status::Ok);
    };

    fs::create_dir_all(dir)?;
    for (i, image) in images.iter().enumerate() {
        let path = dir.join(image_file_name(registry, i, image));
        fs::write(&path, image.payload())
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        log::info!("Wrote {}", path.display());
    }

    Ok(Status::Ok)
}
