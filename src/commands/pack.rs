//! Pack command implementation

use std::fs;
use std::path::Path;

use rchiptool_core::{Image, Registry};

use super::{read_file, Status};
use crate::cli::ImageArg;

/// Work out the family code of one image argument
fn resolve_family(
    registry: &Registry,
    arg: &ImageArg,
    data: &[u8],
) -> Result<u32, Box<dyn std::error::Error>> {
    if let Some(name) = &arg.family {
        return registry
            .resolve(name)
            .map(|f| f.code)
            .ok_or_else(|| format!("Unknown family: {}", name).into());
    }

    let result = rchiptool_core::inspect(registry, data);
    let detected = result.unique()?.cloned();
    match detected {
        Some(candidate) => {
            log::info!("{}: detected {}", arg.path.display(), candidate);
            Ok(candidate.code)
        }
        None => Err(format!(
            "Could not detect the family of {}; give it as FAMILY@ADDRESS=PATH",
            arg.path.display()
        )
        .into()),
    }
}

/// Run the pack command
pub fn run(
    registry: &Registry,
    args: &[ImageArg],
    labels: &[String],
    version: Option<&str>,
    output: &Path,
) -> Result<Status, Box<dyn std::error::Error>> {
    if labels.len() > args.len() {
        return Err(format!("{} labels given for {} images", labels.len(), args.len()).into());
    }

    let mut images = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let data = read_file(&arg.path)?;
        let code = resolve_family(registry, arg, &data)?;
        let mut image = Image::new(code, arg.address, data);
        if let Some(label) = labels.get(i).filter(|l| !l.is_empty()) {
            image = image.with_label(label.as_str());
        }
        if let Some(version) = version {
            image = image.with_version(version);
        }
        images.push(image);
    }

    let summary: Vec<(u32, u32, usize)> = images
        .iter()
        .map(|i| (i.family_code(), i.load_address(), i.len()))
        .collect();

    let bytes = rchiptool_core::pack(registry, images)?;
    fs::write(output, &bytes)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;

    for (i, (code, address, len)) in summary.into_iter().enumerate() {
        let name = registry.lookup(code).map_or("?", |f| f.name.as_str());
        println!("  [{}] {} @ 0x{:08X} ({} bytes)", i, name, address, len);
    }
    println!(
        "Wrote {} image(s), {} bytes to {}",
        args.len(),
        bytes.len(),
        output.display()
    );

    Ok(Status::Ok)
}
