//! Family database discovery
//!
//! The family database is loaded from, in order of preference: an explicit
//! path, `./families`, `/usr/share/rchiptool/families` and
//! `/usr/local/share/rchiptool/families`. When none of those exists the copy
//! compiled into the tool is used.

use std::path::{Path, PathBuf};

use rchiptool_core::family::Registry;

/// Default database locations, searched in order
pub fn default_family_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("families"),
        PathBuf::from("/usr/share/rchiptool/families"),
        PathBuf::from("/usr/local/share/rchiptool/families"),
    ]
}

/// Load the family registry
///
/// An explicit `path` may be a directory of `.ron` files or a single file and
/// must exist. Without one, the first default directory that loads cleanly
/// wins; a malformed default directory is skipped with a warning.
pub fn load_registry(path: Option<&Path>) -> Result<Registry, Box<dyn std::error::Error>> {
    load_registry_from(path, &default_family_dirs())
}

/// [`load_registry`] with an explicit list of fallback directories
pub fn load_registry_from(
    path: Option<&Path>,
    default_dirs: &[PathBuf],
) -> Result<Registry, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        let mut registry = Registry::new();
        // User specified a path
        if path.is_dir() {
            registry.load_dir(path)?;
        } else if path.is_file() {
            registry.load_file(path)?;
        } else {
            return Err(format!("Family database path not found: {}", path.display()).into());
        }
        if registry.is_empty() {
            return Err(format!("No families defined in {}", path.display()).into());
        }
        return Ok(registry);
    }

    for dir in default_dirs {
        if !dir.is_dir() {
            continue;
        }
        let mut registry = Registry::new();
        match registry.load_dir(dir) {
            Ok(count) if count > 0 => {
                log::debug!("Loaded {} families from {}", count, dir.display());
                return Ok(registry);
            }
            Ok(_) => log::debug!("No families in {}", dir.display()),
            Err(e) => log::warn!("Failed to load families from {}: {}", dir.display(), e),
        }
    }

    log::debug!("Using the built-in family database");
    Ok(Registry::builtin()?)
}
