//! List commands implementation

use rchiptool_core::Registry;

use super::format_size;

/// List all known families
pub fn list_families(registry: &Registry) {
    println!("Known chip families:");
    println!();
    println!(
        "{:<10} {:<12} {:<14} {:>8} {:>8} {:>12}",
        "Code", "Name", "Protocol", "Flash", "Sector", "Bootloader"
    );
    println!("{}", "-".repeat(70));

    for family in registry.iter() {
        let geometry = &family.geometry;
        let bootloader = match geometry.bootloader {
            Some(region) => format_size(region.size as u64),
            None => "-".to_string(),
        };
        println!(
            "{:08X}   {:<12} {:<14} {:>8} {:>8} {:>12}",
            family.code,
            family.name,
            family.protocol.name(),
            format_size(geometry.total_size as u64),
            format_size(geometry.sector_size as u64),
            bootloader
        );
    }
}

/// List all transports compiled in
pub fn list_transports() {
    println!("Supported transports:");
    println!();
    for transport in rchiptool_flash::available_transports() {
        println!("  {:<8} - {}", transport.scheme, transport.description);
    }
}
