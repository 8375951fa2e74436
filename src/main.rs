//! rchiptool - Firmware packer and flasher for IoT chip families
//!
//! Identifies which chip family a raw firmware binary targets, bundles
//! binaries into multi-image containers and writes containers to a device's
//! bootloader over a serial port, a TCP serial bridge or an emulated device.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use rchiptool_flash::load_registry;

fn main() {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let registry = match load_registry(cli.family_db.as_deref()) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Failed to load family database: {}", e);
            std::process::exit(1);
        }
    };

    log::debug!("Loaded {} family definitions", registry.len());

    let result = match cli.command {
        Commands::Inspect { input } => commands::inspect::run(&registry, &input),
        Commands::Pack {
            output,
            images,
            labels,
            image_version,
        } => commands::pack::run(
            &registry,
            &images,
            &labels,
            image_version.as_deref(),
            &output,
        ),
        Commands::Unpack { input, output } => {
            commands::unpack::run(&registry, &input, output.as_deref())
        }
        Commands::Flash {
            transport,
            input,
            address,
            options,
        } => commands::flash::run(&registry, &transport, &input, address, &options),
        Commands::ListFamilies => {
            commands::list_families(&registry);
            Ok(commands::Status::Ok)
        }
        Commands::ListTransports => {
            commands::list_transports();
            Ok(commands::Status::Ok)
        }
    };

    match result {
        Ok(status) => std::process::exit(status.exit_code()),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
