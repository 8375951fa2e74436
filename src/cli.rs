//! CLI argument parsing

use clap::{Parser, Subcommand};
use rchiptool_core::protocol::parse_number;
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    parse_number(s)
}

/// Generate dynamic help text for the transport argument
fn transport_help() -> String {
    format!(
        "Transport connection string [available: {}]",
        rchiptool_flash::transport_names_short()
    )
}

/// One image to pack: `[FAMILY@]ADDRESS=PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArg {
    /// Family name or code; detected from the binary when absent
    pub family: Option<String>,
    /// Load address
    pub address: u32,
    /// Raw binary
    pub path: PathBuf,
}

fn parse_image_arg(s: &str) -> Result<ImageArg, String> {
    let (target, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected [FAMILY@]ADDRESS=PATH, got '{}'", s))?;
    let (family, address) = match target.split_once('@') {
        Some((family, address)) => (Some(family.to_string()), address),
        None => (None, target),
    };
    if path.is_empty() {
        return Err(format!("missing path in '{}'", s));
    }
    Ok(ImageArg {
        family,
        address: parse_number(address)?,
        path: PathBuf::from(path),
    })
}

#[derive(Parser)]
#[command(name = "rchiptool")]
#[command(author, version, about = "Firmware packer and flasher for IoT chip families", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the family database (a .ron file or a directory of them)
    /// Defaults to ./families/, then /usr/share/rchiptool/families/, then the
    /// built-in database
    #[arg(long, global = true)]
    pub family_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flashing options; each flag overrides the --config file
#[derive(clap::Args, Debug, Clone, Default)]
pub struct FlashArgs {
    /// Options file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Skip device-side verification
    #[arg(long)]
    pub no_verify: bool,

    /// Total attempts per chunk
    #[arg(long)]
    pub retries: Option<u32>,

    /// Upper bound on the chunk size in bytes
    #[arg(long, value_parser = parse_hex_u32)]
    pub chunk_size: Option<u32>,

    /// Timeout of the first handshake attempt in milliseconds
    #[arg(long)]
    pub handshake_timeout: Option<u32>,

    /// Number of handshake attempts
    #[arg(long)]
    pub handshake_attempts: Option<u32>,

    /// Family to flash (name or code); defaults to the first image's family
    #[arg(long)]
    pub family: Option<String>,

    /// Allow images that overlap the bootloader region
    #[arg(long)]
    pub allow_bootloader_write: bool,

    /// Leave the device in the bootloader when done
    #[arg(long)]
    pub no_reset: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Detect the family of a raw firmware binary and check its header
    Inspect {
        /// Raw firmware binary
        input: PathBuf,
    },

    /// Bundle raw binaries into a container
    Pack {
        /// Output container path
        #[arg(short, long)]
        output: PathBuf,

        /// Image as [FAMILY@]ADDRESS=PATH, e.g. bk7231n@0x11000=app.bin
        #[arg(short, long = "image", required = true, value_parser = parse_image_arg)]
        images: Vec<ImageArg>,

        /// Partition label for every image, in order (comma-separated)
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Version string recorded with every image
        #[arg(long = "image-version")]
        image_version: Option<String>,
    },

    /// Extract the images of a container
    Unpack {
        /// Container file
        input: PathBuf,

        /// Directory to write the images to; only list them if absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a container (or a raw binary with --address) to a device
    Flash {
        /// Transport to use
        #[arg(short, long, help = transport_help())]
        transport: String,

        /// Container file, or a raw binary when --address is given
        input: PathBuf,

        /// Treat the input as a raw binary loaded at this address
        #[arg(long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        #[command(flatten)]
        options: FlashArgs,
    },

    /// List known chip families
    ListFamilies,

    /// List supported transports
    ListTransports,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_image_arg() {
        assert_eq!(
            parse_image_arg("bk7231n@0x11000=app.bin").unwrap(),
            ImageArg {
                family: Some("bk7231n".into()),
                address: 0x11000,
                path: PathBuf::from("app.bin"),
            }
        );
        let arg = parse_image_arg("4096=dir/a=b.bin").unwrap();
        assert_eq!(arg.family, None);
        assert_eq!(arg.address, 4096);
        assert_eq!(arg.path, PathBuf::from("dir/a=b.bin"));

        assert!(parse_image_arg("app.bin").is_err());
        assert!(parse_image_arg("0x100=").is_err());
        assert!(parse_image_arg("x@zz=a.bin").is_err());
    }

    #[test]
    fn test_flash_flags() {
        let cli = Cli::try_parse_from([
            "rchiptool",
            "flash",
            "-t",
            "mock:bk7231n",
            "fw.rct",
            "--no-verify",
            "--retries",
            "5",
            "--chunk-size",
            "0x100",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash {
                transport, options, ..
            } => {
                assert_eq!(transport, "mock:bk7231n");
                assert!(options.no_verify);
                assert_eq!(options.retries, Some(5));
                assert_eq!(options.chunk_size, Some(0x100));
            }
            _ => panic!("expected flash"),
        }
    }
}
