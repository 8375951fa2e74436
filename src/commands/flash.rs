//! Flash command implementation

use std::path::Path;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rchiptool_core::protocol::{FlashProgress, FlashReport, RejectReason};
use rchiptool_core::{CancelToken, Container, Family, FlashOptions, FlashOutcome, Image, Registry};

use super::{read_file, Status};
use crate::cli::FlashArgs;

// =============================================================================
// Progress reporting
// =============================================================================

/// Create a progress bar with custom phase message
fn create_progress_bar_with_phase(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Create a standard spinner style
fn create_spinner_style() -> Result<ProgressStyle, Box<dyn std::error::Error>> {
    Ok(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?)
}

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
    retries: u32,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
            retries: 0,
        }
    }

    fn create_bar(&mut self, total: u64, phase: &str) {
        let pb = self.multi.add(
            create_progress_bar_with_phase(total, phase)
                .unwrap_or_else(|_| ProgressBar::new(total)),
        );
        self.current_bar = Some(pb);
    }

    fn create_spinner(&mut self, message: String) {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(create_spinner_style().unwrap_or_else(|_| ProgressStyle::default_spinner()));
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(100));
        self.current_bar = Some(pb);
    }

    fn finish(&mut self, message: &str) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(message.to_string());
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashProgress for IndicatifProgress {
    fn handshaking(&mut self, attempt: u32, timeout: Duration) {
        if let Some(pb) = &self.current_bar {
            pb.set_message(format!(
                "Waiting for the bootloader (attempt {}, {} ms)...",
                attempt,
                timeout.as_millis()
            ));
        } else {
            self.create_spinner(format!(
                "Waiting for the bootloader (attempt {}, {} ms)...",
                attempt,
                timeout.as_millis()
            ));
        }
    }

    fn connected(&mut self, family: &Family, chunk_size: usize) {
        self.finish("Connected");
        let _ = self.multi.println(format!(
            "Connected to {} bootloader, {} byte chunks",
            family.name, chunk_size
        ));
    }

    fn image_started(&mut self, image: usize, address: u32, len: usize) {
        self.create_bar(len as u64, &format!("image {} @ 0x{:08X}", image, address));
    }

    fn chunk_written(&mut self, _image: usize, bytes_done: usize, _bytes_total: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(bytes_done as u64);
        }
    }

    fn chunk_retry(&mut self, image: usize, chunk: usize, attempt: u32, reason: RejectReason) {
        self.retries += 1;
        log::debug!(
            "image {} chunk {}: retry {} ({})",
            image,
            chunk,
            attempt,
            reason
        );
    }

    fn image_finished(&mut self, image: usize) {
        self.finish(&format!("image {} written", image));
    }

    fn verifying(&mut self, image: usize) {
        self.finish("");
        self.create_spinner(format!("Verifying image {}...", image));
    }

    fn finished(&mut self, success: bool) {
        match self.current_bar.take() {
            Some(pb) if success => pb.finish_and_clear(),
            Some(pb) => pb.abandon(),
            None => {}
        }
        if self.retries > 0 {
            log::info!("{} chunk retries", self.retries);
        }
    }
}

// =============================================================================
// Command
// =============================================================================

/// Build the session options from the config file and flags
fn build_options(
    registry: &Registry,
    args: &FlashArgs,
) -> Result<FlashOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => FlashOptions::from_toml_file(path)?,
        None => FlashOptions::default(),
    };

    if args.no_verify {
        options.verify = false;
    }
    if let Some(retries) = args.retries {
        options.max_retries = retries;
    }
    if let Some(size) = args.chunk_size {
        options.chunk_size_override = Some(size);
    }
    if let Some(timeout) = args.handshake_timeout {
        options.handshake_timeout_ms = timeout;
    }
    if let Some(attempts) = args.handshake_attempts {
        options.handshake_attempts = attempts;
    }
    if let Some(name) = &args.family {
        let family = registry
            .resolve(name)
            .ok_or_else(|| format!("Unknown family: {}", name))?;
        options.target_family = Some(family.code);
    }
    if args.allow_bootloader_write {
        options.allow_bootloader_write = true;
    }
    if args.no_reset {
        options.reset_after = false;
    }

    Ok(options)
}

/// Wrap a raw binary in a single-image container
fn raw_container(
    registry: &Registry,
    data: Vec<u8>,
    address: u32,
    family_hint: Option<u32>,
) -> Result<Container, Box<dyn std::error::Error>> {
    let code = match family_hint {
        Some(code) => code,
        None => {
            let result = rchiptool_core::inspect(registry, &data);
            let detected = result.unique()?.map(|c| c.code);
            detected.ok_or("Could not detect the family of the binary; use --family")?
        }
    };
    Ok(Container::new(vec![Image::new(code, address, data)]))
}

fn print_report(registry: &Registry, report: &FlashReport) {
    let name = registry
        .lookup(report.family)
        .map_or("?", |f| f.name.as_str());
    for image in &report.images {
        println!(
            "  [{}] 0x{:08X}: {} bytes in {} chunks, {} retries, {}",
            image.index,
            image.address,
            image.bytes_sent,
            image.chunks,
            image.retries,
            image.verification
        );
    }
    if !report.skipped.is_empty() {
        println!("  Skipped (other families): {:?}", report.skipped);
    }
    println!(
        "Flashed {} image(s) to {} ({} bytes, {} byte chunks) in {:.1}s",
        report.images.len(),
        name,
        report.bytes_sent(),
        report.chunk_size,
        report.elapsed.as_secs_f64()
    );
    if !report.fully_verified() {
        println!("Note: not every image could be verified by the device");
    }
}

/// Run the flash command
///
/// Ctrl-C cancels the session: it stops before the next chunk and resets
/// the device, and the command exits as incomplete.
pub fn run(
    registry: &Registry,
    transport: &str,
    input: &Path,
    address: Option<u32>,
    args: &FlashArgs,
) -> Result<Status, Box<dyn std::error::Error>> {
    let data = read_file(input)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::warn!("Interrupted, stopping after the current chunk");
            cancel.cancel();
        })
        .map_err(|e| format!("Failed to install Ctrl-C handler: {}", e))?;
    }

    flash_data(registry, transport, data, address, args, &cancel)
}

fn flash_data(
    registry: &Registry,
    transport: &str,
    data: Vec<u8>,
    address: Option<u32>,
    args: &FlashArgs,
    cancel: &CancelToken,
) -> Result<Status, Box<dyn std::error::Error>> {
    let mut options = build_options(registry, args)?;
    let handle = rchiptool_flash::open_transport(transport, registry)?;

    let container = match address {
        Some(address) => {
            let hint = options.target_family.or(handle.family_hint());
            raw_container(registry, data, address, hint)?
        }
        None => Container::decode(&data)?,
    };
    if options.target_family.is_none() {
        options.target_family = handle.family_hint();
    }

    let mut progress = IndicatifProgress::new();
    let outcome = handle.flash(registry, &container, &options, cancel, &mut progress);

    if let Err(e) = handle.close() {
        log::warn!("Failed to close transport: {}", e);
    }

    match outcome {
        FlashOutcome::Success(report) => {
            print_report(registry, &report);
            Ok(Status::Ok)
        }
        FlashOutcome::PartialFailure {
            completed_images,
            failure,
        } => {
            eprintln!("Flashing incomplete: {}", failure);
            eprintln!("Completed images: {:?}", completed_images);
            Ok(Status::Incomplete)
        }
        FlashOutcome::Fatal(failure) => {
            eprintln!("Flashing failed: {}", failure);
            Ok(Status::Failed)
        }
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;

    fn beken_binary() -> Vec<u8> {
        (0..64u8).collect()
    }

    #[test]
    fn test_flash_raw_binary() {
        let registry = Registry::builtin().unwrap();
        let status = flash_data(
            &registry,
            "mock:bk7231n",
            beken_binary(),
            Some(0x11000),
            &FlashArgs::default(),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(status, Status::Ok);
    }

    #[test]
    fn test_interrupted_flash_is_incomplete() {
        let registry = Registry::builtin().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let status = flash_data(
            &registry,
            "mock:bk7231n",
            beken_binary(),
            Some(0x11000),
            &FlashArgs::default(),
            &cancel,
        )
        .unwrap();
        assert_eq!(status, Status::Incomplete);
    }
}
