//! rchiptool-mock - In-memory bootloader emulator for testing
//!
//! [`MockDevice`] implements [`Transport`] by playing the device side of
//! either bootloader protocol against an in-memory flash array. Replies are
//! queued as soon as a request is written, so reads never wait: an empty
//! queue reads as an immediate timeout. A [`FaultPlan`] injects the failures
//! a noisy serial line produces.

mod chunked_crc;
mod stop_and_wait;

use std::collections::VecDeque;
use std::time::Duration;

use rchiptool_core::family::{Family, ProtocolKind};
use rchiptool_core::protocol::CancelToken;
use rchiptool_core::transport::{Result, Transport, TransportError};

/// Configuration for the emulated device
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Bootloader protocol spoken
    pub protocol: ProtocolKind,
    /// Flash size in bytes
    pub flash_size: usize,
    /// Erase granularity
    pub sector_size: usize,
    /// Largest chunk offered in the HELLO reply (chunked CRC only)
    pub max_chunk: u16,
    /// Whether VERIFY is supported (chunked CRC only)
    pub verify: bool,
    /// Bootloader version reported in HELLO
    pub version: u8,
    /// Largest single write the emulated link accepts
    pub max_write_len: Option<usize>,
}

impl MockConfig {
    /// A device matching a family's geometry and protocol
    pub fn for_family(family: &Family) -> Self {
        Self {
            protocol: family.protocol,
            flash_size: family.geometry.total_size as usize,
            sector_size: family.geometry.sector_size as usize,
            ..Self::default()
        }
    }
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::ChunkedCrc,
            flash_size: 2 * 1024 * 1024,
            sector_size: 4096,
            max_chunk: 1024,
            verify: true,
            version: 2,
            max_write_len: None,
        }
    }
}

/// Faults to inject
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Ignore this many handshake probes before answering
    pub ignore_probes: u32,
    /// Reject the first N attempts of every chunk
    pub reject_first_attempts: u32,
    /// Reject every chunk of the image started as the Nth (0-based)
    pub fail_image: Option<usize>,
    /// Drop the link once this many chunks were accepted
    pub disconnect_after_chunks: Option<usize>,
    /// Cancel the token while the Nth accepted chunk is being written
    pub cancel_after_chunks: Option<(usize, CancelToken)>,
    /// Report a wrong CRC for every VERIFY
    pub corrupt_verify: bool,
    /// Cancel the token while answering a VERIFY
    pub cancel_on_verify: Option<CancelToken>,
}

impl FaultPlan {
    /// A device that never answers the handshake
    pub fn silent() -> Self {
        Self {
            ignore_probes: u32::MAX,
            ..Self::default()
        }
    }
}

/// What the device saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Handshake probes received
    pub probes: u32,
    /// Chunks written to flash
    pub chunks_accepted: usize,
    /// Chunk attempts refused
    pub chunks_rejected: usize,
    /// Duplicate chunks acknowledged without writing
    pub duplicates: usize,
    /// Images started (BEGIN or ERASE)
    pub images_started: usize,
    /// Protocol-level reset commands
    pub protocol_resets: u32,
    /// Out-of-band resets through the transport
    pub line_resets: u32,
}

/// Emulated bootloader
#[derive(Debug)]
pub struct MockDevice {
    config: MockConfig,
    faults: FaultPlan,
    flash: Vec<u8>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    stats: MockStats,
    disconnected: bool,
    last_chunk: Option<(usize, u32)>,
    attempts: u32,
    state: stop_and_wait::State,
    chunk_size: Option<usize>,
}

impl MockDevice {
    /// Create a fault-free device with erased flash
    pub fn new(config: MockConfig) -> Self {
        Self::with_faults(config, FaultPlan::default())
    }

    /// Create a device that injects `faults`
    pub fn with_faults(config: MockConfig, faults: FaultPlan) -> Self {
        let flash = vec![0xFF; config.flash_size];
        Self {
            config,
            faults,
            flash,
            rx: Vec::new(),
            tx: VecDeque::new(),
            stats: MockStats::default(),
            disconnected: false,
            last_chunk: None,
            attempts: 0,
            state: stop_and_wait::State::default(),
            chunk_size: None,
        }
    }

    /// Create a fault-free device for a family
    pub fn for_family(family: &Family) -> Self {
        Self::new(MockConfig::for_family(family))
    }

    /// Flash contents
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Flash contents in `[address, address + len)`
    pub fn contents(&self, address: u32, len: usize) -> &[u8] {
        let start = (address as usize).min(self.flash.len());
        let end = start.saturating_add(len).min(self.flash.len());
        &self.flash[start..end]
    }

    /// Counters
    pub fn stats(&self) -> &MockStats {
        &self.stats
    }

    /// Configuration
    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    fn reply(&mut self, bytes: &[u8]) {
        log::trace!("mock: reply {:02X?}", bytes);
        self.tx.extend(bytes.iter().copied());
    }

    /// Count a probe; true if it should be answered
    fn probe(&mut self) -> bool {
        self.stats.probes += 1;
        self.stats.probes > self.faults.ignore_probes
    }

    fn in_bounds(&self, address: u32, len: usize) -> bool {
        (address as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.flash.len())
    }

    /// Erase the sectors covering `[address, address + len)`
    fn erase(&mut self, address: u32, len: usize) {
        if len == 0 {
            return;
        }
        let sector = self.config.sector_size.max(1);
        let start = address as usize / sector * sector;
        let end = (address as usize + len)
            .div_ceil(sector)
            .saturating_mul(sector)
            .min(self.flash.len());
        log::debug!("mock: erase 0x{:08X}..0x{:08X}", start, end);
        self.flash[start..end].fill(0xFF);
    }

    /// Program bytes; programming can only clear bits
    fn program(&mut self, address: u32, data: &[u8]) {
        let start = address as usize;
        for (cell, &byte) in self.flash[start..start + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
    }

    fn start_image(&mut self) {
        self.stats.images_started += 1;
    }

    /// Decide whether to refuse this attempt of a chunk
    ///
    /// `key` identifies the chunk within the current image; consecutive
    /// attempts with the same key are retries.
    fn reject_chunk(&mut self, key: u32) -> bool {
        let key = (self.stats.images_started, key);
        if self.last_chunk == Some(key) {
            self.attempts += 1;
        } else {
            self.last_chunk = Some(key);
            self.attempts = 1;
        }

        let failing_image = self
            .stats
            .images_started
            .checked_sub(1)
            .is_some_and(|current| self.faults.fail_image == Some(current));
        let reject = failing_image || self.attempts <= self.faults.reject_first_attempts;
        if reject {
            log::debug!("mock: rejecting chunk {:?} attempt {}", key, self.attempts);
            self.stats.chunks_rejected += 1;
        }
        reject
    }

    fn chunk_accepted(&mut self) {
        self.stats.chunks_accepted += 1;
        let accepted = self.stats.chunks_accepted;

        if let Some((n, token)) = &self.faults.cancel_after_chunks {
            if accepted == *n {
                log::debug!("mock: cancelling after {} chunks", accepted);
                token.cancel();
            }
        }
        if self.faults.disconnect_after_chunks == Some(accepted) {
            log::debug!("mock: dropping the link after {} chunks", accepted);
            self.disconnected = true;
        }
    }

    fn process(&mut self) {
        match self.config.protocol {
            ProtocolKind::StopAndWait => self.process_stop_and_wait(),
            ProtocolKind::ChunkedCrc => self.process_chunked_crc(),
        }
    }
}

fn le_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?))
}

impl Transport for MockDevice {
    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        if self.tx.is_empty() && self.disconnected {
            return Err(TransportError::Closed);
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        if self.disconnected {
            return Err(TransportError::Closed);
        }
        if let Some(max) = self.config.max_write_len {
            if data.len() > max {
                return Err(TransportError::WriteTimeout(timeout));
            }
        }
        self.rx.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn max_write_len(&self) -> Option<usize> {
        self.config.max_write_len
    }

    fn discard_input(&mut self) -> Result<()> {
        self.tx.clear();
        Ok(())
    }

    fn reset_device(&mut self) -> Result<()> {
        log::debug!("mock: line reset");
        self.stats.line_resets += 1;
        self.rx.clear();
        self.tx.clear();
        self.state = stop_and_wait::State::default();
        self.chunk_size = None;
        Ok(())
    }
}
