//! Flashing protocol engine
//!
//! Each family speaks one bootloader protocol. The protocols differ in
//! framing but share one shape: handshake, agree on a chunk size, write
//! chunks with per-chunk acknowledgement, optionally verify, then reset.
//! That shape is the [`FlashProtocol`] trait; the closed set of
//! implementations is [`Variant`]. The [`Session`] state machine drives any
//! variant and owns retries, cancellation and reporting.

mod chunked_crc;
mod error;
mod link;
mod options;
mod progress;
mod report;
mod session;
mod stop_and_wait;

pub use chunked_crc::{frame, ChunkedCrc};
pub use error::{ProtocolError, RejectReason, Result, Stage};
pub use link::Link;
pub use options::{parse_number, FlashOptions, OptionsError};
pub use progress::{FlashProgress, NoProgress};
pub use report::{FlashFailure, FlashOutcome, FlashReport, ImageReport, Verification};
pub use session::{CancelToken, Session, SessionState};
pub use stop_and_wait::StopAndWait;

/// Wire constants of each protocol, for device emulators and tests
pub mod wire {
    /// Chunked CRC protocol constants
    pub mod chunked_crc {
        pub use super::super::chunked_crc::{
            CAP_VERIFY, CMD_CHUNK_SIZE, CMD_ERASE, CMD_HELLO, CMD_RESET, CMD_VERIFY, CMD_WRITE,
            MAX_CHUNK, MIN_CHUNK, STATUS_CRC_ERROR, STATUS_OK, STATUS_REJECTED,
            STATUS_UNSUPPORTED,
        };
    }

    /// Stop-and-wait protocol constants
    pub mod stop_and_wait {
        pub use super::super::stop_and_wait::{
            ACK, BLOCK_SIZE, CMD_BEGIN, CMD_DATA, CMD_END, CMD_RESET, CMD_SYNC, FRAME_START, NAK,
            PAD_BYTE, SYNC_REPLY,
        };
    }
}

use std::time::Duration;

use bitflags::bitflags;

use crate::container::Image;
use crate::family::{FlashGeometry, ProtocolKind};

bitflags! {
    /// Optional protocol features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// The protocol erases sectors explicitly before writing
        const ERASE = 1 << 0;
        /// The device can report a checksum of written flash
        const VERIFY = 1 << 1;
        /// The device can be reset through the protocol
        const RESET = 1 << 2;
    }
}

/// Device answer to one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The chunk was written
    Accepted,
    /// The chunk was not written and may be retried
    Rejected(RejectReason),
}

/// Operations every bootloader protocol provides
///
/// Implementations only frame bytes; retries, cancellation and ordering are
/// the session's job. A rejected chunk is reported as
/// [`ChunkStatus::Rejected`], never as an error, so the session can retry it.
pub trait FlashProtocol {
    /// Protocol name for logs
    fn name(&self) -> &'static str;

    /// Features available (may change after the handshake)
    fn capabilities(&self) -> Capabilities;

    /// Largest chunk the protocol can carry
    fn max_chunk_size(&self) -> usize;

    /// Smallest chunk the protocol can carry
    fn min_chunk_size(&self) -> usize {
        1
    }

    /// Bytes a chunk write adds around the chunk data on the wire
    fn frame_overhead(&self) -> usize {
        0
    }

    /// Send one probe and wait up to `timeout` for the bootloader's answer
    ///
    /// Returns `false` if nothing recognizable arrived.
    fn handshake(&mut self, link: &mut Link<'_>, timeout: Duration) -> Result<bool>;

    /// Agree on a chunk size no larger than `proposed`
    fn negotiate_chunk_size(&mut self, link: &mut Link<'_>, proposed: usize) -> Result<usize>;

    /// Prepare the device to receive `image`
    fn begin_image(
        &mut self,
        link: &mut Link<'_>,
        image: &Image,
        geometry: &FlashGeometry,
    ) -> Result<()>;

    /// Write one chunk of the current image
    fn write_chunk(
        &mut self,
        link: &mut Link<'_>,
        index: usize,
        address: u32,
        data: &[u8],
    ) -> Result<ChunkStatus>;

    /// Close the current image
    fn end_image(&mut self, link: &mut Link<'_>, image: &Image) -> Result<()>;

    /// Ask the device for the CRC-32 of a written image
    ///
    /// Returns `None` when device-side verification is not available.
    fn verify(&mut self, link: &mut Link<'_>, image: &Image) -> Result<Option<u32>>;

    /// Leave the bootloader (reset into the new firmware)
    fn finalize(&mut self, link: &mut Link<'_>) -> Result<()>;
}

/// The supported protocols
#[derive(Debug)]
pub enum Variant {
    /// Fixed-block ACK/NAK protocol
    StopAndWait(StopAndWait),
    /// Framed protocol with per-chunk CRC
    ChunkedCrc(ChunkedCrc),
}

impl Variant {
    /// Fresh protocol state for a family's protocol kind
    pub fn for_kind(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::StopAndWait => Self::StopAndWait(StopAndWait::new()),
            ProtocolKind::ChunkedCrc => Self::ChunkedCrc(ChunkedCrc::new()),
        }
    }

    fn inner(&mut self) -> &mut dyn FlashProtocol {
        match self {
            Self::StopAndWait(p) => p,
            Self::ChunkedCrc(p) => p,
        }
    }

    fn inner_ref(&self) -> &dyn FlashProtocol {
        match self {
            Self::StopAndWait(p) => p,
            Self::ChunkedCrc(p) => p,
        }
    }
}

impl FlashProtocol for Variant {
    fn name(&self) -> &'static str {
        self.inner_ref().name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner_ref().capabilities()
    }

    fn max_chunk_size(&self) -> usize {
        self.inner_ref().max_chunk_size()
    }

    fn min_chunk_size(&self) -> usize {
        self.inner_ref().min_chunk_size()
    }

    fn frame_overhead(&self) -> usize {
        self.inner_ref().frame_overhead()
    }

    fn handshake(&mut self, link: &mut Link<'_>, timeout: Duration) -> Result<bool> {
        self.inner().handshake(link, timeout)
    }

    fn negotiate_chunk_size(&mut self, link: &mut Link<'_>, proposed: usize) -> Result<usize> {
        self.inner().negotiate_chunk_size(link, proposed)
    }

    fn begin_image(
        &mut self,
        link: &mut Link<'_>,
        image: &Image,
        geometry: &FlashGeometry,
    ) -> Result<()> {
        self.inner().begin_image(link, image, geometry)
    }

    fn write_chunk(
        &mut self,
        link: &mut Link<'_>,
        index: usize,
        address: u32,
        data: &[u8],
    ) -> Result<ChunkStatus> {
        self.inner().write_chunk(link, index, address, data)
    }

    fn end_image(&mut self, link: &mut Link<'_>, image: &Image) -> Result<()> {
        self.inner().end_image(link, image)
    }

    fn verify(&mut self, link: &mut Link<'_>, image: &Image) -> Result<Option<u32>> {
        self.inner().verify(link, image)
    }

    fn finalize(&mut self, link: &mut Link<'_>) -> Result<()> {
        self.inner().finalize(link)
    }
}
