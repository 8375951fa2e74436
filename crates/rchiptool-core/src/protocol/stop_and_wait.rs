//! Stop-and-wait bootloader protocol
//!
//! Used by Beken-style bootloaders. Every frame starts with `0x7E` and a
//! command byte; the device answers each command with a single ACK or NAK.
//!
//! ```text
//! SYNC   7E 53                       -> 7E 4F 4B
//! BEGIN  7E 42 addr:u32 len:u32      -> ACK | NAK
//! DATA   7E 44 seq:u8 data[16]       -> ACK | NAK
//! END    7E 45 sum:u32               -> ACK | NAK
//! RESET  7E 52                       (no reply)
//! ```
//!
//! Data blocks are always 16 bytes; the last block of an image is padded
//! with `0xFF`. The sequence number is the low byte of the chunk index, so
//! a retried block carries the same number and the device re-acknowledges
//! a duplicate of its last accepted block without writing it twice. `sum` is
//! the 32-bit byte sum of the image payload as acknowledged by the device.
//! There is no readback, so images are never device-verified.

use std::time::Duration;

use super::error::{ProtocolError, RejectReason, Result, Stage};
use super::link::Link;
use super::{Capabilities, ChunkStatus, FlashProtocol};
use crate::checksum::Sum32;
use crate::container::Image;
use crate::family::FlashGeometry;

/// Frame start byte
pub const FRAME_START: u8 = 0x7E;
/// Sync probe command
pub const CMD_SYNC: u8 = 0x53;
/// Begin image command
pub const CMD_BEGIN: u8 = 0x42;
/// Data block command
pub const CMD_DATA: u8 = 0x44;
/// End image command
pub const CMD_END: u8 = 0x45;
/// Reset command
pub const CMD_RESET: u8 = 0x52;
/// Reply to a sync probe
pub const SYNC_REPLY: [u8; 3] = [FRAME_START, 0x4F, 0x4B];
/// Positive acknowledgement
pub const ACK: u8 = 0x06;
/// Negative acknowledgement
pub const NAK: u8 = 0x15;
/// Fixed data block size
pub const BLOCK_SIZE: usize = 16;
/// Padding for the last block of an image
pub const PAD_BYTE: u8 = 0xFF;

/// Stop-and-wait protocol state
#[derive(Debug, Default)]
pub struct StopAndWait {
    sum: Sum32,
}

impl StopAndWait {
    /// Create a new protocol instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a DATA frame for `data` (at most one block)
    pub fn data_frame(seq: u8, data: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(3 + BLOCK_SIZE);
        frame.extend_from_slice(&[FRAME_START, CMD_DATA, seq]);
        frame.extend_from_slice(data);
        frame.resize(3 + BLOCK_SIZE, PAD_BYTE);
        frame
    }

    fn command(&mut self, link: &mut Link<'_>, frame: &[u8], stage: Stage) -> Result<()> {
        link.send(frame)?;
        let timeout = link.reply_timeout();
        match link.recv_byte(timeout)? {
            Some(ACK) => Ok(()),
            Some(NAK) => Err(ProtocolError::DeviceNacked { stage, status: NAK }),
            Some(other) => {
                log::debug!("stop-and-wait: unexpected reply 0x{:02X} during {}", other, stage);
                Err(ProtocolError::UnexpectedReply { stage })
            }
            None => Err(ProtocolError::NoReply { stage }),
        }
    }
}

impl FlashProtocol for StopAndWait {
    fn name(&self) -> &'static str {
        "stop-and-wait"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::RESET
    }

    fn max_chunk_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn min_chunk_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn frame_overhead(&self) -> usize {
        3
    }

    fn handshake(&mut self, link: &mut Link<'_>, timeout: Duration) -> Result<bool> {
        link.send(&[FRAME_START, CMD_SYNC])?;
        link.wait_for(&SYNC_REPLY, timeout)
    }

    fn negotiate_chunk_size(&mut self, _link: &mut Link<'_>, proposed: usize) -> Result<usize> {
        if proposed < BLOCK_SIZE {
            return Err(ProtocolError::ChunkSizeUnsupported {
                size: proposed,
                minimum: BLOCK_SIZE,
            });
        }
        Ok(BLOCK_SIZE)
    }

    fn begin_image(
        &mut self,
        link: &mut Link<'_>,
        image: &Image,
        _geometry: &FlashGeometry,
    ) -> Result<()> {
        self.sum = Sum32::new();

        let len = image.len() as u32;
        let mut frame = vec![FRAME_START, CMD_BEGIN];
        frame.extend_from_slice(&image.load_address().to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        self.command(link, &frame, Stage::BeginImage)
    }

    fn write_chunk(
        &mut self,
        link: &mut Link<'_>,
        index: usize,
        _address: u32,
        data: &[u8],
    ) -> Result<ChunkStatus> {
        link.send(&Self::data_frame(index as u8, data))?;

        let timeout = link.reply_timeout();
        let status = match link.recv_byte(timeout)? {
            Some(ACK) => {
                self.sum.update(data);
                ChunkStatus::Accepted
            }
            Some(NAK) => ChunkStatus::Rejected(RejectReason::Nack),
            Some(_) => ChunkStatus::Rejected(RejectReason::Garbled),
            None => ChunkStatus::Rejected(RejectReason::NoReply),
        };
        Ok(status)
    }

    fn end_image(&mut self, link: &mut Link<'_>, _image: &Image) -> Result<()> {
        let mut frame = vec![FRAME_START, CMD_END];
        frame.extend_from_slice(&self.sum.value().to_le_bytes());
        self.command(link, &frame, Stage::EndImage)
    }

    fn verify(&mut self, _link: &mut Link<'_>, _image: &Image) -> Result<Option<u32>> {
        Ok(None)
    }

    fn finalize(&mut self, link: &mut Link<'_>) -> Result<()> {
        link.send(&[FRAME_START, CMD_RESET])
    }
}
