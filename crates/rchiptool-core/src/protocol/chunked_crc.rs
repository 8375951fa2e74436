//! Chunked CRC bootloader protocol
//!
//! Used by Realtek and Lightning style bootloaders. Requests and responses
//! are length-prefixed frames protected by a CRC-32:
//!
//! ```text
//! request   A5 cmd    len:u16 payload crc32(cmd, len, payload):u32
//! response  5A status len:u16 payload crc32(status, len, payload):u32
//! ```
//!
//! Commands:
//!
//! | cmd  | name       | payload            | reply payload                 |
//! |------|------------|--------------------|-------------------------------|
//! | 0x01 | HELLO      | -                  | version, max_chunk:u16, caps  |
//! | 0x02 | CHUNK_SIZE | size:u16           | accepted:u16                  |
//! | 0x11 | ERASE      | addr:u32, len:u32  | -                             |
//! | 0x12 | WRITE      | addr:u32, data     | -                             |
//! | 0x20 | VERIFY     | addr:u32, len:u32  | crc32:u32                     |
//! | 0x30 | RESET      | -                  | (no reply)                    |

use std::time::Duration;

use super::error::{ProtocolError, RejectReason, Result, Stage};
use super::link::Link;
use super::{Capabilities, ChunkStatus, FlashProtocol};
use crate::container::Image;
use crate::family::FlashGeometry;

/// HELLO command
pub const CMD_HELLO: u8 = 0x01;
/// CHUNK_SIZE command
pub const CMD_CHUNK_SIZE: u8 = 0x02;
/// ERASE command
pub const CMD_ERASE: u8 = 0x11;
/// WRITE command
pub const CMD_WRITE: u8 = 0x12;
/// VERIFY command
pub const CMD_VERIFY: u8 = 0x20;
/// RESET command
pub const CMD_RESET: u8 = 0x30;

/// Response status: success
pub const STATUS_OK: u8 = 0x00;
/// Response status: request CRC did not match
pub const STATUS_CRC_ERROR: u8 = 0x01;
/// Response status: request refused
pub const STATUS_REJECTED: u8 = 0x02;
/// Response status: command not supported
pub const STATUS_UNSUPPORTED: u8 = 0x03;

/// HELLO capability bit: device supports VERIFY
pub const CAP_VERIFY: u8 = 1 << 0;

/// Largest chunk the host will ever send
pub const MAX_CHUNK: usize = 4096;
/// Smallest chunk the host will use
pub const MIN_CHUNK: usize = 16;

/// Erases take much longer than ordinary commands
const ERASE_TIMEOUT_FACTOR: u32 = 8;

/// Frame encoding shared by host and device
pub mod frame {
    use crate::checksum::Crc32;

    /// Start byte of host requests
    pub const REQUEST_SYNC: u8 = 0xA5;
    /// Start byte of device responses
    pub const RESPONSE_SYNC: u8 = 0x5A;
    /// Sync, code and length
    pub const HEADER_LEN: usize = 4;
    /// Trailing CRC
    pub const TRAILER_LEN: usize = 4;

    fn crc(code: u8, len: [u8; 2], payload: &[u8]) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&[code]);
        crc.update(&len);
        crc.update(payload);
        crc.finalize()
    }

    /// Encode a frame
    ///
    /// Payloads longer than `u16::MAX` are truncated; callers keep chunks
    /// far below that.
    pub fn encode(sync: u8, code: u8, payload: &[u8]) -> Vec<u8> {
        let payload = &payload[..payload.len().min(u16::MAX as usize)];
        let len = (payload.len() as u16).to_le_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        out.push(sync);
        out.push(code);
        out.extend_from_slice(&len);
        out.extend_from_slice(payload);
        out.extend_from_slice(&crc(code, len, payload).to_le_bytes());
        out
    }

    /// A decoded frame
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Frame {
        /// Command (requests) or status (responses)
        pub code: u8,
        /// Payload bytes
        pub payload: Vec<u8>,
    }

    /// Result of decoding from the front of a buffer
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Decoded {
        /// More bytes are needed
        Incomplete,
        /// A valid frame occupying `consumed` bytes
        Frame {
            /// The frame
            frame: Frame,
            /// Bytes used
            consumed: usize,
        },
        /// Invalid data; skip `consumed` bytes and try again
        Corrupt {
            /// Bytes to drop
            consumed: usize,
        },
    }

    /// Length of a complete frame given its header
    pub fn frame_len(header: &[u8; HEADER_LEN]) -> usize {
        HEADER_LEN + u16::from_le_bytes([header[2], header[3]]) as usize + TRAILER_LEN
    }

    /// Check the CRC of a complete frame (header included)
    pub fn check(sync: u8, raw: &[u8]) -> Option<Frame> {
        if raw.len() < HEADER_LEN + TRAILER_LEN || raw[0] != sync {
            return None;
        }
        let (body, trailer) = raw.split_at(raw.len() - TRAILER_LEN);
        let code = body[1];
        let len = [body[2], body[3]];
        let payload = &body[HEADER_LEN..];
        if u16::from_le_bytes(len) as usize != payload.len() {
            return None;
        }
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        (stored == crc(code, len, payload)).then(|| Frame {
            code,
            payload: payload.to_vec(),
        })
    }

    /// Decode one frame from the front of `buf`
    pub fn decode(sync: u8, buf: &[u8]) -> Decoded {
        let Some(&first) = buf.first() else {
            return Decoded::Incomplete;
        };
        if first != sync {
            return Decoded::Corrupt { consumed: 1 };
        }
        let Some(header) = buf.get(..HEADER_LEN) else {
            return Decoded::Incomplete;
        };
        let total = frame_len(&[header[0], header[1], header[2], header[3]]);
        let Some(raw) = buf.get(..total) else {
            return Decoded::Incomplete;
        };
        match check(sync, raw) {
            Some(frame) => Decoded::Frame {
                frame,
                consumed: total,
            },
            None => Decoded::Corrupt { consumed: total },
        }
    }
}

/// Outcome of one request/response exchange
enum Reply {
    Ok(Vec<u8>),
    Status(u8),
    Garbled,
    Timeout,
}

/// Chunked CRC protocol state
#[derive(Debug)]
pub struct ChunkedCrc {
    device_max_chunk: usize,
    device_verify: bool,
    version: Option<u8>,
    /// Sector-aligned ranges erased so far, sorted and disjoint
    erased: Vec<(u64, u64)>,
}

impl Default for ChunkedCrc {
    fn default() -> Self {
        Self {
            device_max_chunk: MAX_CHUNK,
            device_verify: false,
            version: None,
            erased: Vec::new(),
        }
    }
}

impl ChunkedCrc {
    /// Create a new protocol instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Bootloader protocol version reported by HELLO
    pub fn device_version(&self) -> Option<u8> {
        self.version
    }

    fn exchange(
        &mut self,
        link: &mut Link<'_>,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Reply> {
        link.send(&frame::encode(frame::REQUEST_SYNC, cmd, payload))?;

        let mut header = [0u8; frame::HEADER_LEN];
        if !link.recv_exact(&mut header, timeout)? {
            return Ok(Reply::Timeout);
        }
        if header[0] != frame::RESPONSE_SYNC {
            log::debug!("chunked-crc: bad response sync 0x{:02X}", header[0]);
            link.discard_input()?;
            return Ok(Reply::Garbled);
        }

        let mut raw = vec![0u8; frame::frame_len(&header)];
        raw[..frame::HEADER_LEN].copy_from_slice(&header);
        if !link.recv_exact(&mut raw[frame::HEADER_LEN..], timeout)? {
            return Ok(Reply::Garbled);
        }

        let Some(response) = frame::check(frame::RESPONSE_SYNC, &raw) else {
            log::debug!("chunked-crc: response CRC mismatch for command 0x{:02X}", cmd);
            link.discard_input()?;
            return Ok(Reply::Garbled);
        };

        Ok(match response.code {
            STATUS_OK => Reply::Ok(response.payload),
            status => Reply::Status(status),
        })
    }

    /// Exchange outside the chunk loop, where every failure is an error
    fn command(
        &mut self,
        link: &mut Link<'_>,
        cmd: u8,
        payload: &[u8],
        timeout: Duration,
        stage: Stage,
    ) -> Result<Vec<u8>> {
        match self.exchange(link, cmd, payload, timeout)? {
            Reply::Ok(payload) => Ok(payload),
            Reply::Status(status) => Err(ProtocolError::DeviceNacked { stage, status }),
            Reply::Garbled => Err(ProtocolError::UnexpectedReply { stage }),
            Reply::Timeout => Err(ProtocolError::NoReply { stage }),
        }
    }
}

fn addr_len(address: u32, len: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&address.to_le_bytes());
    out[4..].copy_from_slice(&len.to_le_bytes());
    out
}

/// Parts of `[start, end)` not covered by `erased`
fn unerased(erased: &[(u64, u64)], start: u64, end: u64) -> Vec<(u64, u64)> {
    let mut gaps = Vec::new();
    let mut cursor = start;
    for &(from, to) in erased {
        if to <= cursor {
            continue;
        }
        if from >= end {
            break;
        }
        if from > cursor {
            gaps.push((cursor, from));
        }
        cursor = to;
        if cursor >= end {
            break;
        }
    }
    if cursor < end {
        gaps.push((cursor, end));
    }
    gaps
}

/// Add `[start, end)` to `erased`, merging touching ranges
fn mark_erased(erased: &mut Vec<(u64, u64)>, start: u64, end: u64) {
    erased.push((start, end));
    erased.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(erased.len());
    for &(from, to) in erased.iter() {
        match merged.last_mut() {
            Some(last) if from <= last.1 => last.1 = last.1.max(to),
            _ => merged.push((from, to)),
        }
    }
    *erased = merged;
}

impl FlashProtocol for ChunkedCrc {
    fn name(&self) -> &'static str {
        "chunked-crc"
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::ERASE | Capabilities::RESET;
        if self.device_verify {
            caps |= Capabilities::VERIFY;
        }
        caps
    }

    fn max_chunk_size(&self) -> usize {
        MAX_CHUNK
    }

    fn min_chunk_size(&self) -> usize {
        MIN_CHUNK
    }

    fn frame_overhead(&self) -> usize {
        // header, address, CRC trailer
        frame::HEADER_LEN + 4 + frame::TRAILER_LEN
    }

    fn handshake(&mut self, link: &mut Link<'_>, timeout: Duration) -> Result<bool> {
        // A refused or malformed HELLO counts as a failed attempt
        let payload = match self.exchange(link, CMD_HELLO, &[], timeout)? {
            Reply::Ok(payload) => payload,
            Reply::Timeout | Reply::Garbled => return Ok(false),
            Reply::Status(status) => {
                log::debug!("chunked-crc: HELLO refused (status 0x{:02X})", status);
                return Ok(false);
            }
        };

        let [version, max_lo, max_hi, caps] = payload[..] else {
            log::debug!("chunked-crc: HELLO reply of {} bytes", payload.len());
            return Ok(false);
        };
        self.version = Some(version);
        self.device_max_chunk = u16::from_le_bytes([max_lo, max_hi]) as usize;
        self.device_verify = caps & CAP_VERIFY != 0;

        log::debug!(
            "chunked-crc: bootloader v{} max chunk {} verify {}",
            version,
            self.device_max_chunk,
            self.device_verify
        );
        Ok(true)
    }

    fn negotiate_chunk_size(&mut self, link: &mut Link<'_>, proposed: usize) -> Result<usize> {
        let size = proposed.min(self.device_max_chunk).min(MAX_CHUNK);
        if size < MIN_CHUNK {
            return Err(ProtocolError::ChunkSizeUnsupported {
                size,
                minimum: MIN_CHUNK,
            });
        }

        let timeout = link.reply_timeout();
        let reply = self.command(
            link,
            CMD_CHUNK_SIZE,
            &(size as u16).to_le_bytes(),
            timeout,
            Stage::Negotiate,
        )?;
        let [lo, hi] = reply[..] else {
            return Err(ProtocolError::UnexpectedReply {
                stage: Stage::Negotiate,
            });
        };

        let accepted = u16::from_le_bytes([lo, hi]) as usize;
        if accepted > size {
            return Err(ProtocolError::UnexpectedReply {
                stage: Stage::Negotiate,
            });
        }
        if accepted < MIN_CHUNK {
            return Err(ProtocolError::ChunkSizeUnsupported {
                size: accepted,
                minimum: MIN_CHUNK,
            });
        }
        Ok(accepted)
    }

    fn begin_image(
        &mut self,
        link: &mut Link<'_>,
        image: &Image,
        geometry: &FlashGeometry,
    ) -> Result<()> {
        if image.is_empty() {
            return Ok(());
        }

        let start = geometry.align_down(image.load_address() as u64);
        let end = geometry
            .align_up(image.end())
            .min(geometry.total_size as u64);

        // Sectors shared with an earlier image already hold its data
        let pending = unerased(&self.erased, start, end);
        if pending.is_empty() {
            log::debug!(
                "chunked-crc: 0x{:08X}..0x{:08X} already erased",
                start,
                end
            );
        }
        let timeout = link.reply_timeout() * ERASE_TIMEOUT_FACTOR;
        for (from, to) in pending {
            log::debug!("chunked-crc: erasing 0x{:08X}..0x{:08X}", from, to);
            self.command(
                link,
                CMD_ERASE,
                &addr_len(from as u32, (to - from) as u32),
                timeout,
                Stage::BeginImage,
            )?;
            mark_erased(&mut self.erased, from, to);
        }
        Ok(())
    }

    fn write_chunk(
        &mut self,
        link: &mut Link<'_>,
        _index: usize,
        address: u32,
        data: &[u8],
    ) -> Result<ChunkStatus> {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&address.to_le_bytes());
        payload.extend_from_slice(data);

        let timeout = link.reply_timeout();
        let status = match self.exchange(link, CMD_WRITE, &payload, timeout)? {
            Reply::Ok(_) => ChunkStatus::Accepted,
            Reply::Status(STATUS_CRC_ERROR) => {
                ChunkStatus::Rejected(RejectReason::ChecksumMismatch)
            }
            Reply::Status(_) => ChunkStatus::Rejected(RejectReason::Nack),
            Reply::Garbled => ChunkStatus::Rejected(RejectReason::Garbled),
            Reply::Timeout => ChunkStatus::Rejected(RejectReason::NoReply),
        };
        Ok(status)
    }

    fn end_image(&mut self, _link: &mut Link<'_>, _image: &Image) -> Result<()> {
        Ok(())
    }

    fn verify(&mut self, link: &mut Link<'_>, image: &Image) -> Result<Option<u32>> {
        if !self.device_verify {
            return Ok(None);
        }

        let timeout = link.reply_timeout();
        let request = addr_len(image.load_address(), image.len() as u32);
        match self.exchange(link, CMD_VERIFY, &request, timeout)? {
            Reply::Ok(payload) => {
                let [a, b, c, d] = payload[..] else {
                    return Err(ProtocolError::UnexpectedReply {
                        stage: Stage::Verify,
                    });
                };
                Ok(Some(u32::from_le_bytes([a, b, c, d])))
            }
            Reply::Status(STATUS_UNSUPPORTED) => Ok(None),
            Reply::Status(status) => Err(ProtocolError::DeviceNacked {
                stage: Stage::Verify,
                status,
            }),
            Reply::Garbled => Err(ProtocolError::UnexpectedReply {
                stage: Stage::Verify,
            }),
            Reply::Timeout => Err(ProtocolError::NoReply {
                stage: Stage::Verify,
            }),
        }
    }

    fn finalize(&mut self, link: &mut Link<'_>) -> Result<()> {
        link.send(&frame::encode(frame::REQUEST_SYNC, CMD_RESET, &[]))
    }
}

#[cfg(test)]
mod tests {
    use super::frame::*;
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let raw = encode(REQUEST_SYNC, CMD_WRITE, &[1, 2, 3]);
        assert_eq!(raw.len(), HEADER_LEN + 3 + TRAILER_LEN);
        assert_eq!(&raw[..4], &[0xA5, 0x12, 3, 0]);

        let mut stream = raw.clone();
        stream.extend_from_slice(&[0xA5]);
        match decode(REQUEST_SYNC, &stream) {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame.code, CMD_WRITE);
                assert_eq!(frame.payload, [1, 2, 3]);
                assert_eq!(consumed, raw.len());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(decode(REQUEST_SYNC, &raw[..5]), Decoded::Incomplete);
    }

    #[test]
    fn test_frame_corruption() {
        let mut raw = encode(RESPONSE_SYNC, STATUS_OK, &[9, 9]);
        assert_eq!(decode(REQUEST_SYNC, &raw), Decoded::Corrupt { consumed: 1 });

        raw[5] ^= 0x40;
        assert_eq!(
            decode(RESPONSE_SYNC, &raw),
            Decoded::Corrupt {
                consumed: raw.len()
            }
        );
        assert!(check(RESPONSE_SYNC, &raw).is_none());
    }

    #[test]
    fn test_capabilities_follow_device() {
        let mut protocol = ChunkedCrc::new();
        assert!(!protocol.capabilities().contains(Capabilities::VERIFY));
        protocol.device_verify = true;
        assert!(protocol.capabilities().contains(Capabilities::VERIFY));
    }

    #[test]
    fn test_erase_ranges_skip_shared_sectors() {
        let mut erased = Vec::new();
        assert_eq!(unerased(&erased, 0x10000, 0x11000), [(0x10000, 0x11000)]);
        mark_erased(&mut erased, 0x10000, 0x11000);

        // A second image in the same sector needs no erase
        assert!(unerased(&erased, 0x10000, 0x11000).is_empty());
        // One that spills into the next sector only erases that one
        assert_eq!(unerased(&erased, 0x10000, 0x12000), [(0x11000, 0x12000)]);

        mark_erased(&mut erased, 0x14000, 0x15000);
        assert_eq!(
            unerased(&erased, 0xF000, 0x16000),
            [(0xF000, 0x10000), (0x11000, 0x14000), (0x15000, 0x16000)]
        );

        mark_erased(&mut erased, 0x11000, 0x14000);
        assert_eq!(erased, [(0x10000, 0x15000)]);
    }
}
