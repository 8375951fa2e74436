//! Device side of the chunked CRC protocol

use rchiptool_core::checksum::crc32;
use rchiptool_core::protocol::frame::{self, Decoded};
use rchiptool_core::protocol::wire::chunked_crc::*;

use crate::{le_u32, MockDevice};

impl MockDevice {
    pub(crate) fn process_chunked_crc(&mut self) {
        loop {
            match frame::decode(frame::REQUEST_SYNC, &self.rx) {
                Decoded::Incomplete => return,
                Decoded::Corrupt { consumed } => {
                    self.rx.drain(..consumed);
                    // A lone bad byte is line noise; a whole bad frame gets an answer
                    if consumed > 1 {
                        self.respond(STATUS_CRC_ERROR, &[]);
                    }
                }
                Decoded::Frame { frame, consumed } => {
                    self.rx.drain(..consumed);
                    self.handle_chunked_crc(frame.code, &frame.payload);
                }
            }
        }
    }

    fn respond(&mut self, status: u8, payload: &[u8]) {
        let frame = frame::encode(frame::RESPONSE_SYNC, status, payload);
        self.reply(&frame);
    }

    fn handle_chunked_crc(&mut self, cmd: u8, payload: &[u8]) {
        match cmd {
            CMD_HELLO => {
                if self.probe() {
                    let [lo, hi] = self.config.max_chunk.to_le_bytes();
                    let caps = if self.config.verify { CAP_VERIFY } else { 0 };
                    self.respond(STATUS_OK, &[self.config.version, lo, hi, caps]);
                }
            }
            CMD_CHUNK_SIZE => {
                let [lo, hi] = payload[..] else {
                    return self.respond(STATUS_REJECTED, &[]);
                };
                let accepted = u16::from_le_bytes([lo, hi]).min(self.config.max_chunk);
                self.chunk_size = Some(accepted as usize);
                self.respond(STATUS_OK, &accepted.to_le_bytes());
            }
            CMD_ERASE => {
                let (Some(address), Some(len)) = (le_u32(payload), payload.get(4..).and_then(le_u32))
                else {
                    return self.respond(STATUS_REJECTED, &[]);
                };
                let sector = self.config.sector_size.max(1);
                let aligned = address as usize % sector == 0 && len as usize % sector == 0;
                if !aligned || !self.in_bounds(address, len as usize) {
                    log::debug!("mock: bad erase 0x{:08X}+0x{:X}", address, len);
                    return self.respond(STATUS_REJECTED, &[]);
                }
                self.erase(address, len as usize);
                self.start_image();
                self.respond(STATUS_OK, &[]);
            }
            CMD_WRITE => {
                let Some(address) = le_u32(payload) else {
                    return self.respond(STATUS_REJECTED, &[]);
                };
                let data = &payload[4..];
                let too_large = self.chunk_size.is_some_and(|max| data.len() > max);
                if too_large || !self.in_bounds(address, data.len()) {
                    return self.respond(STATUS_REJECTED, &[]);
                }
                if self.reject_chunk(address) {
                    return self.respond(STATUS_CRC_ERROR, &[]);
                }
                self.program(address, data);
                self.chunk_accepted();
                self.respond(STATUS_OK, &[]);
            }
            CMD_VERIFY => {
                if !self.config.verify {
                    return self.respond(STATUS_UNSUPPORTED, &[]);
                }
                let (Some(address), Some(len)) = (le_u32(payload), payload.get(4..).and_then(le_u32))
                else {
                    return self.respond(STATUS_REJECTED, &[]);
                };
                if !self.in_bounds(address, len as usize) {
                    return self.respond(STATUS_REJECTED, &[]);
                }
                let mut crc = crc32(self.contents(address, len as usize));
                if self.faults.corrupt_verify {
                    crc ^= 0xFFFF_FFFF;
                }
                if let Some(token) = &self.faults.cancel_on_verify {
                    log::debug!("mock: cancelling during verify");
                    token.cancel();
                }
                self.respond(STATUS_OK, &crc.to_le_bytes());
            }
            CMD_RESET => {
                log::debug!("mock: reset command");
                self.stats.protocol_resets += 1;
                self.chunk_size = None;
            }
            _ => self.respond(STATUS_UNSUPPORTED, &[]),
        }
    }
}
