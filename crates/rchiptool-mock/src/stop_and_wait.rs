//! Device side of the stop-and-wait protocol

use rchiptool_core::checksum::Sum32;
use rchiptool_core::protocol::wire::stop_and_wait::*;

use crate::{le_u32, MockDevice};

/// Image being received
#[derive(Debug, Default)]
pub(crate) struct State {
    image: Option<Receiving>,
}

#[derive(Debug)]
struct Receiving {
    address: u32,
    len: usize,
    written: usize,
    sum: Sum32,
    last_seq: Option<u8>,
}

/// Frame length by command byte, start byte included
fn frame_len(cmd: u8) -> Option<usize> {
    match cmd {
        CMD_SYNC | CMD_RESET => Some(2),
        CMD_BEGIN => Some(10),
        CMD_DATA => Some(3 + BLOCK_SIZE),
        CMD_END => Some(6),
        _ => None,
    }
}

impl MockDevice {
    pub(crate) fn process_stop_and_wait(&mut self) {
        loop {
            let Some(start) = self.rx.iter().position(|&b| b == FRAME_START) else {
                self.rx.clear();
                return;
            };
            self.rx.drain(..start);

            let Some(&cmd) = self.rx.get(1) else {
                return;
            };
            let Some(len) = frame_len(cmd) else {
                log::debug!("mock: unknown command 0x{:02X}", cmd);
                self.rx.drain(..1);
                continue;
            };
            if self.rx.len() < len {
                return;
            }

            let frame: Vec<u8> = self.rx.drain(..len).collect();
            self.handle_stop_and_wait(cmd, &frame[2..]);
        }
    }

    fn handle_stop_and_wait(&mut self, cmd: u8, body: &[u8]) {
        match cmd {
            CMD_SYNC => {
                if self.probe() {
                    self.reply(&SYNC_REPLY);
                }
            }
            CMD_BEGIN => {
                let (Some(address), Some(len)) = (le_u32(body), le_u32(&body[4..])) else {
                    return self.reply(&[NAK]);
                };
                let len = len as usize;
                if !self.in_bounds(address, len) {
                    return self.reply(&[NAK]);
                }
                self.erase(address, len);
                self.start_image();
                self.state.image = Some(Receiving {
                    address,
                    len,
                    written: 0,
                    sum: Sum32::new(),
                    last_seq: None,
                });
                self.reply(&[ACK]);
            }
            CMD_DATA => self.receive_block(body[0], &body[1..]),
            CMD_END => {
                let declared = le_u32(body);
                let reply = match self.state.image.take() {
                    Some(image)
                        if image.written == image.len && declared == Some(image.sum.value()) =>
                    {
                        ACK
                    }
                    _ => NAK,
                };
                self.reply(&[reply]);
            }
            CMD_RESET => {
                log::debug!("mock: reset command");
                self.stats.protocol_resets += 1;
                self.state = State::default();
            }
            _ => {}
        }
    }

    fn receive_block(&mut self, seq: u8, block: &[u8]) {
        let Some(mut image) = self.state.image.take() else {
            return self.reply(&[NAK]);
        };

        let reply = if image.last_seq == Some(seq) {
            self.stats.duplicates += 1;
            ACK
        } else if self.reject_chunk(u32::from(seq)) {
            NAK
        } else {
            let n = BLOCK_SIZE.min(image.len - image.written);
            let address = image.address + image.written as u32;
            self.program(address, &block[..n]);
            image.sum.update(&block[..n]);
            image.written += n;
            image.last_seq = Some(seq);
            self.chunk_accepted();
            ACK
        };

        self.state.image = Some(image);
        self.reply(&[reply]);
    }
}
