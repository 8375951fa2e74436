//! Timed byte I/O over a transport
//!
//! A transport read that returns 0 bytes has already waited out its timeout,
//! so every helper here treats it as the end of the wait. Partial reads keep
//! waiting for whatever is left of the deadline.

use std::time::{Duration, Instant};

use super::error::Result;
use crate::transport::Transport;

/// A transport together with the session's timeouts
pub struct Link<'a> {
    transport: &'a mut dyn Transport,
    write_timeout: Duration,
    reply_timeout: Duration,
}

impl<'a> Link<'a> {
    /// Wrap a transport
    pub fn new(
        transport: &'a mut dyn Transport,
        write_timeout: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            write_timeout,
            reply_timeout,
        }
    }

    /// Default time to wait for a reply
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Largest single write the transport handles, if bounded
    pub fn max_write_len(&self) -> Option<usize> {
        self.transport.max_write_len()
    }

    /// Write a whole frame
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("link: tx {:02X?}", data);
        self.transport.write(data, self.write_timeout)?;
        Ok(())
    }

    /// Fill `buf` completely, waiting at most `timeout` in total
    ///
    /// Returns `false` if the deadline passed first.
    pub fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let n = self.transport.read(&mut buf[filled..], remaining)?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }

        log::trace!("link: rx {:02X?}", buf);
        Ok(true)
    }

    /// Read a single byte
    pub fn recv_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let mut byte = [0u8];
        Ok(self.recv_exact(&mut byte, timeout)?.then_some(byte[0]))
    }

    /// Read until `signature` shows up in the stream
    ///
    /// Bytes before the signature are discarded. Returns `false` if the
    /// deadline passed first.
    pub fn wait_for(&mut self, signature: &[u8], timeout: Duration) -> Result<bool> {
        if signature.is_empty() {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let mut window: Vec<u8> = Vec::with_capacity(signature.len());
        let mut byte = [0u8];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            if self.transport.read(&mut byte, remaining)? == 0 {
                return Ok(false);
            }

            if window.len() == signature.len() {
                window.remove(0);
            }
            window.push(byte[0]);
            if window == signature {
                return Ok(true);
            }
        }
    }

    /// Drop any unread input
    pub fn discard_input(&mut self) -> Result<()> {
        self.transport.discard_input()?;
        Ok(())
    }

    /// Ask the transport to reset the device out of band
    pub fn reset_device(&mut self) -> Result<()> {
        log::debug!("link: resetting device");
        self.transport.reset_device()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Result as TransportResult;
    use std::collections::VecDeque;

    /// Hands out queued input, a few bytes per read
    struct Trickle {
        input: VecDeque<u8>,
        per_read: usize,
        sent: Vec<u8>,
    }

    impl Transport for Trickle {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
            let n = buf.len().min(self.per_read).min(self.input.len());
            for slot in &mut buf[..n] {
                *slot = self.input.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> TransportResult<()> {
            self.sent.extend_from_slice(data);
            Ok(())
        }

        fn discard_input(&mut self) -> TransportResult<()> {
            self.input.clear();
            Ok(())
        }
    }

    fn trickle(input: &[u8]) -> Trickle {
        Trickle {
            input: input.iter().copied().collect(),
            per_read: 2,
            sent: Vec::new(),
        }
    }

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_recv_exact_across_reads() {
        let mut transport = trickle(&[1, 2, 3, 4, 5]);
        let mut link = Link::new(&mut transport, T, T);
        let mut buf = [0u8; 5];
        assert!(link.recv_exact(&mut buf, T).unwrap());
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        assert!(!link.recv_exact(&mut buf[..1], T).unwrap());
    }

    #[test]
    fn test_wait_for_skips_noise() {
        let mut transport = trickle(&[0x00, 0x7E, 0x7E, 0x4F, 0x4B, 0x99]);
        let mut link = Link::new(&mut transport, T, T);
        assert!(link.wait_for(&[0x7E, 0x4F, 0x4B], T).unwrap());
        assert_eq!(link.recv_byte(T).unwrap(), Some(0x99));
        assert!(!link.wait_for(&[0x7E], T).unwrap());
    }

    #[test]
    fn test_send_and_discard() {
        let mut transport = trickle(&[1, 2, 3]);
        {
            let mut link = Link::new(&mut transport, T, T);
            link.send(&[0xAA, 0xBB]).unwrap();
            link.discard_input().unwrap();
            assert_eq!(link.recv_byte(T).unwrap(), None);
        }
        assert_eq!(transport.sent, [0xAA, 0xBB]);
    }
}
