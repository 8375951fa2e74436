//! Transport abstraction
//!
//! A transport is a duplex byte stream to the device's bootloader, usually a
//! serial port. Every blocking call takes an explicit timeout; transports
//! never fall back to platform default timeouts.

use std::io;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

use crate::protocol::ProtocolError;

/// Transport-level error
///
/// Any of these ends a flashing session immediately; the protocol engine
/// never retries them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The device did not accept the data in time
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// The link was closed (port disappeared, peer hung up)
    #[error("transport closed")]
    Closed,
    /// Serial port driver error
    #[error("serial port error: {0}")]
    Serial(String),
}

/// Result type for transport operations
pub type Result<T> = core::result::Result<T, TransportError>;

/// Duplex byte stream with explicit timeouts
pub trait Transport {
    /// Read up to `buf.len()` bytes, waiting up to `timeout`
    ///
    /// Returns the number of bytes read, or 0 if nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `data`, failing with `WriteTimeout` if it is not accepted
    /// within `timeout`
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Largest single write the transport handles, if it is bounded
    fn max_write_len(&self) -> Option<usize> {
        None
    }

    /// Drop any unread input
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Best-effort device reset (e.g. by toggling modem control lines)
    fn reset_device(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the link
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
        (**self).write(data, timeout)
    }

    fn max_write_len(&self) -> Option<usize> {
        (**self).max_write_len()
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn reset_device(&mut self) -> Result<()> {
        (**self).reset_device()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// A transport that can be owned by at most one session at a time
///
/// The handle itself is `Sync` when the transport is `Send`, so it can be
/// shared between threads; a session that finds it already in use fails
/// with [`ProtocolError::TransportBusy`] instead of waiting.
#[derive(Debug)]
pub struct TransportHandle<T> {
    name: String,
    inner: Mutex<T>,
}

impl<T: Transport> TransportHandle<T> {
    /// Wrap an opened transport
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(transport),
        }
    }

    /// Name of the transport, for logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take exclusive ownership of the transport without blocking
    pub fn try_acquire(&self) -> core::result::Result<MutexGuard<'_, T>, ProtocolError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => {
                log::warn!("transport {} is already in use", self.name);
                Err(ProtocolError::TransportBusy)
            }
            // A session that panicked leaves the transport itself usable
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    /// Mutable access when the handle is not shared
    pub fn get_mut(&mut self) -> &mut T {
        match self.inner.get_mut() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Unwrap the transport
    pub fn into_inner(self) -> T {
        match self.inner.into_inner() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;

    impl Transport for Null {
        fn read(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            Ok(0)
        }

        fn write(&mut self, _data: &[u8], _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let handle = TransportHandle::new("null", Null);
        let first = handle.try_acquire().unwrap();
        assert!(matches!(
            handle.try_acquire(),
            Err(ProtocolError::TransportBusy)
        ));
        drop(first);
        assert!(handle.try_acquire().is_ok());
    }

    #[test]
    fn test_boxed_transport() {
        let mut boxed: Box<dyn Transport> = Box::new(Null);
        let mut buf = [0u8; 4];
        assert_eq!(boxed.read(&mut buf, Duration::from_millis(1)).unwrap(), 0);
        assert_eq!(boxed.max_write_len(), None);
    }
}
