//! Serial port and TCP transports
//!
//! Both implement the core [`Transport`] trait: every read and write takes
//! the caller's timeout, a read timeout yields 0 bytes, and a peer that goes
//! away is reported as [`TransportError::Closed`].

use std::io::ErrorKind;

use rchiptool_core::transport::{Result, Transport, TransportError};

/// Map an I/O error from a write, where timeouts have their own variant
fn write_error(e: std::io::Error, timeout: std::time::Duration) -> TransportError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::WriteTimeout(timeout),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected => {
            TransportError::Closed
        }
        _ => TransportError::Io(e),
    }
}

pub mod serial {
    //! Serial port transport implementation

    use super::*;
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
    use std::io::{Read, Write};
    use std::time::Duration;

    use crate::error::Result as OpenResult;

    /// Default baud rate of the supported bootloaders
    pub const DEFAULT_BAUD: u32 = 115_200;

    /// How long the reset line is held
    const RESET_PULSE: Duration = Duration::from_millis(100);

    fn serial_error(e: serialport::Error) -> TransportError {
        TransportError::Serial(e.to_string())
    }

    /// Serial port transport
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
        timeout: Duration,
    }

    impl SerialTransport {
        /// Open a serial port at `baud` (default 115200), 8N1, no flow control
        pub fn open(device: &str, baud: Option<u32>) -> OpenResult<Self> {
            let baud_rate = baud.unwrap_or(DEFAULT_BAUD);
            let timeout = Duration::from_secs(1);

            let port = serialport::new(device, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .timeout(timeout)
                .open()?;

            log::info!("Opened serial port {} at {} baud", device, baud_rate);

            Ok(Self { port, timeout })
        }

        /// Baud rate the port is running at
        pub fn baud_rate(&self) -> Result<u32> {
            self.port.baud_rate().map_err(serial_error)
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            if timeout != self.timeout {
                self.port.set_timeout(timeout).map_err(serial_error)?;
                self.timeout = timeout;
            }
            Ok(())
        }
    }

    impl Transport for SerialTransport {
        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.set_timeout(timeout)?;
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    Ok(0)
                }
                Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(TransportError::Closed),
                Err(e) => Err(TransportError::Io(e)),
            }
        }

        fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
            self.set_timeout(timeout)?;
            self.port
                .write_all(data)
                .and_then(|()| self.port.flush())
                .map_err(|e| write_error(e, timeout))
        }

        fn discard_input(&mut self) -> Result<()> {
            self.port.clear(ClearBuffer::Input).map_err(serial_error)
        }

        /// Pulse RTS (wired to the chip's reset on common adapters) with
        /// DTR released so the chip boots normally
        fn reset_device(&mut self) -> Result<()> {
            log::debug!("serial: pulsing RTS to reset the device");
            self.port
                .write_data_terminal_ready(false)
                .map_err(serial_error)?;
            self.port.write_request_to_send(true).map_err(serial_error)?;
            std::thread::sleep(RESET_PULSE);
            self.port
                .write_request_to_send(false)
                .map_err(serial_error)
        }

        fn close(&mut self) -> Result<()> {
            self.port.flush()?;
            Ok(())
        }
    }
}

pub mod tcp {
    //! TCP socket transport implementation, for ser2net-style bridges

    use super::*;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::time::Duration;

    use crate::error::{Result as OpenResult, SerialError};

    /// Socket timeouts cannot be zero
    const MIN_TIMEOUT: Duration = Duration::from_millis(1);

    /// TCP socket transport
    pub struct TcpTransport {
        stream: TcpStream,
    }

    impl TcpTransport {
        /// Connect to a serial bridge at the specified host and port
        pub fn connect(host: &str, port: u16) -> OpenResult<Self> {
            let addr = format!("{}:{}", host, port);
            log::info!("Connecting to serial bridge at {}", addr);

            let stream = TcpStream::connect(&addr)
                .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", addr, e)))?;
            Self::from_stream(stream)
        }

        /// Wrap an already connected stream
        pub fn from_stream(stream: TcpStream) -> OpenResult<Self> {
            // Set TCP_NODELAY to reduce latency
            stream.set_nodelay(true).map_err(|e| {
                SerialError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
            })?;
            Ok(Self { stream })
        }
    }

    impl Transport for TcpTransport {
        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
            self.stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
            match self.stream.read(buf) {
                // A zero-length read on a socket is end of stream
                Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
                Ok(n) => Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    Ok(0)
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset => Err(TransportError::Closed),
                Err(e) => Err(TransportError::Io(e)),
            }
        }

        fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()> {
            self.stream
                .set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
            self.stream
                .write_all(data)
                .map_err(|e| write_error(e, timeout))
        }

        fn discard_input(&mut self) -> Result<()> {
            self.stream.set_nonblocking(true)?;
            let mut scratch = [0u8; 256];
            let result = loop {
                match self.stream.read(&mut scratch) {
                    Ok(0) => break Err(TransportError::Closed),
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(e) => break Err(TransportError::Io(e)),
                }
            };
            self.stream.set_nonblocking(false)?;
            result
        }

        fn close(&mut self) -> Result<()> {
            match self.stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != ErrorKind::NotConnected => Err(TransportError::Io(e)),
                _ => Ok(()),
            }
        }
    }

}
