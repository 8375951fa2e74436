//! rchiptool-serial - Serial port and TCP transports
//!
//! Bootloaders of the supported chips listen on a UART. This crate opens
//! that UART either directly or through a TCP serial bridge (ser2net and
//! friends) and exposes it as a core [`Transport`].
//!
//! # Connection strings
//!
//! - `serial:/dev/ttyUSB0` - serial port at the default 115200 baud
//! - `serial:/dev/ttyUSB0:921600` - serial port at a given baud rate
//! - `tcp:host:port` - TCP serial bridge
//! - `/dev/ttyUSB0` - a bare device path is a serial port
//!
//! # Example
//!
//! ```no_run
//! use rchiptool_serial::open_connection;
//!
//! let transport = open_connection("serial:/dev/ttyUSB0:115200")?;
//! # Ok::<(), rchiptool_serial::SerialError>(())
//! ```

pub mod error;
pub mod transport;

pub use error::{Result, SerialError};
pub use transport::serial::{SerialTransport, DEFAULT_BAUD};
pub use transport::tcp::TcpTransport;

use rchiptool_core::transport::Transport;

/// Where the bootloader's UART is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Serial port connection
    Serial {
        /// Device path (e.g., "/dev/ttyUSB0" or "COM1")
        device: String,
        /// Baud rate (None for the default)
        baud: Option<u32>,
    },
    /// TCP socket connection
    Tcp {
        /// Hostname or IP address
        host: String,
        /// Port number
        port: u16,
    },
}

impl Connection {
    /// Parse a connection string
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(dev) = s.strip_prefix("serial:") {
            if dev.is_empty() {
                return Err(SerialError::InvalidConnection(
                    "missing device after serial:".to_string(),
                ));
            }
            if let Some((device, baud_str)) = dev.rsplit_once(':') {
                let baud = baud_str.parse().map_err(|_| {
                    SerialError::InvalidConnection(format!("Invalid baud rate: {}", baud_str))
                })?;
                Ok(Connection::Serial {
                    device: device.to_string(),
                    baud: Some(baud),
                })
            } else {
                Ok(Connection::Serial {
                    device: dev.to_string(),
                    baud: None,
                })
            }
        } else if let Some(addr) = s.strip_prefix("tcp:") {
            let (host, port_str) = addr.rsplit_once(':').ok_or_else(|| {
                SerialError::InvalidConnection(format!("Missing port in {}", s))
            })?;
            if host.is_empty() {
                return Err(SerialError::InvalidConnection(format!(
                    "Missing host in {}",
                    s
                )));
            }
            let port = port_str.parse().map_err(|_| {
                SerialError::InvalidConnection(format!("Invalid port: {}", port_str))
            })?;
            Ok(Connection::Tcp {
                host: host.to_string(),
                port,
            })
        } else if s.is_empty() || (s.contains(':') && !looks_like_windows_port(s)) {
            Err(SerialError::InvalidConnection(format!(
                "{}. Use serial:<device>[:baud], tcp:<host>:<port> or a device path",
                s
            )))
        } else {
            Ok(Connection::Serial {
                device: s.to_string(),
                baud: None,
            })
        }
    }

    /// Open the link
    pub fn open(&self) -> Result<Box<dyn Transport + Send>> {
        match self {
            Connection::Serial { device, baud } => {
                Ok(Box::new(SerialTransport::open(device, *baud)?))
            }
            Connection::Tcp { host, port } => Ok(Box::new(TcpTransport::connect(host, *port)?)),
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Serial { device, baud: None } => write!(f, "serial:{}", device),
            Connection::Serial {
                device,
                baud: Some(baud),
            } => write!(f, "serial:{}:{}", device, baud),
            Connection::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// `\\.\COM10` style paths carry no colon, but `COM3:` sometimes does
fn looks_like_windows_port(s: &str) -> bool {
    s.strip_suffix(':')
        .and_then(|name| name.strip_prefix("COM"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse a connection string and open it
pub fn open_connection(s: &str) -> Result<Box<dyn Transport + Send>> {
    let conn = Connection::parse(s)?;
    log::debug!("Opening {}", conn);
    conn.open()
}
