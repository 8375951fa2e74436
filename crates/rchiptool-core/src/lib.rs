//! rchiptool-core - Core library for flashing IoT chip families
//!
//! This crate identifies which chip family a firmware binary targets,
//! bundles firmware into portable multi-image containers and writes them to
//! a device's bootloader over an abstract byte transport.
//!
//! # Overview
//!
//! - [`family`] - registry of chip families (flash geometry, signature rules,
//!   bootloader protocol), loaded from RON
//! - [`container`] - the multi-image container format
//! - [`inspect`](mod@inspect) - family detection and header metadata checks
//! - [`protocol`] - bootloader protocols and the flashing session
//! - [`transport`] - the byte stream the protocols run over
//!
//! # Example
//!
//! ```ignore
//! use rchiptool_core::{flash, CancelToken, Container, FlashOptions, Registry, TransportHandle};
//!
//! let registry = Registry::builtin()?;
//! let container = Container::decode(&std::fs::read("firmware.rct")?)?;
//! let handle = TransportHandle::new("ttyUSB0", transport);
//! let outcome = flash(&registry, &container, &handle, &FlashOptions::default(), &CancelToken::new());
//! println!("{:?}", outcome.into_result()?);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod api;
pub mod checksum;
pub mod container;
pub mod family;
pub mod inspect;
pub mod protocol;
pub mod transport;

pub use api::{flash, flash_with_progress, pack, unpack};
pub use container::{Container, ContainerError, Image};
pub use family::{Family, Registry, RegistryError};
pub use inspect::{inspect, DetectionResult};
pub use protocol::{CancelToken, FlashOptions, FlashOutcome, ProtocolError};
pub use transport::{Transport, TransportError, TransportHandle};
