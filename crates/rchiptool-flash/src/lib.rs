//! Device links and family database discovery for the rchiptool CLI
//!
//! The CLI only deals with types from this crate and the core library. It
//! never names a concrete transport: connection strings are turned into a
//! [`DeviceHandle`] here.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CLI (rchiptool)                      │
//! │  - Imports rchiptool-flash and rchiptool-core only       │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                rchiptool-flash (this crate)              │
//! │  - open_transport: connection string -> DeviceHandle     │
//! │  - load_registry: family database discovery              │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │    rchiptool-core        │   │  Transport crates        │
//! │  - Registry, Container   │   │  - rchiptool-serial      │
//! │  - Protocol engine       │   │  - rchiptool-mock        │
//! └──────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rchiptool_flash::{load_registry, open_transport};
//!
//! let registry = load_registry(None)?;
//! let handle = open_transport("serial:/dev/ttyUSB0", &registry)?;
//! let outcome = handle.flash(&registry, &container, &options, &cancel, &mut progress);
//! ```

mod database;
mod handle;
mod registry;

pub use database::{default_family_dirs, load_registry, load_registry_from};
pub use handle::{BoxedTransport, DeviceHandle};
pub use registry::{
    available_transports, open_transport, parse_transport_params, transport_names_short,
    TransportInfo, TransportParams,
};
