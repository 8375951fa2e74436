//! DeviceHandle - an opened link to a bootloader
//!
//! The CLI never names a concrete transport type. It opens a handle from a
//! connection string and passes the handle to the flashing operations.

use rchiptool_core::container::Container;
use rchiptool_core::family::Registry;
use rchiptool_core::protocol::{CancelToken, FlashOptions, FlashOutcome, FlashProgress};
use rchiptool_core::transport::{Transport, TransportHandle};

/// A type-erased transport that can move between threads
pub type BoxedTransport = Box<dyn Transport + Send>;

/// Opened link to a device's bootloader
///
/// Wraps the transport in a [`TransportHandle`], so at most one session at
/// a time can drive it even when the handle is shared between threads.
pub struct DeviceHandle {
    handle: TransportHandle<BoxedTransport>,
    /// Family the far end is known to be (mock devices only)
    family_hint: Option<u32>,
}

impl DeviceHandle {
    pub(crate) fn new(name: impl Into<String>, transport: BoxedTransport) -> Self {
        Self {
            handle: TransportHandle::new(name, transport),
            family_hint: None,
        }
    }

    pub(crate) fn with_family_hint(mut self, code: u32) -> Self {
        self.family_hint = Some(code);
        self
    }

    /// Connection string the handle was opened from
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Family code of the device, when the transport knows it up front
    pub fn family_hint(&self) -> Option<u32> {
        self.family_hint
    }

    /// The shared transport, for callers driving a session themselves
    pub fn transport(&self) -> &TransportHandle<BoxedTransport> {
        &self.handle
    }

    /// Flash `container` over this link
    pub fn flash(
        &self,
        registry: &Registry,
        container: &Container,
        options: &FlashOptions,
        cancel: &CancelToken,
        progress: &mut dyn FlashProgress,
    ) -> FlashOutcome {
        log::debug!("Flashing over {}", self.name());
        rchiptool_core::flash_with_progress(
            registry,
            container,
            &self.handle,
            options,
            cancel,
            progress,
        )
    }

    /// Close the link
    pub fn close(self) -> Result<(), Box<dyn std::error::Error>> {
        let name = self.handle.name().to_string();
        let mut transport = self.handle.into_inner();
        transport.close()?;
        log::debug!("Closed {}", name);
        Ok(())
    }
}
