//! Protocol error types

use core::fmt;

use crate::container::ContainerError;
use crate::transport::TransportError;

/// Why a device did not accept a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Negative acknowledgement
    Nack,
    /// Device reported a checksum error for the chunk
    ChecksumMismatch,
    /// Reply could not be parsed (bad framing or CRC)
    Garbled,
    /// No reply before the acknowledgement timeout
    NoReply,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nack => "NAK",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::Garbled => "garbled reply",
            Self::NoReply => "no reply",
        })
    }
}

/// Session step an error occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Probing for the bootloader
    Handshake,
    /// Agreeing on a chunk size
    Negotiate,
    /// Preparing the device for an image (erase, address setup)
    BeginImage,
    /// Closing an image (end-of-transfer checksum)
    EndImage,
    /// Device-side readback
    Verify,
    /// Reset or boot after flashing
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handshake => "handshake",
            Self::Negotiate => "chunk size negotiation",
            Self::BeginImage => "image setup",
            Self::EndImage => "image end",
            Self::Verify => "verification",
            Self::Finalize => "finalize",
        })
    }
}

/// Flashing protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The bootloader never answered the probe
    #[error("handshake timed out after {attempts} attempts (last timeout {last_timeout_ms} ms)")]
    HandshakeTimeout {
        /// Probes sent
        attempts: u32,
        /// Timeout of the final attempt
        last_timeout_ms: u32,
    },
    /// A chunk was refused on every attempt
    #[error(
        "chunk {chunk} of image {image} (address 0x{address:08X}) rejected after {attempts} attempts: {last}"
    )]
    ChunkRejected {
        /// Image index in the container
        image: usize,
        /// Chunk index within the image
        chunk: usize,
        /// Flash address of the chunk
        address: u32,
        /// Attempts made
        attempts: u32,
        /// Reason for the final rejection
        last: RejectReason,
    },
    /// The device refused a command outside the chunk loop
    #[error("device refused {stage} (status 0x{status:02X})")]
    DeviceNacked {
        /// Step that was refused
        stage: Stage,
        /// Status byte returned
        status: u8,
    },
    /// The device did not answer a command outside the chunk loop
    #[error("no reply from device during {stage}")]
    NoReply {
        /// Step that went unanswered
        stage: Stage,
    },
    /// The device sent something that is not a valid reply
    #[error("unexpected reply from device during {stage}")]
    UnexpectedReply {
        /// Step that got the bad reply
        stage: Stage,
    },
    /// The operation was cancelled
    #[error("cancelled before chunk {chunk} of image {image}")]
    Cancelled {
        /// Image being written (or verified) when cancellation was seen
        image: usize,
        /// Next chunk that would have been written
        chunk: usize,
    },
    /// Another session owns the transport
    #[error("transport is in use by another session")]
    TransportBusy,
    /// Transport I/O failed
    #[error("transport error: {0}")]
    TransportIo(#[from] TransportError),
    /// Device-side readback does not match the image
    #[error("verification of image {image} failed: expected 0x{expected:08X}, device reports 0x{actual:08X}")]
    VerifyFailed {
        /// Image index
        image: usize,
        /// Checksum of the image payload
        expected: u32,
        /// Checksum reported by the device
        actual: u32,
    },
    /// The negotiated chunk size is too small for the protocol
    #[error("chunk size {size} is below the protocol minimum of {minimum}")]
    ChunkSizeUnsupported {
        /// Proposed size
        size: usize,
        /// Smallest size the protocol can use
        minimum: usize,
    },
    /// An image would overwrite the bootloader
    #[error("image {image} overlaps the bootloader region")]
    BootloaderProtected {
        /// Image index
        image: usize,
    },
    /// Two images share a sector on a device that erases on every image start
    #[error("images {first} and {second} share the flash sector at 0x{sector:08X}")]
    SharedSector {
        /// Image written first
        first: usize,
        /// Image whose erase would wipe part of `first`
        second: usize,
        /// Start of the shared sector
        sector: u64,
    },
    /// The target family is not in the registry
    #[error("unknown family 0x{0:08X}")]
    UnknownFamily(u32),
    /// The container has no images for the target family
    #[error("container has no images for family 0x{0:08X}")]
    NoImages(u32),
    /// The container failed validation
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

impl ProtocolError {
    /// True for errors that end a session without any image being written
    /// or that make further transfers pointless
    ///
    /// Any device error during the handshake or chunk size negotiation is
    /// fatal: nothing can have been written yet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout { .. }
                | Self::DeviceNacked {
                    stage: Stage::Handshake | Stage::Negotiate,
                    ..
                }
                | Self::NoReply {
                    stage: Stage::Handshake | Stage::Negotiate,
                }
                | Self::UnexpectedReply {
                    stage: Stage::Handshake | Stage::Negotiate,
                }
                | Self::TransportBusy
                | Self::TransportIo(_)
                | Self::ChunkSizeUnsupported { .. }
                | Self::BootloaderProtected { .. }
                | Self::SharedSector { .. }
                | Self::UnknownFamily(_)
                | Self::NoImages(_)
                | Self::Container(_)
        )
    }
}

/// Result type for protocol operations
pub type Result<T> = core::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_errors_are_fatal() {
        for stage in [Stage::Handshake, Stage::Negotiate] {
            assert!(ProtocolError::DeviceNacked { stage, status: 2 }.is_fatal());
            assert!(ProtocolError::NoReply { stage }.is_fatal());
            assert!(ProtocolError::UnexpectedReply { stage }.is_fatal());
        }
        for stage in [Stage::BeginImage, Stage::EndImage, Stage::Verify] {
            assert!(!ProtocolError::DeviceNacked { stage, status: 2 }.is_fatal());
            assert!(!ProtocolError::NoReply { stage }.is_fatal());
        }
        assert!(!ProtocolError::Cancelled { image: 0, chunk: 0 }.is_fatal());
    }
}
