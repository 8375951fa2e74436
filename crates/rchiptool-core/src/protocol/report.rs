//! Flashing outcomes

use core::fmt;
use std::time::Duration;

use super::error::ProtocolError;

/// What is known about an image's contents on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// The device reported a checksum equal to the image's
    Verified,
    /// Written, but neither checked nor checkable
    Unverified,
    /// The device reported a different checksum
    Failed,
    /// Written; verification was interrupted before reaching this image
    Pending,
}

impl fmt::Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Verified => "verified",
            Self::Unverified => "unverified",
            Self::Failed => "verification failed",
            Self::Pending => "not verified yet",
        })
    }
}

/// Per-image transfer statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    /// Container index
    pub index: usize,
    /// Load address
    pub address: u32,
    /// Payload bytes acknowledged by the device
    pub bytes_sent: usize,
    /// Chunks written
    pub chunks: usize,
    /// Chunk retries spent on this image
    pub retries: u32,
    /// Verification status
    pub verification: Verification,
}

/// Summary of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// Family code flashed
    pub family: u32,
    /// Negotiated chunk size
    pub chunk_size: usize,
    /// Written images, in container order
    pub images: Vec<ImageReport>,
    /// Container indices skipped because they target another family
    pub skipped: Vec<usize>,
    /// Chunk retries over the whole session
    pub total_retries: u32,
    /// Wall-clock duration
    pub elapsed: Duration,
    /// Whether a reset was sent at the end
    pub reset_sent: bool,
}

impl FlashReport {
    /// True if every written image was verified by the device
    pub fn fully_verified(&self) -> bool {
        self.images
            .iter()
            .all(|i| i.verification == Verification::Verified)
    }

    /// Total payload bytes acknowledged
    pub fn bytes_sent(&self) -> usize {
        self.images.iter().map(|i| i.bytes_sent).sum()
    }
}

/// Structured description of a terminal failure
#[derive(Debug)]
pub struct FlashFailure {
    /// The error that ended the session
    pub error: ProtocolError,
    /// Image being processed, if any
    pub image: Option<usize>,
    /// Chunk being processed, if any
    pub chunk: Option<usize>,
    /// Attempts spent on that chunk
    pub attempts: u32,
    /// Images written before the failure that did not fail verification
    pub completed_images: Vec<usize>,
    /// Transfer statistics up to the failure
    pub images: Vec<ImageReport>,
}

impl FlashFailure {
    /// Describe a failure from its error alone
    ///
    /// Image and chunk are taken from the error when it names them.
    pub fn from_error(error: ProtocolError) -> Self {
        let (image, chunk, attempts) = match &error {
            ProtocolError::ChunkRejected {
                image,
                chunk,
                attempts,
                ..
            } => (Some(*image), Some(*chunk), *attempts),
            ProtocolError::Cancelled { image, chunk } => (Some(*image), Some(*chunk), 0),
            ProtocolError::VerifyFailed { image, .. }
            | ProtocolError::BootloaderProtected { image } => (Some(*image), None, 0),
            ProtocolError::SharedSector { second, .. } => (Some(*second), None, 0),
            _ => (None, None, 0),
        };
        Self {
            error,
            image,
            chunk,
            attempts,
            completed_images: Vec::new(),
            images: Vec::new(),
        }
    }
}

impl fmt::Display for FlashFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(image) = self.image {
            write!(f, " [image {}", image)?;
            if let Some(chunk) = self.chunk {
                write!(f, ", chunk {}", chunk)?;
            }
            if self.attempts > 0 {
                write!(f, ", {} attempts", self.attempts)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for FlashFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Result of [`flash`](crate::flash())
#[derive(Debug)]
pub enum FlashOutcome {
    /// Every image for the family was written (and verified if possible)
    Success(FlashReport),
    /// Some images may be usable; the caller can resume from the failure
    PartialFailure {
        /// Images written before the failure that did not fail verification
        completed_images: Vec<usize>,
        /// What went wrong
        failure: FlashFailure,
    },
    /// Nothing useful was done (or the link died)
    Fatal(FlashFailure),
}

impl FlashOutcome {
    /// True for [`FlashOutcome::Success`]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The success report, if any
    pub fn report(&self) -> Option<&FlashReport> {
        match self {
            Self::Success(report) => Some(report),
            _ => None,
        }
    }

    /// The failure, if any
    pub fn failure(&self) -> Option<&FlashFailure> {
        match self {
            Self::Success(_) => None,
            Self::PartialFailure { failure, .. } | Self::Fatal(failure) => Some(failure),
        }
    }

    /// Convert into a `Result`
    pub fn into_result(self) -> Result<FlashReport, FlashFailure> {
        match self {
            Self::Success(report) => Ok(report),
            Self::PartialFailure { failure, .. } | Self::Fatal(failure) => Err(failure),
        }
    }
}
