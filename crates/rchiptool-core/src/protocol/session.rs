//! Flashing session state machine
//!
//! ```text
//! Idle -> Handshaking -> { Negotiated | Failed }
//! Negotiated -> Transferring -> { Verifying | Failed }
//! Verifying -> { Done | Failed }
//! ```
//!
//! A session owns its transport for its whole lifetime. Steps run strictly
//! in order: handshake, every image's chunks, then verification of every
//! written image. A rejected chunk is retried on its own; the image is never
//! restarted. Cancellation is only observed between chunks, before each
//! verification and once all images are verified, so a chunk is never
//! abandoned half-written. The final reset is not cancellable: by then every
//! image is written and checked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

use super::error::{ProtocolError, Result};
use super::link::Link;
use super::options::FlashOptions;
use super::progress::FlashProgress;
use super::report::{FlashFailure, FlashOutcome, FlashReport, ImageReport, Verification};
use super::{Capabilities, ChunkStatus, FlashProtocol, Variant};
use crate::container::{Container, Image};
use crate::family::Family;
use crate::transport::{Transport, TransportHandle};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, nothing sent yet
    Idle,
    /// Probing for the bootloader
    Handshaking,
    /// Bootloader answered and a chunk size was agreed
    Negotiated,
    /// Writing images
    Transferring,
    /// Checking written images
    Verifying,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
}

impl SessionState {
    /// Check whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Handshaking)
                | (Handshaking, Negotiated)
                | (Handshaking, Failed)
                | (Negotiated, Transferring)
                | (Transferring, Verifying)
                | (Transferring, Failed)
                | (Verifying, Done)
                | (Verifying, Failed)
        )
    }

    /// True for `Done` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

/// Cooperative cancellation signal
///
/// Clones share the same flag, so one clone can be handed to another thread
/// (or a signal handler) while the session polls the other.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where the session currently is, for failure reports
#[derive(Debug, Clone, Copy, Default)]
struct Position {
    image: Option<usize>,
    chunk: Option<usize>,
    attempts: u32,
}

/// One flashing attempt of one family's images over one transport
pub struct Session<'a, T: Transport> {
    transport: MutexGuard<'a, T>,
    engine: Engine<'a>,
}

impl<'a, T: Transport> Session<'a, T> {
    /// Start a session, taking exclusive ownership of the transport
    ///
    /// Fails immediately with [`ProtocolError::TransportBusy`] if another
    /// session holds it.
    pub fn new(
        family: &'a Family,
        handle: &'a TransportHandle<T>,
        options: FlashOptions,
        cancel: CancelToken,
    ) -> Result<Self> {
        let transport = handle.try_acquire()?;
        log::debug!(
            "session: {} on {} using {}",
            family,
            handle.name(),
            family.protocol
        );
        Ok(Self {
            transport,
            engine: Engine {
                family,
                variant: Variant::for_kind(family.protocol),
                options,
                cancel,
                state: SessionState::Idle,
                chunk_size: 0,
                bytes_sent: 0,
                retry_count: 0,
                position: Position::default(),
                reports: Vec::new(),
                written: Vec::new(),
            },
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.engine.state
    }

    /// Family being flashed
    pub fn family(&self) -> &Family {
        self.engine.family
    }

    /// Flash every image of the session's family in `container`
    ///
    /// Images of other families are skipped and listed in the report. The
    /// session is consumed; the transport is released when this returns.
    pub fn run(mut self, container: &Container, progress: &mut dyn FlashProgress) -> FlashOutcome {
        let options = &self.engine.options;
        let (write_timeout, ack_timeout) = (options.write_timeout(), options.ack_timeout());
        let transport: &mut T = &mut self.transport;
        let mut link = Link::new(transport, write_timeout, ack_timeout);
        self.engine.run(&mut link, container, progress)
    }
}

/// Session state that is not the transport
struct Engine<'a> {
    family: &'a Family,
    variant: Variant,
    options: FlashOptions,
    cancel: CancelToken,
    state: SessionState,
    chunk_size: usize,
    bytes_sent: u64,
    retry_count: u32,
    position: Position,
    reports: Vec<ImageReport>,
    written: Vec<usize>,
}

impl<'a> Engine<'a> {
    fn set_state(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        log::trace!("session: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn run(
        &mut self,
        link: &mut Link<'_>,
        container: &Container,
        progress: &mut dyn FlashProgress,
    ) -> FlashOutcome {
        let started = Instant::now();
        let code = self.family.code;
        let images: Vec<(usize, &Image)> = container.images_for_family(code).collect();
        let skipped: Vec<usize> = container
            .images()
            .iter()
            .enumerate()
            .filter(|(_, image)| image.family_code() != code)
            .map(|(i, _)| i)
            .collect();
        for &i in &skipped {
            log::info!("session: skipping image {} (targets another family)", i);
        }

        match self.execute(link, &images, progress) {
            Ok(()) => {
                let reset_sent = self.finish(link);
                progress.finished(true);
                log::info!(
                    "session: flashed {} images ({} bytes, {} retries) in {:.2?}",
                    self.reports.len(),
                    self.bytes_sent,
                    self.retry_count,
                    started.elapsed()
                );
                FlashOutcome::Success(FlashReport {
                    family: code,
                    chunk_size: self.chunk_size,
                    images: core::mem::take(&mut self.reports),
                    skipped,
                    total_retries: self.retry_count,
                    elapsed: started.elapsed(),
                    reset_sent,
                })
            }
            Err(error) => {
                let connected = !matches!(
                    self.state,
                    SessionState::Idle | SessionState::Handshaking
                );
                self.set_state(SessionState::Failed);
                log::error!("session: {}", error);

                if matches!(error, ProtocolError::Cancelled { .. }) {
                    if let Err(e) = link.reset_device() {
                        log::warn!("session: device reset after cancellation failed: {}", e);
                    }
                }
                progress.finished(false);

                let failure = self.failure(error);
                if failure.error.is_fatal() || !connected {
                    FlashOutcome::Fatal(failure)
                } else {
                    FlashOutcome::PartialFailure {
                        completed_images: failure.completed_images.clone(),
                        failure,
                    }
                }
            }
        }
    }

    fn execute(
        &mut self,
        link: &mut Link<'_>,
        images: &[(usize, &Image)],
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        self.connect(link, progress)?;

        self.set_state(SessionState::Transferring);
        for &(index, image) in images {
            self.transfer_image(link, index, image, progress)?;
        }

        self.set_state(SessionState::Verifying);
        self.verify_all(link, images, progress)?;

        self.set_state(SessionState::Done);
        Ok(())
    }

    fn connect(&mut self, link: &mut Link<'_>, progress: &mut dyn FlashProgress) -> Result<()> {
        self.set_state(SessionState::Handshaking);

        let schedule = self.options.handshake_schedule();
        let mut connected = false;
        for (i, &timeout) in schedule.iter().enumerate() {
            let attempt = i as u32 + 1;
            log::debug!(
                "session: handshake attempt {}/{} ({} ms)",
                attempt,
                schedule.len(),
                timeout.as_millis()
            );
            progress.handshaking(attempt, timeout);
            if self.variant.handshake(link, timeout)? {
                connected = true;
                break;
            }
            link.discard_input()?;
        }
        if !connected {
            return Err(ProtocolError::HandshakeTimeout {
                attempts: schedule.len() as u32,
                last_timeout_ms: schedule.last().map_or(0, |t| t.as_millis() as u32),
            });
        }

        let proposed = [
            Some(self.variant.max_chunk_size()),
            link
                .max_write_len()
                .map(|max| max.saturating_sub(self.variant.frame_overhead())),
            self.options.chunk_size_override.map(|s| s as usize),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or_else(|| self.variant.max_chunk_size());

        let minimum = self.variant.min_chunk_size();
        if proposed < minimum {
            return Err(ProtocolError::ChunkSizeUnsupported {
                size: proposed,
                minimum,
            });
        }

        self.chunk_size = self.variant.negotiate_chunk_size(link, proposed)?;
        self.set_state(SessionState::Negotiated);
        log::info!(
            "session: connected to {} ({}), chunk size {}",
            self.family,
            self.variant.name(),
            self.chunk_size
        );
        progress.connected(self.family, self.chunk_size);
        Ok(())
    }

    fn transfer_image(
        &mut self,
        link: &mut Link<'_>,
        index: usize,
        image: &Image,
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        self.position = Position {
            image: Some(index),
            ..Default::default()
        };
        log::debug!(
            "session: image {} -> 0x{:08X} ({} bytes)",
            index,
            image.load_address(),
            image.len()
        );
        progress.image_started(index, image.load_address(), image.len());

        let slot = self.reports.len();
        self.reports.push(ImageReport {
            index,
            address: image.load_address(),
            bytes_sent: 0,
            chunks: 0,
            retries: 0,
            verification: Verification::Pending,
        });

        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled {
                image: index,
                chunk: 0,
            });
        }
        self.variant.begin_image(link, image, &self.family.geometry)?;

        for (chunk, data) in image.payload().chunks(self.chunk_size).enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("session: cancelled before chunk {} of image {}", chunk, index);
                return Err(ProtocolError::Cancelled {
                    image: index,
                    chunk,
                });
            }

            // Image bounds were checked against the 32-bit address space
            let address = image.load_address() + (chunk * self.chunk_size) as u32;
            self.position.chunk = Some(chunk);
            self.write_with_retry(link, slot, chunk, address, data, progress)?;

            self.bytes_sent += data.len() as u64;
            let report = &mut self.reports[slot];
            report.bytes_sent += data.len();
            report.chunks += 1;
            progress.chunk_written(index, report.bytes_sent, image.len());
        }

        self.variant.end_image(link, image)?;
        self.position.chunk = None;
        self.written.push(index);
        progress.image_finished(index);
        Ok(())
    }

    fn write_with_retry(
        &mut self,
        link: &mut Link<'_>,
        slot: usize,
        chunk: usize,
        address: u32,
        data: &[u8],
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let image = self.reports[slot].index;
        let max_attempts = self.options.attempts_per_chunk();
        let mut attempt = 1;

        loop {
            self.position.attempts = attempt;
            let reason = match self.variant.write_chunk(link, chunk, address, data)? {
                ChunkStatus::Accepted => return Ok(()),
                ChunkStatus::Rejected(reason) => reason,
            };

            if attempt >= max_attempts {
                return Err(ProtocolError::ChunkRejected {
                    image,
                    chunk,
                    address,
                    attempts: attempt,
                    last: reason,
                });
            }

            log::warn!(
                "session: chunk {} of image {} at 0x{:08X}: {}, retrying ({}/{})",
                chunk,
                image,
                address,
                reason,
                attempt,
                max_attempts
            );
            progress.chunk_retry(image, chunk, attempt, reason);
            self.retry_count += 1;
            self.reports[slot].retries += 1;
            link.discard_input()?;
            attempt += 1;
        }
    }

    fn verify_all(
        &mut self,
        link: &mut Link<'_>,
        images: &[(usize, &Image)],
        progress: &mut dyn FlashProgress,
    ) -> Result<()> {
        let device_verify = self.options.verify
            && self.variant.capabilities().contains(Capabilities::VERIFY);
        if !device_verify {
            log::info!(
                "session: {} images written without device verification",
                images.len()
            );
        }

        let mut first_failure = None;
        for (slot, &(index, image)) in images.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ProtocolError::Cancelled {
                    image: index,
                    chunk: self.reports[slot].chunks,
                });
            }
            if !device_verify {
                self.reports[slot].verification = Verification::Unverified;
                continue;
            }

            self.position = Position {
                image: Some(index),
                ..Default::default()
            };
            progress.verifying(index);

            let expected = image.checksum();
            self.reports[slot].verification = match self.variant.verify(link, image)? {
                None => Verification::Unverified,
                Some(actual) if actual == expected => {
                    log::debug!("session: image {} verified (0x{:08X})", index, actual);
                    Verification::Verified
                }
                Some(actual) => {
                    log::error!(
                        "session: image {} verification failed: expected 0x{:08X}, got 0x{:08X}",
                        index,
                        expected,
                        actual
                    );
                    first_failure.get_or_insert(ProtocolError::VerifyFailed {
                        image: index,
                        expected,
                        actual,
                    });
                    Verification::Failed
                }
            };
        }

        if let Some(error) = first_failure {
            return Err(error);
        }

        // A cancel that arrived during the last readback
        match images.last() {
            Some(&(index, _)) if self.cancel.is_cancelled() => Err(ProtocolError::Cancelled {
                image: index,
                chunk: self.reports[images.len() - 1].chunks,
            }),
            _ => Ok(()),
        }
    }

    /// Leave the bootloader; failures here do not undo a successful flash
    fn finish(&mut self, link: &mut Link<'_>) -> bool {
        if !self.options.reset_after
            || !self.variant.capabilities().contains(Capabilities::RESET)
        {
            return false;
        }
        match self.variant.finalize(link) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("session: reset after flashing failed: {}", e);
                false
            }
        }
    }

    fn failure(&mut self, error: ProtocolError) -> FlashFailure {
        let mut failure = FlashFailure::from_error(error);
        if failure.image.is_none() {
            failure.image = self.position.image;
            failure.chunk = self.position.chunk;
            failure.attempts = self.position.attempts;
        }

        let failed: Vec<usize> = self
            .reports
            .iter()
            .filter(|r| r.verification == Verification::Failed)
            .map(|r| r.index)
            .collect();
        failure.completed_images = self
            .written
            .iter()
            .copied()
            .filter(|i| !failed.contains(i))
            .collect();
        failure.images = core::mem::take(&mut self.reports);
        failure
    }
}
