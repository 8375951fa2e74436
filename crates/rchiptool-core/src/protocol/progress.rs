//! Progress reporting for flashing sessions

use std::time::Duration;

use super::error::RejectReason;
use crate::family::Family;

/// Progress callback trait for flashing sessions
///
/// Image indices are container indices.
pub trait FlashProgress {
    /// Called before each handshake attempt
    fn handshaking(&mut self, attempt: u32, timeout: Duration);

    /// Called once the bootloader answered and a chunk size was agreed
    fn connected(&mut self, family: &Family, chunk_size: usize);

    /// Called when the transfer of an image starts
    fn image_started(&mut self, image: usize, address: u32, len: usize);

    /// Called after each accepted chunk
    fn chunk_written(&mut self, image: usize, bytes_done: usize, bytes_total: usize);

    /// Called when a chunk is about to be retried
    fn chunk_retry(&mut self, image: usize, chunk: usize, attempt: u32, reason: RejectReason);

    /// Called when an image has been fully transferred
    fn image_finished(&mut self, image: usize);

    /// Called before device-side verification of an image
    fn verifying(&mut self, image: usize);

    /// Called when the session ends
    fn finished(&mut self, success: bool);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn handshaking(&mut self, _attempt: u32, _timeout: Duration) {}
    fn connected(&mut self, _family: &Family, _chunk_size: usize) {}
    fn image_started(&mut self, _image: usize, _address: u32, _len: usize) {}
    fn chunk_written(&mut self, _image: usize, _bytes_done: usize, _bytes_total: usize) {}
    fn chunk_retry(&mut self, _image: usize, _chunk: usize, _attempt: u32, _reason: RejectReason) {}
    fn image_finished(&mut self, _image: usize) {}
    fn verifying(&mut self, _image: usize) {}
    fn finished(&mut self, _success: bool) {}
}
