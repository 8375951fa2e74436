//! End-to-end flashing against the emulated bootloaders

use std::time::Duration;

use rchiptool_core::container::{Container, Image};
use rchiptool_core::family::{Family, Registry};
use rchiptool_core::protocol::{
    CancelToken, FlashOptions, FlashOutcome, FlashProgress, ProtocolError, RejectReason,
    Verification,
};
use rchiptool_core::transport::{TransportError, TransportHandle};
use rchiptool_core::{flash, flash_with_progress};
use rchiptool_mock::{FaultPlan, MockConfig, MockDevice};

const RTL8710B: u32 = 0x22E0_D6FC;
const BK7231N: u32 = 0x7B3E_F230;

fn registry() -> Registry {
    Registry::builtin().unwrap()
}

fn family(registry: &Registry, code: u32) -> &Family {
    registry.lookup(code).unwrap()
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

fn device(registry: &Registry, code: u32, faults: FaultPlan) -> TransportHandle<MockDevice> {
    let config = MockConfig::for_family(family(registry, code));
    TransportHandle::new("mock", MockDevice::with_faults(config, faults))
}

/// 3000 bytes at 0x10000: three 1 KiB chunks
fn realtek_image() -> Image {
    Image::new(RTL8710B, 0x10000, payload(3000, 0x5A))
}

/// 40 bytes right after the 68 KiB bootloader: three 16-byte blocks
fn beken_image() -> Image {
    Image::new(BK7231N, 0x11000, payload(40, 0xA5))
}

#[derive(Default)]
struct Recorder {
    handshakes: Vec<Duration>,
    retries: Vec<(usize, usize, u32, RejectReason)>,
    chunks: usize,
    verified: Vec<usize>,
    finished: Option<bool>,
}

impl FlashProgress for Recorder {
    fn handshaking(&mut self, _attempt: u32, timeout: Duration) {
        self.handshakes.push(timeout);
    }
    fn connected(&mut self, _family: &Family, _chunk_size: usize) {}
    fn image_started(&mut self, _image: usize, _address: u32, _len: usize) {}
    fn chunk_written(&mut self, _image: usize, _bytes_done: usize, _bytes_total: usize) {
        self.chunks += 1;
    }
    fn chunk_retry(&mut self, image: usize, chunk: usize, attempt: u32, reason: RejectReason) {
        self.retries.push((image, chunk, attempt, reason));
    }
    fn image_finished(&mut self, _image: usize) {}
    fn verifying(&mut self, image: usize) {
        self.verified.push(image);
    }
    fn finished(&mut self, success: bool) {
        self.finished = Some(success);
    }
}

#[test]
fn test_chunked_crc_success_verified() {
    let registry = registry();
    let handle = device(&registry, RTL8710B, FaultPlan::default());
    let image = realtek_image();
    let container = Container::new(vec![image.clone()]);
    let mut progress = Recorder::default();

    let outcome = flash_with_progress(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut progress,
    );
    let report = outcome.into_result().unwrap();
    assert_eq!(report.family, RTL8710B);
    assert_eq!(report.chunk_size, 1024);
    assert_eq!(report.images.len(), 1);
    assert_eq!(report.images[0].chunks, 3);
    assert_eq!(report.bytes_sent(), 3000);
    assert!(report.fully_verified());
    assert!(report.reset_sent);
    assert_eq!(progress.chunks, 3);
    assert_eq!(progress.verified, [0]);
    assert_eq!(progress.finished, Some(true));

    let device = handle.into_inner();
    assert_eq!(device.contents(0x10000, 3000), image.payload());
    assert_eq!(device.stats().protocol_resets, 1);
}

#[test]
fn test_stop_and_wait_reports_unverified() {
    let registry = registry();
    let handle = device(&registry, BK7231N, FaultPlan::default());
    let image = beken_image();
    let container = Container::new(vec![image.clone()]);

    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert_eq!(report.chunk_size, 16);
    assert_eq!(report.images[0].chunks, 3);
    assert_eq!(report.images[0].verification, Verification::Unverified);
    assert!(!report.fully_verified());

    let device = handle.into_inner();
    assert_eq!(device.contents(0x11000, 40), image.payload());
    // The padding of the last block is not written
    assert_eq!(device.contents(0x11028, 8), &[0xFF; 8]);
}

#[test]
fn test_retry_bound_chunked_crc() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let faults = FaultPlan {
        reject_first_attempts: 2,
        ..Default::default()
    };

    // Three attempts per chunk absorb two rejections
    let handle = device(&registry, RTL8710B, faults.clone());
    let mut progress = Recorder::default();
    let options = FlashOptions {
        max_retries: 3,
        ..Default::default()
    };
    let outcome = flash_with_progress(
        &registry,
        &container,
        &handle,
        &options,
        &CancelToken::new(),
        &mut progress,
    );
    let report = outcome.into_result().unwrap();
    assert_eq!(report.total_retries, 6);
    assert_eq!(report.images[0].retries, 6);
    assert_eq!(progress.retries.len(), 6);
    assert_eq!(
        progress.retries[0],
        (0, 0, 1, RejectReason::ChecksumMismatch)
    );
    assert_eq!(handle.into_inner().stats().chunks_rejected, 6);

    // Two attempts do not
    let handle = device(&registry, RTL8710B, faults);
    let options = FlashOptions {
        max_retries: 2,
        ..Default::default()
    };
    let outcome = flash(&registry, &container, &handle, &options, &CancelToken::new());
    let FlashOutcome::PartialFailure {
        completed_images,
        failure,
    } = outcome
    else {
        panic!("expected a partial failure, got {:?}", outcome);
    };
    assert!(completed_images.is_empty());
    assert!(matches!(
        failure.error,
        ProtocolError::ChunkRejected {
            image: 0,
            chunk: 0,
            address: 0x10000,
            attempts: 2,
            last: RejectReason::ChecksumMismatch,
        }
    ));
    assert_eq!((failure.image, failure.chunk, failure.attempts), (Some(0), Some(0), 2));
}

#[test]
fn test_retry_bound_stop_and_wait() {
    let registry = registry();
    let container = Container::new(vec![beken_image()]);
    let faults = FaultPlan {
        reject_first_attempts: 2,
        ..Default::default()
    };

    let handle = device(&registry, BK7231N, faults.clone());
    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    assert!(outcome.is_success());
    assert_eq!(
        handle.into_inner().contents(0x11000, 40),
        beken_image().payload()
    );

    let handle = device(&registry, BK7231N, faults);
    let options = FlashOptions {
        max_retries: 1,
        ..Default::default()
    };
    let outcome = flash(&registry, &container, &handle, &options, &CancelToken::new());
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(ProtocolError::ChunkRejected {
            image: 0,
            chunk: 0,
            attempts: 1,
            last: RejectReason::Nack,
            ..
        })
    ));
}

#[test]
fn test_handshake_timeout_doubles() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let handle = device(&registry, RTL8710B, FaultPlan::silent());
    let mut progress = Recorder::default();

    let outcome = flash_with_progress(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut progress,
    );
    let FlashOutcome::Fatal(failure) = outcome else {
        panic!("expected a fatal outcome, got {:?}", outcome);
    };
    assert!(matches!(
        failure.error,
        ProtocolError::HandshakeTimeout {
            attempts: 3,
            last_timeout_ms: 1200
        }
    ));
    assert_eq!(
        progress.handshakes,
        [300, 600, 1200].map(Duration::from_millis)
    );
    assert_eq!(progress.finished, Some(false));
    assert_eq!(handle.into_inner().stats().probes, 3);
}

#[test]
fn test_handshake_retry_then_connect() {
    let registry = registry();
    let container = Container::new(vec![beken_image()]);
    let faults = FaultPlan {
        ignore_probes: 2,
        ..Default::default()
    };
    let handle = device(&registry, BK7231N, faults);
    let mut progress = Recorder::default();

    let outcome = flash_with_progress(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut progress,
    );
    assert!(outcome.is_success());
    assert_eq!(progress.handshakes.len(), 3);
}

#[test]
fn test_cancel_between_chunks() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let cancel = CancelToken::new();
    let faults = FaultPlan {
        cancel_after_chunks: Some((2, cancel.clone())),
        ..Default::default()
    };
    let handle = device(&registry, RTL8710B, faults);

    let outcome = flash(&registry, &container, &handle, &FlashOptions::default(), &cancel);
    assert!(!outcome.is_success());
    let failure = outcome.failure().unwrap();
    assert!(matches!(
        failure.error,
        ProtocolError::Cancelled { image: 0, chunk: 2 }
    ));
    assert!(failure.completed_images.is_empty());

    let device = handle.into_inner();
    assert_eq!(device.stats().chunks_accepted, 2);
    assert_eq!(device.stats().line_resets, 1);
}

#[test]
fn test_cancel_during_last_chunk_is_not_success() {
    let registry = registry();
    let container = Container::new(vec![beken_image()]);
    let cancel = CancelToken::new();
    let faults = FaultPlan {
        cancel_after_chunks: Some((3, cancel.clone())),
        ..Default::default()
    };
    let handle = device(&registry, BK7231N, faults);

    let outcome = flash(&registry, &container, &handle, &FlashOptions::default(), &cancel);
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(ProtocolError::Cancelled { image: 0, .. })
    ));
}

#[test]
fn test_cancel_during_last_verify_is_not_success() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let cancel = CancelToken::new();
    let faults = FaultPlan {
        cancel_on_verify: Some(cancel.clone()),
        ..Default::default()
    };
    let handle = device(&registry, RTL8710B, faults);

    let outcome = flash(&registry, &container, &handle, &FlashOptions::default(), &cancel);
    let FlashOutcome::PartialFailure {
        completed_images,
        failure,
    } = outcome
    else {
        panic!("expected a partial failure, got {:?}", outcome);
    };
    assert!(matches!(
        failure.error,
        ProtocolError::Cancelled { image: 0, chunk: 3 }
    ));
    assert_eq!(completed_images, [0]);
    assert_eq!(failure.images[0].verification, Verification::Verified);

    let device = handle.into_inner();
    assert_eq!(device.stats().protocol_resets, 0);
    assert_eq!(device.stats().line_resets, 1);
}

#[test]
fn test_cancelled_before_start() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let handle = device(&registry, RTL8710B, FaultPlan::default());
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = flash(&registry, &container, &handle, &FlashOptions::default(), &cancel);
    assert!(matches!(
        outcome.failure().map(|f| &f.error),
        Some(ProtocolError::Cancelled { image: 0, chunk: 0 })
    ));
    assert_eq!(handle.into_inner().stats().chunks_accepted, 0);
}

#[test]
fn test_busy_transport() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let handle = device(&registry, RTL8710B, FaultPlan::default());

    let guard = handle.try_acquire().unwrap();
    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    assert!(matches!(
        outcome,
        FlashOutcome::Fatal(ref failure) if matches!(failure.error, ProtocolError::TransportBusy)
    ));
    assert_eq!(guard.stats().probes, 0);
}

#[test]
fn test_disconnect_is_fatal_and_not_retried() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let faults = FaultPlan {
        disconnect_after_chunks: Some(1),
        ..Default::default()
    };
    let handle = device(&registry, RTL8710B, faults);

    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    let FlashOutcome::Fatal(failure) = outcome else {
        panic!("expected a fatal outcome, got {:?}", outcome);
    };
    assert!(matches!(
        failure.error,
        ProtocolError::TransportIo(TransportError::Closed)
    ));
    assert_eq!((failure.image, failure.chunk, failure.attempts), (Some(0), Some(1), 1));

    let device = handle.into_inner();
    assert_eq!(device.stats().chunks_accepted, 1);
    assert_eq!(device.stats().chunks_rejected, 0);
}

#[test]
fn test_verify_mismatch() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let faults = FaultPlan {
        corrupt_verify: true,
        ..Default::default()
    };
    let handle = device(&registry, RTL8710B, faults);

    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    let FlashOutcome::PartialFailure {
        completed_images,
        failure,
    } = outcome
    else {
        panic!("expected a partial failure, got {:?}", outcome);
    };
    assert!(completed_images.is_empty());
    let expected = realtek_image().checksum();
    assert!(matches!(
        failure.error,
        ProtocolError::VerifyFailed { image: 0, expected: e, actual } if e == expected && actual == !expected
    ));
    assert_eq!(failure.images[0].verification, Verification::Failed);
}

#[test]
fn test_verify_disabled_or_unsupported() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);

    let handle = device(&registry, RTL8710B, FaultPlan::default());
    let options = FlashOptions {
        verify: false,
        ..Default::default()
    };
    let report = flash(&registry, &container, &handle, &options, &CancelToken::new())
        .into_result()
        .unwrap();
    assert_eq!(report.images[0].verification, Verification::Unverified);

    let config = MockConfig {
        verify: false,
        ..MockConfig::for_family(family(&registry, RTL8710B))
    };
    let handle = TransportHandle::new("mock", MockDevice::new(config));
    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert_eq!(report.images[0].verification, Verification::Unverified);
}

#[test]
fn test_partial_failure_keeps_completed_images() {
    let registry = registry();
    let second = Image::new(RTL8710B, 0x20000, payload(100, 1));
    let container = Container::new(vec![realtek_image(), second]);
    let faults = FaultPlan {
        fail_image: Some(1),
        ..Default::default()
    };
    let handle = device(&registry, RTL8710B, faults);

    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    let FlashOutcome::PartialFailure {
        completed_images,
        failure,
    } = outcome
    else {
        panic!("expected a partial failure, got {:?}", outcome);
    };
    assert_eq!(completed_images, [0]);
    assert!(matches!(
        failure.error,
        ProtocolError::ChunkRejected {
            image: 1,
            chunk: 0,
            address: 0x20000,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(failure.images.len(), 2);
    assert_eq!(failure.images[0].bytes_sent, 3000);
    assert_eq!(failure.images[0].verification, Verification::Pending);

    let device = handle.into_inner();
    assert_eq!(device.contents(0x10000, 3000), realtek_image().payload());
}

#[test]
fn test_other_families_skipped() {
    let registry = registry();
    let container = Container::new(vec![
        realtek_image(),
        Image::new(BK7231N, 0x30000, payload(64, 2)),
        Image::new(RTL8710B, 0x40000, payload(16, 3)),
    ]);
    let handle = device(&registry, RTL8710B, FaultPlan::default());

    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert_eq!(report.skipped, [1]);
    let written: Vec<_> = report.images.iter().map(|i| i.index).collect();
    assert_eq!(written, [0, 2]);

    let device = handle.into_inner();
    assert!(device.contents(0x30000, 64).iter().all(|&b| b == 0xFF));
    assert_eq!(device.contents(0x40000, 16), payload(16, 3));
}

#[test]
fn test_chunk_size_limits() {
    let registry = registry();
    let container = Container::new(vec![realtek_image()]);
    let base = MockConfig::for_family(family(&registry, RTL8710B));

    // A 268-byte link carries 256 data bytes per WRITE frame
    let config = MockConfig {
        max_write_len: Some(268),
        ..base.clone()
    };
    let handle = TransportHandle::new("mock", MockDevice::new(config));
    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert_eq!(report.chunk_size, 256);
    assert_eq!(report.images[0].chunks, 12);

    let handle = TransportHandle::new("mock", MockDevice::new(base.clone()));
    let options = FlashOptions {
        chunk_size_override: Some(100),
        ..Default::default()
    };
    let report = flash(&registry, &container, &handle, &options, &CancelToken::new())
        .into_result()
        .unwrap();
    assert_eq!(report.chunk_size, 100);
    assert_eq!(report.images[0].chunks, 30);

    let handle = TransportHandle::new("mock", MockDevice::new(base));
    let options = FlashOptions {
        chunk_size_override: Some(8),
        ..Default::default()
    };
    let outcome = flash(&registry, &container, &handle, &options, &CancelToken::new());
    assert!(matches!(
        outcome,
        FlashOutcome::Fatal(ref failure)
            if matches!(failure.error, ProtocolError::ChunkSizeUnsupported { size: 8, minimum: 16 })
    ));
}

#[test]
fn test_chunked_crc_images_sharing_a_sector() {
    let registry = registry();
    let first = Image::new(RTL8710B, 0x10000, vec![0x11; 0x800]);
    let second = Image::new(RTL8710B, 0x10800, vec![0x22; 0x100]);
    let container = Container::new(vec![first.clone(), second.clone()]);

    // Without device verification a wiped image would go unnoticed
    let config = MockConfig {
        verify: false,
        ..MockConfig::for_family(family(&registry, RTL8710B))
    };
    let handle = TransportHandle::new("mock", MockDevice::new(config));
    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert_eq!(report.images.len(), 2);

    let flashed = handle.into_inner();
    assert_eq!(flashed.contents(0x10000, 0x800), first.payload());
    assert_eq!(flashed.contents(0x10800, 0x100), second.payload());
    assert!(flashed.contents(0x10900, 0x700).iter().all(|&b| b == 0xFF));

    // In reverse order the later image still lands on erased flash
    let container = Container::new(vec![second.clone(), first.clone()]);
    let handle = device(&registry, RTL8710B, FaultPlan::default());
    let report = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    )
    .into_result()
    .unwrap();
    assert!(report.fully_verified());
}

#[test]
fn test_stop_and_wait_refuses_shared_sector() {
    let registry = registry();
    let container = Container::new(vec![
        beken_image(),
        Image::new(BK7231N, 0x11100, payload(16, 7)),
    ]);
    let handle = device(&registry, BK7231N, FaultPlan::default());

    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    let FlashOutcome::Fatal(failure) = outcome else {
        panic!("expected a fatal outcome, got {:?}", outcome);
    };
    assert!(matches!(
        failure.error,
        ProtocolError::SharedSector {
            first: 0,
            second: 1,
            sector: 0x11000
        }
    ));
    assert_eq!(failure.image, Some(1));
    assert_eq!(handle.into_inner().stats().probes, 0);

    // Separate sectors are fine
    let container = Container::new(vec![
        beken_image(),
        Image::new(BK7231N, 0x12000, payload(16, 7)),
    ]);
    let handle = device(&registry, BK7231N, FaultPlan::default());
    let outcome = flash(
        &registry,
        &container,
        &handle,
        &FlashOptions::default(),
        &CancelToken::new(),
    );
    assert!(outcome.is_success());
    let flashed = handle.into_inner();
    assert_eq!(flashed.contents(0x11000, 40), beken_image().payload());
    assert_eq!(flashed.contents(0x12000, 16), payload(16, 7));
}
