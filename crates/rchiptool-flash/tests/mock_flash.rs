//! End-to-end flashing through `open_transport("mock:...")`
#![cfg(feature = "mock")]

use rchiptool_core::protocol::{NoProgress, Verification};
use rchiptool_core::{CancelToken, Container, FlashOptions, FlashOutcome, Image, Registry};
use rchiptool_flash::open_transport;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn test_flash_chunked_crc_mock() {
    let registry = Registry::builtin().unwrap();
    let handle = open_transport("mock:ln882h", &registry).unwrap();
    let code = handle.family_hint().unwrap();
    let container = Container::new(vec![
        Image::new(code, 0x10000, payload(5000)),
        Image::new(code, 0x20000, payload(10)),
    ]);

    let outcome = handle.flash(
        &registry,
        &container,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut NoProgress,
    );
    let report = outcome.into_result().unwrap();
    assert_eq!(report.family, code);
    assert_eq!(report.bytes_sent(), 5010);
    assert!(report.fully_verified());
    handle.close().unwrap();
}

#[test]
fn test_flash_without_verify_support() {
    let registry = Registry::builtin().unwrap();
    let handle = open_transport("mock:rtl8710b,verify=off", &registry).unwrap();
    let code = handle.family_hint().unwrap();
    let container = Container::new(vec![Image::new(code, 0x8000, payload(300))]);

    let outcome = handle.flash(
        &registry,
        &container,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut NoProgress,
    );
    let report = outcome.into_result().unwrap();
    assert_eq!(report.images[0].verification, Verification::Unverified);
}

#[test]
fn test_bootloader_region_is_protected() {
    let registry = Registry::builtin().unwrap();
    let handle = open_transport("mock:bk7231n", &registry).unwrap();
    let code = handle.family_hint().unwrap();
    let container = Container::new(vec![Image::new(code, 0x0, payload(16))]);

    let outcome = handle.flash(
        &registry,
        &container,
        &FlashOptions::default(),
        &CancelToken::new(),
        &mut NoProgress,
    );
    assert!(matches!(outcome, FlashOutcome::Fatal(_)));
}
