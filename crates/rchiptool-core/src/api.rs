//! Caller-facing operations
//!
//! Thin entry points over the registry, codec and protocol engine for
//! callers that do not need to drive the pieces themselves.

use crate::container::{Container, ContainerError, Image};
use crate::family::{Family, Registry};
use crate::protocol::{
    Capabilities, CancelToken, FlashFailure, FlashOptions, FlashOutcome, FlashProgress,
    FlashProtocol, NoProgress, ProtocolError, Session, Variant,
};
use crate::transport::{Transport, TransportHandle};

/// Validate `images` against the registry and encode them as a container
pub fn pack(registry: &Registry, images: Vec<Image>) -> Result<Vec<u8>, ContainerError> {
    let container = Container::new(images);
    container.validate(registry)?;
    container.encode()
}

/// Decode a container into its images
pub fn unpack(bytes: &[u8]) -> Result<Vec<Image>, ContainerError> {
    Ok(Container::decode(bytes)?.into_images())
}

/// Flash `container` to the device behind `handle`
///
/// See [`flash_with_progress`].
pub fn flash<T: Transport>(
    registry: &Registry,
    container: &Container,
    handle: &TransportHandle<T>,
    options: &FlashOptions,
    cancel: &CancelToken,
) -> FlashOutcome {
    flash_with_progress(registry, container, handle, options, cancel, &mut NoProgress)
}

/// Flash `container`, reporting progress to `progress`
///
/// The target family is `options.target_family`, or the family of the first
/// image. Only that family's images are written. Pre-flight checks (container
/// validation, family lookup, bootloader protection) run before the
/// transport is touched and fail as [`FlashOutcome::Fatal`]. On protocols
/// where the device erases the sectors of each image as it starts, images
/// that share a sector are refused with [`ProtocolError::SharedSector`].
pub fn flash_with_progress<T: Transport>(
    registry: &Registry,
    container: &Container,
    handle: &TransportHandle<T>,
    options: &FlashOptions,
    cancel: &CancelToken,
    progress: &mut dyn FlashProgress,
) -> FlashOutcome {
    let family = match preflight(registry, container, options) {
        Ok(family) => family,
        Err(error) => {
            log::error!("flash: {}", error);
            return FlashOutcome::Fatal(FlashFailure::from_error(error));
        }
    };

    match Session::new(family, handle, options.clone(), cancel.clone()) {
        Ok(session) => session.run(container, progress),
        Err(error) => FlashOutcome::Fatal(FlashFailure::from_error(error)),
    }
}

fn preflight<'r>(
    registry: &'r Registry,
    container: &Container,
    options: &FlashOptions,
) -> Result<&'r Family, ProtocolError> {
    container.validate(registry)?;

    let code = options
        .target_family
        .or_else(|| container.images().first().map(Image::family_code))
        .ok_or(ProtocolError::NoImages(0))?;
    let family = registry
        .lookup(code)
        .ok_or(ProtocolError::UnknownFamily(code))?;

    let mut any = false;
    for (index, image) in container.images_for_family(code) {
        any = true;
        if !options.allow_bootloader_write
            && family
                .geometry
                .touches_bootloader(image.load_address(), image.len())
        {
            return Err(ProtocolError::BootloaderProtected { image: index });
        }
    }
    if !any {
        return Err(ProtocolError::NoImages(code));
    }

    let host_erase = Variant::for_kind(family.protocol)
        .capabilities()
        .contains(Capabilities::ERASE);
    if !host_erase {
        check_shared_sectors(family, container)?;
    }

    Ok(family)
}

/// Refuse layouts where starting one image erases part of another
fn check_shared_sectors(family: &Family, container: &Container) -> Result<(), ProtocolError> {
    let geometry = &family.geometry;
    let mut spans: Vec<(usize, u64, u64)> = container
        .images_for_family(family.code)
        .filter(|(_, image)| !image.is_empty())
        .map(|(index, image)| {
            (
                index,
                geometry.align_down(image.load_address() as u64),
                geometry.align_up(image.end()),
            )
        })
        .collect();
    spans.sort_by_key(|&(_, start, _)| start);

    for pair in spans.windows(2) {
        let (a, _, a_end) = pair[0];
        let (b, b_start, _) = pair[1];
        if b_start < a_end {
            return Err(ProtocolError::SharedSector {
                first: a.min(b),
                second: a.max(b),
                sector: b_start,
            });
        }
    }
    Ok(())
}
