//! Capture layer (C5): the bookkeeping the application-facing side of a stream keeps about its
//! swapchain, its exported images, and the in-flight presents it is waiting on the server to
//! acknowledge.
//!
//! Grounded on spec §4.5. This module models the layer's decisions as pure state transitions --
//! "here is what changed, here is what you must now do" -- and leaves actually issuing the
//! Vulkan calls (image creation, barriers, queue submission) to the caller, the way pyrofling itself
//! separates `Device`'s thin raw-call wrappers from the higher-level scheduling in `sync` and
//! `wsi`. A real interposition layer would hook `vkCreateInstance`/`vkQueuePresentKHR` directly;
//! this crate instead exposes the same decisions as a library a host application drives.

use std::collections::HashMap;

use ash::vk;
use thiserror::Error;

use crate::env::{CaptureConfig, ForcedColorSpace, SyncMode};
use crate::handle::FileHandle;
use crate::ipc::message::{AcquireImageWire, FrameCompleteWire, ImageGroupWire, PresentImageWire, RetireImageWire};
use crate::ipc::{Message, MessagePayload};

/// One image exported to the server as part of an image group.
#[derive(Debug)]
pub struct ExportableImage {
    pub index: u32,
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
    /// Set once the server has handed this image back via `AcquireImage` and cleared on the next
    /// `PresentImage` for it.
    pub acquired: bool,
    /// Set once `RetireImage` confirms the server is done reading from it.
    pub ready: bool,
    /// A present for this image is outstanding and its completion fence hasn't signalled yet.
    pub fence_pending: bool,
    pub acquire_semaphore: vk::Semaphore,
    pub release_semaphore: vk::Semaphore,
}

impl ExportableImage {
    fn new(index: u32) -> Self {
        ExportableImage {
            index,
            handle: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            acquired: false,
            ready: true,
            fence_pending: false,
            acquire_semaphore: vk::Semaphore::null(),
            release_semaphore: vk::Semaphore::null(),
        }
    }
}

/// A generation of exported images, identified by the monotonic serial the server uses to key
/// `AcquireImage`/`PresentImage`/`RetireImage` messages against (spec §4.5 step 4).
#[derive(Debug)]
pub struct ImageGroup {
    pub serial: u64,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub images: Vec<ExportableImage>,
}

impl ImageGroup {
    pub fn new(serial: u64, width: u32, height: u32, format: vk::Format, color_space: vk::ColorSpaceKHR, count: u32) -> Self {
        ImageGroup {
            serial,
            width,
            height,
            format,
            color_space,
            images: (0..count).map(ExportableImage::new).collect(),
        }
    }

    pub fn image_mut(&mut self, index: u32) -> Option<&mut ExportableImage> {
        self.images.iter_mut().find(|img| img.index == index)
    }
}

/// What [`CaptureState::bind_swapchain`] decided the caller must now do.
#[derive(Debug, PartialEq, Eq)]
pub enum BindAction {
    /// Nothing changed; the existing image group (if any) is still valid.
    KeepExisting,
    /// The surface changed shape or the device was swapped out from under it: free whatever
    /// images exist and allocate `count` fresh ones at the given extent/format.
    Reallocate { count: u32, width: u32, height: u32, format: vk::Format, color_space: vk::ColorSpaceKHR },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no image group is bound yet")]
    NoImageGroup,
    #[error("image index {0} out of range for the current image group")]
    UnknownImage(u32),
    #[error("event referenced image group serial {event}, current is {current}")]
    StaleSerial { event: u64, current: u64 },
    #[error("present id {0} was not found among outstanding wait pairs")]
    UnknownPresentId(u64),
}

/// Default image-group size, used unless `PYROFLING_IMAGES` overrides it (spec §4.5).
pub const DEFAULT_IMAGE_COUNT: u32 = 3;

/// A present the capture layer is still waiting for the server to confirm complete, keyed by
/// both sides' idea of the present id (spec §4.5 "present-wait redirection").
#[derive(Debug, Clone, Copy)]
struct WaitPair {
    pyro_id: u64,
    khr_id: u64,
}

/// Per-surface capture state: the current image group plus the outstanding-present bookkeeping
/// needed to answer `waitForPresent` and to drive `vkQueuePresentKHR` wrapping.
pub struct CaptureState {
    pub config: CaptureConfig,
    image_group: Option<ImageGroup>,
    bound_device_uuid: Option<[u8; 16]>,
    wait_pairs: Vec<WaitPair>,
    completed_khr_present_id: u64,
    next_pyro_present_id: u64,
    presents_since_reconnect: u32,
}

impl CaptureState {
    pub fn new(config: CaptureConfig) -> Self {
        CaptureState {
            config,
            image_group: None,
            bound_device_uuid: None,
            wait_pairs: Vec::new(),
            completed_khr_present_id: 0,
            next_pyro_present_id: 1,
            presents_since_reconnect: 0,
        }
    }

    pub fn image_group(&self) -> Option<&ImageGroup> {
        self.image_group.as_ref()
    }

    /// spec §4.5 "active device/swapchain binding", steps 1-3: decide whether the bound image
    /// group survives a new swapchain, or must be torn down and reallocated.
    pub fn bind_swapchain(&mut self, device_uuid: [u8; 16], width: u32, height: u32, format: vk::Format, color_space: vk::ColorSpaceKHR) -> BindAction {
        let device_changed = self.bound_device_uuid != Some(device_uuid);
        self.bound_device_uuid = Some(device_uuid);

        if device_changed {
            self.image_group = None;
        }

        let unchanged = match &self.image_group {
            Some(g) if !device_changed => g.width == width && g.height == height && g.format == format && g.color_space == color_space,
            _ => false,
        };

        if unchanged {
            return BindAction::KeepExisting;
        }

        self.image_group = None;
        BindAction::Reallocate {
            count: self.config.forced_images.unwrap_or(DEFAULT_IMAGE_COUNT),
            width,
            height,
            format,
            color_space,
        }
    }

    /// Install a freshly allocated image group after the caller has acted on a
    /// [`BindAction::Reallocate`], and build the `ImageGroup` message to send to the server.
    pub fn install_image_group(&mut self, serial: u64, width: u32, height: u32, format: vk::Format, color_space: vk::ColorSpaceKHR, count: u32) -> &ImageGroup {
        self.image_group = Some(ImageGroup::new(serial, width, height, format, color_space, count));
        self.image_group.as_ref().unwrap()
    }

    /// spec §4.5 "event handling": fold one server event into the bookkeeping, returning whether
    /// any outstanding `waitForPresent` calls should be woken.
    pub fn handle_event(&mut self, payload: &MessagePayload) -> Result<bool, CaptureError> {
        match payload {
            MessagePayload::AcquireImage { wire, .. } => self.on_acquire_image(wire),
            MessagePayload::RetireImage(wire) => self.on_retire_image(wire),
            MessagePayload::FrameComplete(wire) => self.on_frame_complete(wire),
            _ => Ok(false),
        }
    }

    fn group_mut(&mut self, serial: u64) -> Result<&mut ImageGroup, CaptureError> {
        let group = self.image_group.as_mut().ok_or(CaptureError::NoImageGroup)?;
        if group.serial != serial {
            return Err(CaptureError::StaleSerial { event: serial, current: group.serial });
        }
        Ok(group)
    }

    fn on_acquire_image(&mut self, wire: &AcquireImageWire) -> Result<bool, CaptureError> {
        let group = self.group_mut(wire.image_group_serial)?;
        let image = group.image_mut(wire.index).ok_or(CaptureError::UnknownImage(wire.index))?;
        image.acquired = true;
        image.ready = false;
        Ok(false)
    }

    fn on_retire_image(&mut self, wire: &RetireImageWire) -> Result<bool, CaptureError> {
        let group = self.group_mut(wire.image_group_serial)?;
        let image = group.image_mut(wire.index).ok_or(CaptureError::UnknownImage(wire.index))?;
        image.ready = true;
        image.fence_pending = false;
        Ok(false)
    }

    /// spec §4.5: "resolves wait-pairs whose pyro id is less than or equal to the completed id".
    fn on_frame_complete(&mut self, wire: &FrameCompleteWire) -> Result<bool, CaptureError> {
        let completed = wire.presented_id;
        let mut woke_any = false;
        self.wait_pairs.retain(|pair| {
            if pair.pyro_id <= completed {
                if pair.khr_id > self.completed_khr_present_id {
                    self.completed_khr_present_id = pair.khr_id;
                }
                woke_any = true;
                false
            } else {
                true
            }
        });
        Ok(woke_any)
    }

    /// spec §4.5 "queue present wrapping": register a newly submitted present's wait pair and
    /// return the monotonic pyro-side id to embed in the `PresentImage` message.
    pub fn register_present(&mut self, khr_id: u64) -> u64 {
        let pyro_id = self.next_pyro_present_id;
        self.next_pyro_present_id += 1;
        self.wait_pairs.push(WaitPair { pyro_id, khr_id });
        self.presents_since_reconnect += 1;
        pyro_id
    }

    /// spec §4.5 "presentation path" step: native present is used as-is for client-sync surfaces,
    /// surfaces with no session, and non-FIFO presentation outside of server sync; only
    /// server-synced/FIFO-like presents redirect through the session.
    pub fn waits_on_session(&self, present_mode: vk::PresentModeKHR) -> bool {
        match self.config.sync_mode {
            SyncMode::Client => false,
            SyncMode::Server => matches!(present_mode, vk::PresentModeKHR::FIFO | vk::PresentModeKHR::FIFO_RELAXED),
        }
    }

    /// spec §4.5 "presentation path" step 10's period choice: 1 under server sync or FIFO-like
    /// presentation, 0 (unpaced) otherwise.
    pub fn choose_period(&self, present_mode: vk::PresentModeKHR) -> u16 {
        if self.waits_on_session(present_mode) {
            1
        } else {
            0
        }
    }

    /// spec §4.5 "presentation path" step 11's pacing gate: block further acquires until the
    /// server has confirmed completion close enough behind the current present that at least one
    /// image is free. `num_images` is the size of the bound image group.
    pub fn should_pace(&self, current_pyro_id: u64, num_images: u32) -> bool {
        if num_images < 2 {
            return false;
        }
        let complete = self.wait_pairs.first().map(|p| p.pyro_id.saturating_sub(1)).unwrap_or(current_pyro_id.saturating_sub(1));
        complete + u64::from(num_images - 2) < current_pyro_id
    }

    /// spec §4.5 "presentation path" step 1: reconnect every 30 presents.
    pub fn should_reconnect(&self) -> bool {
        self.presents_since_reconnect >= 30
    }

    pub fn note_reconnected(&mut self) {
        self.presents_since_reconnect = 0;
        self.wait_pairs.clear();
    }

    /// spec §4.5 "present-wait redirection": has the server confirmed this native present id yet.
    pub fn present_confirmed(&self, khr_present_id: u64) -> bool {
        self.completed_khr_present_id >= khr_present_id
    }
}

/// spec §4.5 "surface filtering": only these three color spaces are ever accepted.
pub fn accepted_color_space(color_space: vk::ColorSpaceKHR) -> bool {
    matches!(color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR | vk::ColorSpaceKHR::HDR10_ST2084_EXT | vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT)
}

/// spec §4.5 `PYROFLING_FORCE_VK_COLOR_SPACE`: override the surface's reported color space.
pub fn apply_forced_color_space(forced: Option<ForcedColorSpace>, native: vk::ColorSpaceKHR) -> vk::ColorSpaceKHR {
    match forced {
        None => native,
        Some(ForcedColorSpace::Hdr10) => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        Some(ForcedColorSpace::ScRgb) => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        Some(ForcedColorSpace::Integer) => vk::ColorSpaceKHR::SRGB_NONLINEAR,
    }
}

/// Build the `ImageGroup` message payload that announces a freshly reallocated image group,
/// taking ownership of the exported fds the caller produced for each image (spec §4.5 step 4:
/// "mutable-format/view-format-list/dedicated-memory ... export").
pub fn image_group_message(group: &ImageGroup, fds: Vec<FileHandle>, usage: vk::ImageUsageFlags) -> MessagePayload {
    let wire = ImageGroupWire {
        num_images: group.images.len() as u32,
        width: group.width,
        height: group.height,
        vk_format: group.format.as_raw() as u32,
        vk_color_space: group.color_space.as_raw() as u32,
        vk_image_usage: usage.as_raw(),
        vk_image_flags: vk::ImageCreateFlags::MUTABLE_FORMAT.as_raw(),
        vk_external_memory_type: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD.as_raw(),
        vk_num_view_formats: 1,
        vk_view_formats: {
            let mut formats = [0u32; 15];
            formats[0] = group.format.as_raw() as u32;
            formats
        },
        drm_modifier: 0,
    };
    MessagePayload::ImageGroup { wire, fds }
}

/// Build the `PresentImage` message for one present (spec §4.5 step 10).
pub fn present_image_message(group_serial: u64, index: u32, period: u16, pyro_id: u64, semaphore_fd: FileHandle, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> MessagePayload {
    let wire = PresentImageWire {
        image_group_serial: group_serial,
        period,
        index: index as u16,
        vk_external_semaphore_type: vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD.as_raw(),
        vk_old_layout: old_layout.as_raw() as u32,
        vk_new_layout: new_layout.as_raw() as u32,
        id: pyro_id,
    };
    MessagePayload::PresentImage { wire, fd: semaphore_fd }
}

/// Dispatch table of per-surface [`CaptureState`]s, one per live `VkSurfaceKHR`, the way a real
/// interposition layer would key state off the surface handle it was handed at creation time.
#[derive(Default)]
pub struct CaptureLayer {
    surfaces: HashMap<u64, CaptureState>,
}

impl CaptureLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn surface_mut(&mut self, surface_key: u64, config: impl FnOnce() -> CaptureConfig) -> &mut CaptureState {
        self.surfaces.entry(surface_key).or_insert_with(|| CaptureState::new(config()))
    }

    pub fn remove_surface(&mut self, surface_key: u64) {
        self.surfaces.remove(&surface_key);
    }

    /// Route one incoming event message to the surface it names, identified by the image group
    /// serial carried in the event (spec §4.5 pairs every event with an image group serial).
    pub fn dispatch_event(&mut self, surface_key: u64, message: &Message) -> Result<bool, CaptureError> {
        let state = self.surfaces.get_mut(&surface_key).ok_or(CaptureError::NoImageGroup)?;
        state.handle_event(&message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::CaptureConfig;

    fn config() -> CaptureConfig {
        CaptureConfig {
            sync_mode: SyncMode::Server,
            forced_images: None,
            socket_path: "/tmp/pyrofling-socket".into(),
            forced_color_space: None,
        }
    }

    #[test]
    fn bind_swapchain_reallocates_on_first_bind() {
        let mut state = CaptureState::new(config());
        let action = state.bind_swapchain([1; 16], 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(
            action,
            BindAction::Reallocate {
                count: DEFAULT_IMAGE_COUNT,
                width: 1920,
                height: 1080,
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }
        );
    }

    #[test]
    fn bind_swapchain_keeps_unchanged_group() {
        let mut state = CaptureState::new(config());
        state.bind_swapchain([1; 16], 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        state.install_image_group(1, 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR, 3);
        let action = state.bind_swapchain([1; 16], 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert_eq!(action, BindAction::KeepExisting);
    }

    #[test]
    fn bind_swapchain_reallocates_on_device_change() {
        let mut state = CaptureState::new(config());
        state.bind_swapchain([1; 16], 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        state.install_image_group(1, 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR, 3);
        let action = state.bind_swapchain([2; 16], 1920, 1080, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        assert!(matches!(action, BindAction::Reallocate { .. }));
    }

    #[test]
    fn acquire_then_retire_round_trips_image_state() {
        let mut state = CaptureState::new(config());
        state.install_image_group(7, 100, 100, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR, 3);

        let acquire = AcquireImageWire { image_group_serial: 7, index: 1, vk_external_semaphore_type: 0 };
        state.on_acquire_image(&acquire).unwrap();
        assert!(state.image_group().unwrap().images[1].acquired);
        assert!(!state.image_group().unwrap().images[1].ready);

        let retire = RetireImageWire { image_group_serial: 7, index: 1, padding: 0 };
        state.on_retire_image(&retire).unwrap();
        assert!(state.image_group().unwrap().images[1].ready);
    }

    #[test]
    fn stale_serial_is_rejected() {
        let mut state = CaptureState::new(config());
        state.install_image_group(7, 100, 100, vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR, 3);
        let acquire = AcquireImageWire { image_group_serial: 6, index: 0, vk_external_semaphore_type: 0 };
        assert!(matches!(state.on_acquire_image(&acquire), Err(CaptureError::StaleSerial { event: 6, current: 7 })));
    }

    #[test]
    fn frame_complete_resolves_wait_pairs_up_to_id() {
        let mut state = CaptureState::new(config());
        let p1 = state.register_present(100);
        let p2 = state.register_present(101);
        let p3 = state.register_present(102);
        assert_eq!((p1, p2, p3), (1, 2, 3));

        let complete = FrameCompleteWire {
            image_group_serial: 0,
            timestamp: 0,
            period_ns: 0,
            presented_id: 2,
            flags: 0,
            delayed_count: 0,
            headroom_ns: 0,
        };
        let woke = state.on_frame_complete(&complete).unwrap();
        assert!(woke);
        assert_eq!(state.wait_pairs.len(), 1);
        assert_eq!(state.wait_pairs[0].pyro_id, 3);
        assert!(state.present_confirmed(101));
        assert!(!state.present_confirmed(102));
    }

    #[test]
    fn choose_period_depends_on_sync_mode_and_present_mode() {
        let mut cfg = config();
        cfg.sync_mode = SyncMode::Server;
        let state = CaptureState::new(cfg);
        assert_eq!(state.choose_period(vk::PresentModeKHR::FIFO), 1);
        assert_eq!(state.choose_period(vk::PresentModeKHR::MAILBOX), 0);

        let mut cfg = config();
        cfg.sync_mode = SyncMode::Client;
        let state = CaptureState::new(cfg);
        assert_eq!(state.choose_period(vk::PresentModeKHR::FIFO), 0);
    }

    #[test]
    fn reconnect_cadence_every_30_presents() {
        let mut state = CaptureState::new(config());
        for _ in 0..29 {
            state.register_present(0);
        }
        assert!(!state.should_reconnect());
        state.register_present(0);
        assert!(state.should_reconnect());
        state.note_reconnected();
        assert!(!state.should_reconnect());
    }

    #[test]
    fn accepted_color_spaces_are_exactly_the_documented_three() {
        assert!(accepted_color_space(vk::ColorSpaceKHR::SRGB_NONLINEAR));
        assert!(accepted_color_space(vk::ColorSpaceKHR::HDR10_ST2084_EXT));
        assert!(accepted_color_space(vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT));
        assert!(!accepted_color_space(vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT));
    }
}
