//! Server-side image group and frame-state bookkeeping (C9), grounded on spec §4.9 "Image group
//! lifecycle" / "Present path" / "Frame states" / "Target timestamp derivation", and styled after
//! the pure state-machine + free-function-events shape of [`crate::capture::CaptureState`]: all
//! Vulkan import/barrier/submit work and the encoder itself are out-of-scope collaborators (spec
//! §1), so this module only tracks which image is in which frame state and what synthesized
//! events (`AcquireImage`/`FrameComplete`/`RetireImage`) a vblank produces.

use thiserror::Error;

/// `ClientOwned -> PresentQueued -> PresentReady -> PresentComplete` (spec §4.9 "Frame states").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    /// Free for the client to acquire and render into again.
    ClientOwned,
    /// A `PresentImage` was accepted; the import/barrier/submit work is still in flight.
    PresentQueued { present_id: u64, target_timestamp: u64, period: u32 },
    /// The thread-pool fence-wait task observed the submit complete.
    PresentReady { present_id: u64, target_timestamp: u64 },
    /// A vblank promoted this image to the currently displayed one.
    PresentComplete { present_id: u64 },
}

impl ImageState {
    fn target_timestamp(&self) -> Option<u64> {
        match self {
            ImageState::PresentQueued { target_timestamp, .. } => Some(*target_timestamp),
            ImageState::PresentReady { target_timestamp, .. } => Some(*target_timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerImage {
    pub state: ImageState,
}

impl ServerImage {
    fn client_owned() -> Self {
        ServerImage { state: ImageState::ClientOwned }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ImageGroupError {
    #[error("image group serial is out of date")]
    OutOfDateSerial,
    #[error("image index out of range")]
    IndexOutOfRange,
    #[error("present id is not strictly greater than the last accepted one")]
    NonMonotonicPresentId,
    #[error("image is not currently client-owned")]
    ImageNotOwned,
    #[error("image is not awaiting a ready transition")]
    ImageNotQueued,
}

/// A completed vblank's verdict (spec §4.9 "Frame states").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VblankOutcome {
    /// `Some` iff an image was promoted to `PresentComplete` this vblank.
    pub frame_complete: Option<u64>,
    /// Image indices returned to `ClientOwned`, each paired with a synthesized
    /// `AcquireImage`/`RetireImage` event (spec: "an AcquireImage/RetireImage pair per
    /// obsoleted image").
    pub retired: Vec<u32>,
    /// No `PresentReady` image had a due `target_timestamp` (spec: "drop counter increments").
    pub stalled: bool,
}

/// Server-owned state for one client's image group (spec §3 "ImageGroup / ExportableImage").
#[derive(Debug, Clone)]
pub struct ServerImageGroup {
    pub serial: u64,
    pub width: u32,
    pub height: u32,
    pub cross_device: bool,
    images: Vec<ServerImage>,
    last_present_id: u64,
    /// Non-decreasing (spec §8 invariant 3: "`complete_khr_present_id` is non-decreasing" --
    /// this is the server-side analogue, the last promoted present id).
    completed_present_id: u64,
    pub stalled_vblanks: u64,
}

impl ServerImageGroup {
    pub fn new(serial: u64, width: u32, height: u32, image_count: u32, cross_device: bool) -> Self {
        ServerImageGroup {
            serial,
            width,
            height,
            cross_device,
            images: vec![ServerImage::client_owned(); image_count as usize],
            last_present_id: 0,
            completed_present_id: 0,
            stalled_vblanks: 0,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn completed_present_id(&self) -> u64 {
        self.completed_present_id
    }

    pub fn image_state(&self, index: u32) -> Option<ImageState> {
        self.images.get(index as usize).map(|i| i.state)
    }

    /// Validates and admits a `PresentImage` message (spec §4.9 "Present path" step 1 and §4.9
    /// "Target timestamp derivation"). Returns the computed `target_timestamp`.
    pub fn handle_present(
        &mut self,
        serial: u64,
        index: u32,
        present_id: u64,
        period: u32,
        current_timestamp: u64,
    ) -> Result<u64, ImageGroupError> {
        if serial != self.serial {
            return Err(ImageGroupError::OutOfDateSerial);
        }
        if present_id <= self.last_present_id {
            return Err(ImageGroupError::NonMonotonicPresentId);
        }
        let max_in_flight_target = self.images.iter().filter_map(|i| i.state.target_timestamp()).max().unwrap_or(0);
        let target_timestamp = (current_timestamp + 1).max(max_in_flight_target + period as u64);

        let img = self.images.get_mut(index as usize).ok_or(ImageGroupError::IndexOutOfRange)?;
        if !matches!(img.state, ImageState::ClientOwned) {
            return Err(ImageGroupError::ImageNotOwned);
        }
        img.state = ImageState::PresentQueued { present_id, target_timestamp, period };
        self.last_present_id = present_id;
        Ok(target_timestamp)
    }

    /// The per-image thread-pool task (spec §4.9 "Present path" step 5) observed the submit
    /// fence signal; the image becomes eligible for vblank selection.
    pub fn mark_ready(&mut self, index: u32) -> Result<(), ImageGroupError> {
        let img = self.images.get_mut(index as usize).ok_or(ImageGroupError::IndexOutOfRange)?;
        match img.state {
            ImageState::PresentQueued { present_id, target_timestamp, .. } => {
                img.state = ImageState::PresentReady { present_id, target_timestamp };
                Ok(())
            }
            _ => Err(ImageGroupError::ImageNotQueued),
        }
    }

    /// One virtual vblank (spec §4.9 "Frame states", §4.10). Selects the highest-present-id
    /// `PresentReady` image whose `target_timestamp <= current_timestamp`, promotes it, and
    /// returns any now-obsolete images to `ClientOwned`.
    pub fn tick(&mut self, current_timestamp: u64) -> VblankOutcome {
        let candidate = self
            .images
            .iter()
            .enumerate()
            .filter_map(|(i, img)| match img.state {
                ImageState::PresentReady { present_id, target_timestamp } if target_timestamp <= current_timestamp => Some((i, present_id)),
                _ => None,
            })
            .max_by_key(|(_, present_id)| *present_id);

        let Some((promote_idx, promoted_id)) = candidate else {
            self.stalled_vblanks += 1;
            return VblankOutcome { stalled: true, ..Default::default() };
        };

        self.images[promote_idx].state = ImageState::PresentComplete { present_id: promoted_id };
        self.completed_present_id = self.completed_present_id.max(promoted_id);

        let mut retired = Vec::new();
        for (i, img) in self.images.iter_mut().enumerate() {
            if i == promote_idx {
                continue;
            }
            let obsolete = match img.state {
                ImageState::PresentComplete { present_id } => present_id < promoted_id,
                ImageState::PresentReady { present_id, .. } => present_id < promoted_id,
                _ => false,
            };
            if obsolete {
                *img = ServerImage::client_owned();
                retired.push(i as u32);
            }
        }

        VblankOutcome {
            frame_complete: Some(promoted_id),
            retired,
            stalled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e1_single_present_round_trip_completes_within_one_vblank() {
        let mut group = ServerImageGroup::new(7, 256, 256, 3, false);
        let target = group.handle_present(7, 0, 1, 1, 100).unwrap();
        assert!(target > 100);
        group.mark_ready(0).unwrap();

        let outcome = group.tick(target);
        assert_eq!(outcome.frame_complete, Some(1));
        assert!(!outcome.stalled);
        assert_eq!(group.image_state(0), Some(ImageState::PresentComplete { present_id: 1 }));

        // The application's next present reuses a now-owned image.
        let idle = (0..3u32).find(|&i| group.image_state(i) == Some(ImageState::ClientOwned)).unwrap();
        assert_ne!(idle, 0);
    }

    #[test]
    fn stale_present_is_obsoleted_and_returned_to_client() {
        let mut group = ServerImageGroup::new(1, 64, 64, 3, false);
        group.handle_present(1, 0, 1, 0, 0).unwrap();
        group.mark_ready(0).unwrap();
        group.tick(10);
        assert_eq!(group.image_state(0), Some(ImageState::PresentComplete { present_id: 1 }));

        group.handle_present(1, 1, 2, 0, 10).unwrap();
        group.mark_ready(1).unwrap();
        let outcome = group.tick(20);
        assert_eq!(outcome.frame_complete, Some(2));
        assert_eq!(outcome.retired, vec![0]);
        assert_eq!(group.image_state(0), Some(ImageState::ClientOwned));
    }

    #[test]
    fn non_monotonic_present_id_is_rejected() {
        let mut group = ServerImageGroup::new(1, 64, 64, 3, false);
        group.handle_present(1, 0, 5, 0, 0).unwrap();
        let err = group.handle_present(1, 1, 5, 0, 1).unwrap_err();
        assert_eq!(err, ImageGroupError::NonMonotonicPresentId);
    }

    #[test]
    fn out_of_date_serial_is_rejected() {
        let mut group = ServerImageGroup::new(5, 64, 64, 3, false);
        let err = group.handle_present(4, 0, 1, 0, 0).unwrap_err();
        assert_eq!(err, ImageGroupError::OutOfDateSerial);
    }

    #[test]
    fn no_ready_image_stalls_the_vblank() {
        let mut group = ServerImageGroup::new(1, 64, 64, 3, false);
        group.handle_present(1, 0, 1, 0, 0).unwrap();
        // Never marked ready: the fence-wait task hasn't completed yet.
        let outcome = group.tick(1000);
        assert!(outcome.stalled);
        assert_eq!(group.stalled_vblanks, 1);
    }

    #[test]
    fn completed_present_id_is_non_decreasing() {
        let mut group = ServerImageGroup::new(1, 64, 64, 3, false);
        let mut last = 0;
        for id in 1..=5u64 {
            let idx = (id % 3) as u32;
            let target = group.handle_present(1, idx, id, 0, id * 10).unwrap();
            group.mark_ready(idx).unwrap();
            group.tick(target);
            assert!(group.completed_present_id() >= last);
            last = group.completed_present_id();
        }
    }
}
