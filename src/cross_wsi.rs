//! Cross-WSI layer (C6): lets a swapchain backed by one physical device (the sink, usually the
//! GPU with a display attached) be driven by work submitted against a different physical device
//! (the source, usually the discrete GPU actually doing the rendering), by shuttling each
//! presented image through a host-memory staging buffer (spec §4.6).
//!
//! Grounded on spec §4.6 for the presenter/acquire-queue split and forward-progress budget, and
//! on a conventional Vulkan swapchain wrapper's acquire/present bookkeeping (the real thing this
//! module virtualizes) for the shape of the acquire queue and the extension-mirroring pattern
//! used to decide which device extensions the shadow device gets.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

/// Extensions the shadow sink device advertises support for, mirroring the source device's real
/// support for the same names (spec §4.6 "extension set").
pub const MIRRORED_EXTENSIONS: &[&str] = &[
    "VK_KHR_swapchain",
    "VK_KHR_present_id",
    "VK_KHR_present_wait",
    "VK_EXT_swapchain_maintenance1",
];

/// Extensions that name a capability the shadow device cannot actually provide once the
/// swapchain's images are proxied through a host buffer, and so must never be advertised even if
/// the sink hardware supports them (spec §4.6 "blocklist").
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    "VK_KHR_display_swapchain",
    "VK_GOOGLE_display_timing",
    "VK_EXT_shared_presentable_image",
    "VK_AMD_display_native_hdr",
    "VK_EXT_display_control",
    "VK_EXT_hdr_metadata",
    "VK_KHR_incremental_present",
    "VK_EXT_present_barrier",
    "VK_EXT_full_screen_exclusive",
];

/// spec §4.6 "extension set": mirror the intersection of what the sink actually reports and the
/// names this layer knows how to virtualize, then drop anything blocklisted.
pub fn filter_device_extensions<'a>(sink_supported: &[&'a str]) -> Vec<&'a str> {
    sink_supported
        .iter()
        .copied()
        .filter(|name| MIRRORED_EXTENSIONS.contains(name) && !BLOCKED_EXTENSIONS.contains(name))
        .collect()
}

/// spec §4.6 "forward-progress budget": how many images the presenter may have acquired ahead of
/// the sink swapchain's own completion, bounded below by 1 so the presenter always has somewhere
/// to go even on a swapchain with the bare minimum image count.
pub fn forward_progress_budget(image_count: u32, min_image_count: u32) -> u32 {
    image_count.saturating_sub(min_image_count).saturating_add(1).max(1)
}

#[derive(Error, Debug)]
pub enum CrossWsiError {
    #[error("swapchain is in a failed state: {0:?}")]
    SwapchainLost(ash::vk::Result),
    #[error("acquire timed out")]
    AcquireTimeout,
    #[error("image index {0} was not on the acquire queue")]
    NotAcquired(u32),
}

/// Per-image bookkeeping for one proxied swapchain image (spec §4.6 "per-image model"). The raw
/// handles are owned by whatever live `Device`s created them; this struct only tracks which
/// stage of the source/sink pipeline each image is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStage {
    /// Sitting on the acquire queue, available to hand out.
    Idle,
    /// Handed to the application; the source-side render + copy-to-host-buffer is in flight.
    Acquired,
    /// The presenter thread has submitted the sink-side copy and queued a present.
    Presenting,
}

/// Outcome of one presenter-thread service iteration (spec §4.6 "presenter thread").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterStep {
    /// Source render completed; sink copy-in was submitted.
    SubmittedSinkCopy,
    /// `vkQueuePresentKHR` was issued on the sink.
    Presented,
    /// The swapchain is out of date or lost; the caller should tear it down.
    Failed,
}

/// Backend seam for the actual Vulkan calls a presenter iteration needs, so the iteration's
/// sequencing can be unit tested against a recording fake instead of a live device (spec §4.6
/// "presenter thread" describes exactly these six waits/submits in order).
pub trait PresenterBackend {
    fn wait_and_reset_source_fence(&mut self, index: u32) -> Result<(), CrossWsiError>;
    fn wait_and_reset_sink_acquire_fence(&mut self, index: u32) -> Result<(), CrossWsiError>;
    fn submit_sink_copy(&mut self, index: u32) -> Result<(), CrossWsiError>;
    fn present_sink(&mut self, index: u32) -> Result<(), CrossWsiError>;
    fn acquire_next_sink_image(&mut self) -> Result<(), CrossWsiError>;
}

/// One virtualized swapchain: the acquire queue plus the per-image stage tracking that backs the
/// application-visible `vkAcquireNextImageKHR`/`vkQueuePresentKHR`/`vkReleaseSwapchainImagesEXT`
/// calls against it.
pub struct CrossWsiSwapchain {
    stages: Vec<ImageStage>,
    acquire_queue: Arc<(Mutex<VecDeque<u32>>, Condvar)>,
    processed_source_count: u64,
    failed: bool,
}

impl CrossWsiSwapchain {
    pub fn new(image_count: u32) -> Self {
        let queue = (0..image_count).collect();
        CrossWsiSwapchain {
            stages: vec![ImageStage::Idle; image_count as usize],
            acquire_queue: Arc::new((Mutex::new(queue), Condvar::new())),
            processed_source_count: 0,
            failed: false,
        }
    }

    /// spec §4.6 "acquire": pop the head of the acquire queue, blocking until one is available.
    /// `timeout` of `None` blocks indefinitely like `u64::MAX` would on the real call.
    pub fn acquire(&mut self, timeout: Option<std::time::Duration>) -> Result<u32, CrossWsiError> {
        let (lock, cvar) = &*self.acquire_queue;
        let guard = lock.lock().unwrap();
        let mut queue = match timeout {
            Some(d) => {
                let (queue, timed_out) = cvar.wait_timeout_while(guard, d, |q| q.is_empty()).unwrap();
                if timed_out.timed_out() {
                    return Err(CrossWsiError::AcquireTimeout);
                }
                queue
            }
            None => cvar.wait_while(guard, |q| q.is_empty()).unwrap(),
        };
        let index = queue.pop_front().ok_or(CrossWsiError::AcquireTimeout)?;
        self.stages[index as usize] = ImageStage::Acquired;
        Ok(index)
    }

    /// spec §4.6 "queue present application path": mark the image presenting and enqueue it for
    /// the presenter thread, which is modeled here as the caller next driving
    /// [`CrossWsiSwapchain::service_presenter`] for this index.
    pub fn queue_present(&mut self, index: u32) -> Result<(), CrossWsiError> {
        if self.stages[index as usize] != ImageStage::Acquired {
            return Err(CrossWsiError::NotAcquired(index));
        }
        self.stages[index as usize] = ImageStage::Presenting;
        Ok(())
    }

    /// spec §4.6 "release swapchain images": reinstall the image on the acquire queue, as if a
    /// fresh signalled exportable semaphore had just been attached to it.
    pub fn release(&mut self, index: u32) {
        self.stages[index as usize] = ImageStage::Idle;
        let (lock, cvar) = &*self.acquire_queue;
        lock.lock().unwrap().push_back(index);
        cvar.notify_one();
    }

    /// spec §4.6 "presenter thread": drive one image through the six-step sequence against
    /// `backend`, returning the image to the acquire queue once the present is submitted.
    pub fn service_presenter(&mut self, index: u32, backend: &mut dyn PresenterBackend) -> PresenterStep {
        if self.failed {
            return PresenterStep::Failed;
        }
        let outcome = (|| -> Result<(), CrossWsiError> {
            backend.wait_and_reset_source_fence(index)?;
            self.processed_source_count += 1;
            backend.wait_and_reset_sink_acquire_fence(index)?;
            backend.submit_sink_copy(index)?;
            backend.present_sink(index)?;
            backend.acquire_next_sink_image()?;
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                self.release(index);
                PresenterStep::Presented
            }
            Err(_) => {
                self.failed = true;
                PresenterStep::Failed
            }
        }
    }

    pub fn processed_source_count(&self) -> u64 {
        self.processed_source_count
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_only_the_known_safe_intersection() {
        let sink = ["VK_KHR_swapchain", "VK_KHR_present_id", "VK_EXT_hdr_metadata", "VK_KHR_maintenance1"];
        let mirrored = filter_device_extensions(&sink);
        assert_eq!(mirrored, vec!["VK_KHR_swapchain", "VK_KHR_present_id"]);
    }

    #[test]
    fn forward_progress_budget_is_bounded_below_by_one() {
        assert_eq!(forward_progress_budget(3, 2), 2);
        assert_eq!(forward_progress_budget(2, 2), 1);
        assert_eq!(forward_progress_budget(1, 4), 1);
    }

    #[test]
    fn acquire_then_present_then_release_cycles_the_image() {
        let mut sc = CrossWsiSwapchain::new(2);
        let idx = sc.acquire(Some(std::time::Duration::from_millis(10))).unwrap();
        assert_eq!(sc.stages[idx as usize], ImageStage::Acquired);
        sc.queue_present(idx).unwrap();
        assert_eq!(sc.stages[idx as usize], ImageStage::Presenting);
        sc.release(idx);
        assert_eq!(sc.stages[idx as usize], ImageStage::Idle);
    }

    #[test]
    fn queue_present_rejects_an_image_not_currently_acquired() {
        let mut sc = CrossWsiSwapchain::new(2);
        assert!(matches!(sc.queue_present(0), Err(CrossWsiError::NotAcquired(0))));
    }

    struct RecordingBackend {
        calls: Vec<&'static str>,
        fail_at: Option<&'static str>,
    }

    impl PresenterBackend for RecordingBackend {
        fn wait_and_reset_source_fence(&mut self, _index: u32) -> Result<(), CrossWsiError> {
            self.step("wait_source_fence")
        }
        fn wait_and_reset_sink_acquire_fence(&mut self, _index: u32) -> Result<(), CrossWsiError> {
            self.step("wait_sink_fence")
        }
        fn submit_sink_copy(&mut self, _index: u32) -> Result<(), CrossWsiError> {
            self.step("submit_sink_copy")
        }
        fn present_sink(&mut self, _index: u32) -> Result<(), CrossWsiError> {
            self.step("present_sink")
        }
        fn acquire_next_sink_image(&mut self) -> Result<(), CrossWsiError> {
            self.step("acquire_next")
        }
    }

    impl RecordingBackend {
        fn step(&mut self, name: &'static str) -> Result<(), CrossWsiError> {
            self.calls.push(name);
            if self.fail_at == Some(name) {
                Err(CrossWsiError::AcquireTimeout)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn presenter_runs_the_five_steps_in_order_and_releases_the_image() {
        let mut sc = CrossWsiSwapchain::new(2);
        let idx = sc.acquire(None).unwrap();
        sc.queue_present(idx).unwrap();

        let mut backend = RecordingBackend { calls: Vec::new(), fail_at: None };
        let step = sc.service_presenter(idx, &mut backend);
        assert_eq!(step, PresenterStep::Presented);
        assert_eq!(backend.calls, vec!["wait_source_fence", "wait_sink_fence", "submit_sink_copy", "present_sink", "acquire_next"]);
        assert_eq!(sc.stages[idx as usize], ImageStage::Idle);
        assert_eq!(sc.processed_source_count(), 1);
    }

    #[test]
    fn presenter_marks_swapchain_failed_on_a_lost_present() {
        let mut sc = CrossWsiSwapchain::new(2);
        let idx = sc.acquire(None).unwrap();
        sc.queue_present(idx).unwrap();

        let mut backend = RecordingBackend { calls: Vec::new(), fail_at: Some("present_sink") };
        let step = sc.service_presenter(idx, &mut backend);
        assert_eq!(step, PresenterStep::Failed);
        assert!(sc.is_failed());

        let mut backend2 = RecordingBackend { calls: Vec::new(), fail_at: None };
        assert_eq!(sc.service_presenter(0, &mut backend2), PresenterStep::Failed);
        assert!(backend2.calls.is_empty());
    }
}
