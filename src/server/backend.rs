//! Server-side Vulkan I/O seam (C9 "Present path" steps 2-5), grounded on spec §4.9 and styled
//! after [`crate::server::tick::TimerBackend`]: importing a producer's exported image memory into
//! the server's own device, issuing the barrier/blit/sample work, and reporting the submission's
//! fence back are all out-of-scope collaborators (spec §1), so [`StreamingServer`](super::StreamingServer)
//! only ever talks to them through this trait.

use thiserror::Error;

use crate::handle::FileHandle;

#[derive(Error, Debug)]
pub enum PresentBackendError {
    #[error("failed to import or submit presented image: {0}")]
    ImportFailed(String),
}

/// What the host application does with one accepted `PresentImage` (spec §4.9 "Present path"):
/// import `image_fd` (and, if present, the matching release `semaphore_fd`) into its own device,
/// and submit whatever work turns it into encoder input. Completion is reported back
/// asynchronously through [`crate::server::StreamingServer::on_present_ready`] once the backend's
/// own fence-wait task observes the submission finish -- this trait's method only needs to
/// *start* the work, matching the spec's "per-image thread-pool task" being a separate step from
/// admission.
pub trait PresentBackend {
    #[allow(clippy::too_many_arguments)]
    fn import_and_submit(
        &mut self,
        producer_id: u64,
        serial: u64,
        index: u32,
        present_id: u64,
        image_fd: FileHandle,
        semaphore_fd: Option<FileHandle>,
    ) -> Result<(), PresentBackendError>;
}

/// Accepts every present without ever importing anything or reporting completion. Keeps the
/// dispatcher/protocol plumbing runnable headless, the same role [`NullEncoderBackend`]
/// (`crate::server::encode`) plays for the encode side.
#[derive(Default)]
pub struct NullPresentBackend;

impl PresentBackend for NullPresentBackend {
    fn import_and_submit(
        &mut self,
        _producer_id: u64,
        _serial: u64,
        _index: u32,
        _present_id: u64,
        _image_fd: FileHandle,
        _semaphore_fd: Option<FileHandle>,
    ) -> Result<(), PresentBackendError> {
        Ok(())
    }
}
