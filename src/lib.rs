//! Capture and redistribution of GPU-produced swapchain imagery.
//!
//! PyroFling intercepts an application's presented swapchain images, hands them to a
//! separate server process over a local socket, and has that server composite, encode, and
//! fragment them out to any number of network clients with a rateless-FEC UDP transport. The
//! subsystems that make up the crate:
//!
//! - [`handle`]: the move-only OS descriptor owner (C1) used everywhere a file descriptor
//!   changes hands.
//! - [`ipc`]: the framed message codec (C2), the sequenced-socket client session (C3), and the
//!   event-loop dispatcher (C4) that the capture layer and the server both build on.
//! - [`capture`] (C5, the WSI interposition layer): diverts presents into an externally shared
//!   image pool and negotiates their handoff with the server, without changing the application's
//!   present-wait semantics.
//! - [`cross_wsi`] (C6): lets the application render on one GPU while the real swapchain surface
//!   lives on another, staging frames through shared host memory.
//! - [`fec`] (C7): the rateless XOR-parity codec used to recover lost UDP fragments.
//! - [`protocol`] (C8): the TCP control-plane messages and the UDP packet fragmenter/reassembler.
//! - [`server`] (C9/C10): the streaming server's image-group and frame-state bookkeeping, encode
//!   scheduling, and the virtual-vblank phase controller.
//! - [`env`]: environment-variable configuration shared by the capture and cross-WSI layers.
//!
//! Actual Vulkan object creation, import, and command recording (image/memory/semaphore/fence
//! lifetimes, barriers, submissions) are driven directly through `ash` at the call sites that
//! need them; per spec §1 the Vulkan driver and loader are an out-of-scope collaborator consumed
//! via its published function-table dispatch, not reimplemented here.
//!
//! See `SPEC_FULL.md` and `DESIGN.md` in the repository root for the full component breakdown
//! and the rationale behind each module's shape.

#[macro_use]
extern crate log;

pub mod capture;
pub mod cross_wsi;
pub mod env;
pub mod fec;
pub mod handle;
pub mod ipc;
pub mod protocol;
pub mod server;