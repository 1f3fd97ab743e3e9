//! Tick/phase controller (C10): a monotonic virtual vblank, phase-nudgeable by client feedback.
//!
//! Grounded on spec §4.10 and `pyro-server/pyro_server.cpp` (`PyroStreamServer::set_phase_offset`,
//! the tick timer rearm logic). The timer itself sits behind [`TimerBackend`] the same way C6's
//! presenter sequencing sits behind `PresenterBackend` (`crate::cross_wsi`) -- the nudge arithmetic
//! is unit tested against a fake clock, and [`TimerFdBackend`] is the real `timerfd(2)`-driven
//! implementation the server binary wires up.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use thiserror::Error;

/// `timebase_ns_fraction` from spec §3: one nudge unit is 1/10000 of the nominal period.
const TIMEBASE_FRACTION: u64 = 10_000;
/// Bound on `tick_interval_offset`, in nudge units (spec §3, §8 invariant 7): ±1% total drift.
const MAX_OFFSET_UNITS: i32 = 100;
/// Below this magnitude of accumulated phase-offset feedback, the controller does not nudge at
/// all (spec §4.10: "nudges the timer when `|offset| >= 500us`").
const NUDGE_THRESHOLD_US: i32 = 500;

#[derive(Error, Debug)]
pub enum TickError {
    #[error("timerfd syscall failed: {0}")]
    Errno(#[from] nix::Error),
}

/// Seam between the phase-nudge arithmetic and the actual interval timer, so the arithmetic in
/// [`VirtualVblank`] can be exercised without a real `timerfd`.
pub trait TimerBackend {
    /// Arm the timer for the first expiration after `initial_ns`, recurring every `interval_ns`.
    fn arm(&mut self, initial_ns: u64, interval_ns: u64) -> Result<(), TickError>;
    /// Rearm only the recurring interval (and the next single expiration), preserving the
    /// timer's phase as closely as the kernel allows -- this is what a nudge calls every tick.
    fn rearm(&mut self, next_ns: u64, interval_ns: u64) -> Result<(), TickError>;
    /// Block for the next expiration. Returns the number of expirations the kernel coalesced
    /// into this wakeup (spec §4.10: "kernel reports coalesced expirations"); always `>= 1`.
    fn wait(&mut self) -> Result<u64, TickError>;
}

/// Virtual vblank state (spec §3 "Virtual vblank state", §4.10).
pub struct VirtualVblank {
    timebase_ns: u64,
    /// Bounded to `[-100, +100]` (spec §3, §8 invariant 7).
    tick_interval_offset: i32,
    /// Accumulated phase-offset feedback from clients, in microseconds. Fed by
    /// [`VirtualVblank::report_phase_offset`] (a UDP `PhaseOffset` control message) and drained
    /// once per tick.
    phase_offset_us: AtomicI32,
    /// Monotonically increasing tick counter, used for the client-rate-multiplier gate (spec
    /// §4.9 "client rate multiplier") and IDR rate limiting (spec §4.8 "IDR policy").
    tick_count: u64,
    /// Consecutive stalled heartbeats: ticks where the kernel reported more than one coalesced
    /// expiration (spec §4.10's "each missed expiration beyond the first").
    pub stalled_heartbeats: u64,
}

impl VirtualVblank {
    pub fn new(timebase_ns: u64) -> Self {
        VirtualVblank {
            timebase_ns,
            tick_interval_offset: 0,
            phase_offset_us: AtomicI32::new(0),
            tick_count: 0,
            stalled_heartbeats: 0,
        }
    }

    /// One nudge unit, `timebase_ns / 10000` (spec §3 `timebase_ns_fraction`).
    fn nudge_unit_ns(&self) -> i64 {
        (self.timebase_ns / TIMEBASE_FRACTION) as i64
    }

    /// Current effective period (`target_interval_ns`), after applying the accumulated offset.
    pub fn target_interval_ns(&self) -> u64 {
        (self.timebase_ns as i64 + self.tick_interval_offset as i64 * self.nudge_unit_ns()).max(1) as u64
    }

    pub fn tick_interval_offset(&self) -> i32 {
        self.tick_interval_offset
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Client feedback: accumulate a signed microsecond phase correction (spec §4.10,
    /// `PyroStreamServer::set_phase_offset`'s `fetch_add`). Safe to call concurrently with a
    /// tick in progress; the accumulation is drained, not read, by [`VirtualVblank::nudge`].
    pub fn report_phase_offset(&self, offset_us: i32) {
        self.phase_offset_us.fetch_add(offset_us, Ordering::Relaxed);
    }

    /// Drain the accumulated offset and, if its magnitude clears the threshold, nudge
    /// `tick_interval_offset` by one unit in the appropriate direction, clamped to
    /// `[-100, +100]`. Returns the (possibly unchanged) new target interval.
    pub fn nudge(&mut self) -> u64 {
        let offset = self.phase_offset_us.swap(0, Ordering::Relaxed);
        if offset.unsigned_abs() as i32 >= NUDGE_THRESHOLD_US {
            let delta = if offset > 0 { 1 } else { -1 };
            self.tick_interval_offset = (self.tick_interval_offset + delta).clamp(-MAX_OFFSET_UNITS, MAX_OFFSET_UNITS);
        }
        self.target_interval_ns()
    }

    /// Drive one tick against `backend`: nudge, rearm the timer's interval to match, then block
    /// for the next expiration. Returns the number of coalesced expirations (spec §4.10).
    pub fn tick(&mut self, backend: &mut dyn TimerBackend) -> Result<u64, TickError> {
        let interval = self.nudge();
        backend.rearm(interval, interval)?;
        let expirations = backend.wait()?;
        self.tick_count += 1;
        if expirations > 1 {
            self.stalled_heartbeats += expirations - 1;
        }
        Ok(expirations)
    }
}

/// Real `timerfd(2)`-backed implementation, driven directly through `libc` the way
/// `ipc::dispatcher` drives `signal(2)` -- nix 0.26 (this crate's pinned version) does not yet
/// expose a `timerfd` wrapper.
pub struct TimerFdBackend {
    fd: crate::handle::FileHandle,
}

impl TimerFdBackend {
    pub fn new() -> Result<Self, TickError> {
        let raw = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if raw < 0 {
            return Err(TickError::Errno(nix::Error::last()));
        }
        Ok(TimerFdBackend {
            fd: crate::handle::FileHandle::new(raw).map_err(|_| TickError::Errno(nix::Error::EBADF))?,
        })
    }

    pub fn native_handle(&self) -> RawFd {
        self.fd.native_handle()
    }

    /// Duplicate the underlying timerfd descriptor so the dispatcher can own a registration handle
    /// independent of the one this backend reads expirations from (`dup(2)` shares the same open
    /// file description, so registering the duplicate with epoll still observes this backend's
    /// reads draining readiness).
    pub fn try_clone(&self) -> Result<crate::handle::FileHandle, TickError> {
        self.fd.dup().map_err(|_| TickError::Errno(nix::Error::EBADF))
    }

    fn settime(&self, initial_ns: u64, interval_ns: u64) -> Result<(), TickError> {
        let spec = libc::itimerspec {
            it_interval: ns_to_timespec(interval_ns),
            it_value: ns_to_timespec(initial_ns.max(1)),
        };
        let ret = unsafe { libc::timerfd_settime(self.fd.native_handle(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(TickError::Errno(nix::Error::last()));
        }
        Ok(())
    }
}

fn ns_to_timespec(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (ns % 1_000_000_000) as i64,
    }
}

impl TimerBackend for TimerFdBackend {
    fn arm(&mut self, initial_ns: u64, interval_ns: u64) -> Result<(), TickError> {
        self.settime(initial_ns, interval_ns)
    }

    fn rearm(&mut self, next_ns: u64, interval_ns: u64) -> Result<(), TickError> {
        self.settime(next_ns, interval_ns)
    }

    /// `EINTR` is treated as "no expirations yet" (spec §5: "`EINTR` is treated as success"),
    /// matching the dispatcher's own epoll loop.
    fn wait(&mut self) -> Result<u64, TickError> {
        loop {
            let mut buf = [0u8; 8];
            let mut pfd = [nix::poll::PollFd::new(self.fd.native_handle(), nix::poll::PollFlags::POLLIN)];
            match nix::poll::poll(&mut pfd, -1) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(TickError::Errno(e)),
            }
            match nix::unistd::read(self.fd.native_handle(), &mut buf) {
                Ok(8) => return Ok(u64::from_ne_bytes(buf)),
                Ok(_) => continue,
                Err(nix::Error::EINTR | nix::Error::EAGAIN) => continue,
                Err(e) => return Err(TickError::Errno(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTimer {
        interval_ns: u64,
        expirations_per_wait: u64,
    }

    impl TimerBackend for FakeTimer {
        fn arm(&mut self, _initial_ns: u64, interval_ns: u64) -> Result<(), TickError> {
            self.interval_ns = interval_ns;
            Ok(())
        }

        fn rearm(&mut self, _next_ns: u64, interval_ns: u64) -> Result<(), TickError> {
            self.interval_ns = interval_ns;
            Ok(())
        }

        fn wait(&mut self) -> Result<u64, TickError> {
            Ok(self.expirations_per_wait)
        }
    }

    #[test]
    fn no_nudge_below_threshold() {
        let mut vb = VirtualVblank::new(16_666_667);
        vb.report_phase_offset(100);
        vb.nudge();
        assert_eq!(vb.tick_interval_offset(), 0);
    }

    #[test]
    fn e6_sustained_positive_offset_ramps_to_cap() {
        // spec §8 E6: +2ms sustained offset over 10 ticks reaches +10, capped at 100.
        let mut vb = VirtualVblank::new(16_666_667);
        for i in 1..=10 {
            vb.report_phase_offset(2_000);
            vb.nudge();
            assert_eq!(vb.tick_interval_offset(), i);
        }
        assert_eq!(vb.tick_interval_offset(), 10);

        let mut backend = FakeTimer { interval_ns: 0, expirations_per_wait: 1 };
        let before = vb.target_interval_ns();
        vb.tick(&mut backend).unwrap();
        assert_eq!(backend.interval_ns, before);
    }

    #[test]
    fn offset_is_bounded_at_100_units() {
        let mut vb = VirtualVblank::new(16_666_667);
        for _ in 0..500 {
            vb.report_phase_offset(2_000);
            vb.nudge();
        }
        assert_eq!(vb.tick_interval_offset(), MAX_OFFSET_UNITS);
    }

    #[test]
    fn negative_offset_shrinks_interval() {
        let mut vb = VirtualVblank::new(16_666_667);
        vb.report_phase_offset(-2_000);
        vb.nudge();
        assert_eq!(vb.tick_interval_offset(), -1);
        assert!(vb.target_interval_ns() < 16_666_667);
    }

    #[test]
    fn stalled_heartbeats_count_coalesced_expirations_beyond_the_first() {
        let mut vb = VirtualVblank::new(16_666_667);
        let mut backend = FakeTimer { interval_ns: 0, expirations_per_wait: 3 };
        vb.tick(&mut backend).unwrap();
        assert_eq!(vb.stalled_heartbeats, 2);
        assert_eq!(vb.tick_count(), 1);
    }
}
