//! Encode task scheduling (C9), grounded on spec §4.9 "Encoding & compositing". The actual
//! encoder is an out-of-scope collaborator (spec §1: "a black box with an `encode_frame(pts)`
//! contract"); this module only tracks the dependency-chained ring of in-flight encode tasks and
//! the client-rate-multiplier gate.

/// "Up to 8 tasks run concurrently in a ring" (spec §4.9).
pub const RING_SIZE: usize = 8;

/// What the out-of-scope encoder does with one scheduled frame.
pub trait EncoderBackend {
    fn encode_frame(&mut self, slot: usize, pts_us: u64, audio_compensation_us: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    /// The client rate multiplier gate was not satisfied this vblank.
    Skipped,
    /// An encode task was dispatched into this ring slot.
    Submitted(usize),
    /// The next ring slot's task from a prior round was still running at this vblank's deadline
    /// (spec §4.9: "if the next slot is still running at deadline, the vblank is counted as
    /// stalled").
    Stalled,
}

/// Audio PTS compensation so that audio stays aligned with video queued earlier (spec §4.9:
/// `(num_images - 1) * period * vblank_us`).
pub fn audio_compensation_us(num_images: u32, period: u32, vblank_us: u64) -> i64 {
    (num_images.saturating_sub(1) as i64) * period as i64 * vblank_us as i64
}

/// Encoder backend that never calls back with bytes. Lets the dispatcher/protocol plumbing run
/// headless (`pyrofling-echo`, unit tests) without a real encoder wired in.
#[derive(Default)]
pub struct NullEncoderBackend;

impl EncoderBackend for NullEncoderBackend {
    fn encode_frame(&mut self, _slot: usize, _pts_us: u64, _audio_compensation_us: i64) {}
}

/// Dependency-chained ring of encode tasks plus the client-rate-multiplier gate (spec §4.9
/// "Client rate multiplier": "each encoder frame is emitted after `client_rate_multiplier`
/// vblanks"). Task N+1's submission implicitly depends on task N completing only insofar as it
/// reuses the same ring slot -- the backend is responsible for the actual submit-order fence
/// chain (spec §5 "Encode tasks strictly follow submission order via explicit dependencies").
pub struct EncodeScheduler {
    running: [bool; RING_SIZE],
    next_slot: usize,
    vblank_count: u64,
    client_rate_multiplier: u32,
    pub stalled_vblanks: u64,
}

impl EncodeScheduler {
    pub fn new(client_rate_multiplier: u32) -> Self {
        EncodeScheduler {
            running: [false; RING_SIZE],
            next_slot: 0,
            vblank_count: 0,
            client_rate_multiplier: client_rate_multiplier.max(1),
            stalled_vblanks: 0,
        }
    }

    /// Called once per virtual vblank. Dispatches an encode task to `backend` if this vblank
    /// clears the client-rate-multiplier gate and the next ring slot is free.
    pub fn on_vblank(&mut self, backend: &mut dyn EncoderBackend, pts_us: u64, audio_compensation_us: i64) -> EncodeOutcome {
        self.vblank_count += 1;
        if self.vblank_count % self.client_rate_multiplier as u64 != 0 {
            return EncodeOutcome::Skipped;
        }
        let slot = self.next_slot;
        if self.running[slot] {
            self.stalled_vblanks += 1;
            return EncodeOutcome::Stalled;
        }
        self.running[slot] = true;
        self.next_slot = (slot + 1) % RING_SIZE;
        backend.encode_frame(slot, pts_us, audio_compensation_us);
        EncodeOutcome::Submitted(slot)
    }

    /// The thread-group task for `slot` finished; frees it for reuse.
    pub fn complete(&mut self, slot: usize) {
        self.running[slot] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingBackend {
        calls: Vec<(usize, u64, i64)>,
    }

    impl EncoderBackend for RecordingBackend {
        fn encode_frame(&mut self, slot: usize, pts_us: u64, audio_compensation_us: i64) {
            self.calls.push((slot, pts_us, audio_compensation_us));
        }
    }

    #[test]
    fn client_rate_multiplier_gates_submission() {
        let mut sched = EncodeScheduler::new(3);
        let mut backend = RecordingBackend { calls: vec![] };
        assert_eq!(sched.on_vblank(&mut backend, 0, 0), EncodeOutcome::Skipped);
        assert_eq!(sched.on_vblank(&mut backend, 0, 0), EncodeOutcome::Skipped);
        assert_eq!(sched.on_vblank(&mut backend, 100, 0), EncodeOutcome::Submitted(0));
        assert_eq!(backend.calls, vec![(0, 100, 0)]);
    }

    #[test]
    fn busy_slot_stalls_the_vblank() {
        let mut sched = EncodeScheduler::new(1);
        let mut backend = RecordingBackend { calls: vec![] };
        for slot in 0..RING_SIZE {
            assert_eq!(sched.on_vblank(&mut backend, 0, 0), EncodeOutcome::Submitted(slot));
        }
        // Slot 0 never completed -- the ring has wrapped back around to it.
        assert_eq!(sched.on_vblank(&mut backend, 0, 0), EncodeOutcome::Stalled);
        assert_eq!(sched.stalled_vblanks, 1);

        sched.complete(0);
        assert_eq!(sched.on_vblank(&mut backend, 0, 0), EncodeOutcome::Submitted(0));
    }

    #[test]
    fn audio_compensation_matches_formula() {
        assert_eq!(audio_compensation_us(3, 1, 1000), 2000);
        assert_eq!(audio_compensation_us(1, 1, 1000), 0);
    }
}
