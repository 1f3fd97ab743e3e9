//! Per-client TCP/UDP handshake and streaming bookkeeping (C9), grounded on spec §6 "Client
//! handshake" and §4.8 "Progress feedback" / "IDR policy". Like [`crate::server::image_group`],
//! this tracks only the bookkeeping: the actual TCP/UDP sockets, codec negotiation, and the
//! encoder are collaborators supplied by the caller (spec §1 "out of scope").

use crate::protocol::{PyroKickStateFlags, StreamKind};

/// Cookie chosen at connect time (spec §6, §4.8 "Cookies selected at connect time seed the
/// initial sequence differently per stream" -- see [`crate::protocol::initial_seq_from_cookie`]).
pub type Cookie = u64;

/// Keepalive window: a client is dropped if no `PROGRESS` report arrives within this long (spec
/// §5 "Present wait on the server has a 15 s keepalive timer rearmed on every PROGRESS report").
pub const KEEPALIVE_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Sent `COOKIE`, waiting for the client to echo it over UDP and send `KICK`.
    AwaitingUdpAndKick,
    /// Both conditions observed but codec parameters are not yet negotiated; responds `AGAIN`.
    AwaitingCodecParameters,
    /// `CODEC_PARAMETERS` sent, client marked kicked, media flow active.
    Kicked,
}

/// What the server should send in response to the client's current handshake progress (spec §6:
/// "Server responds AGAIN until it has both the UDP remote and valid codec parameters, then
/// CODEC_PARAMETERS; marks the client KICKED and requests an IDR").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResponse {
    /// Nothing new to send yet (still waiting on UDP echo or `KICK`).
    WaitForClient,
    Again,
    /// Transition just happened this call; the caller should send `CODEC_PARAMETERS` and request
    /// an IDR exactly once.
    CodecParametersAndKick,
}

/// Per-stream counters reported by a `PROGRESS` message (spec §4.8).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub total_received: u64,
    pub total_dropped: u64,
    pub total_key_frames_received: u64,
    pub total_recovered_by_fec: u64,
}

/// One connected client's handshake/streaming state.
#[derive(Debug, Clone)]
pub struct ClientStream {
    pub cookie: Cookie,
    state: HandshakeState,
    udp_echoed: bool,
    codec_negotiated: bool,
    kick_flags: Option<PyroKickStateFlags>,
    video: StreamCounters,
    audio: StreamCounters,
    last_progress_ms: u64,
    /// Set until the client's first key frame is acknowledged (spec §4.8 "IDR policy": "any
    /// client has not yet received any key frame").
    needs_first_idr: bool,
    /// Set by a `PROGRESS` report implying loss, cleared once an IDR is forced (spec §4.8:
    /// "packet loss pending").
    loss_pending: bool,
}

impl ClientStream {
    pub fn new(cookie: Cookie, connect_ms: u64) -> Self {
        ClientStream {
            cookie,
            state: HandshakeState::AwaitingUdpAndKick,
            udp_echoed: false,
            codec_negotiated: false,
            kick_flags: None,
            video: StreamCounters::default(),
            audio: StreamCounters::default(),
            last_progress_ms: connect_ms,
            needs_first_idr: true,
            loss_pending: false,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The client's cookie arrived over UDP, letting the server record its UDP remote address
    /// (spec §6: "Client echoes the cookie over UDP to let the server record its UDP remote
    /// address"). Returns whether the cookie matched this client (spec §8: "A client whose UDP
    /// datagram cookie does not match any connected cookie is ignored").
    pub fn on_udp_cookie_echo(&mut self, cookie: Cookie) -> bool {
        if cookie != self.cookie {
            return false;
        }
        self.udp_echoed = true;
        true
    }

    pub fn on_kick(&mut self, flags: PyroKickStateFlags) {
        self.kick_flags = Some(flags);
    }

    pub fn on_codec_negotiated(&mut self) {
        self.codec_negotiated = true;
    }

    /// Advances the handshake state machine and reports what the server should send next.
    pub fn poll_handshake(&mut self) -> HandshakeResponse {
        if self.state == HandshakeState::Kicked {
            return HandshakeResponse::WaitForClient;
        }
        if self.kick_flags.is_none() {
            return HandshakeResponse::WaitForClient;
        }
        if !self.udp_echoed || !self.codec_negotiated {
            self.state = HandshakeState::AwaitingCodecParameters;
            return HandshakeResponse::Again;
        }
        self.state = HandshakeState::Kicked;
        HandshakeResponse::CodecParametersAndKick
    }

    /// Folds in one `PROGRESS` report (spec §4.8): rearms the keepalive, updates counters, and
    /// updates the IDR-policy flags.
    pub fn on_progress_report(&mut self, stream: StreamKind, counters: StreamCounters, now_ms: u64) {
        self.last_progress_ms = now_ms;
        match stream {
            StreamKind::Video => self.video = counters,
            StreamKind::Audio => self.audio = counters,
        }
        if counters.total_key_frames_received > 0 {
            self.needs_first_idr = false;
        }
        self.loss_pending = counters.total_dropped > 0;
    }

    pub fn needs_first_idr(&self) -> bool {
        self.needs_first_idr
    }

    pub fn loss_pending(&self) -> bool {
        self.loss_pending
    }

    pub fn video_counters(&self) -> StreamCounters {
        self.video
    }

    pub fn audio_counters(&self) -> StreamCounters {
        self.audio
    }

    /// Spec §8: "A session that exceeds 15 s between PROGRESS reports is dropped."
    pub fn keepalive_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_progress_ms) > KEEPALIVE_MS
    }
}

/// Server-wide IDR rate limiter (spec §4.8 "IDR policy", SPEC_FULL §4.9 "new detail": tracked via
/// a relaxed `idr_counter`, rate-limited to once per 60 ticks).
#[derive(Debug, Clone)]
pub struct IdrPolicy {
    idr_counter: u64,
}

impl IdrPolicy {
    pub const RATE_LIMIT_TICKS: u64 = 60;

    pub fn new() -> Self {
        IdrPolicy { idr_counter: Self::RATE_LIMIT_TICKS }
    }

    /// Called once per vblank. `wants_idr` is `any client needs_first_idr() || (loss_pending()
    /// && idr_on_loss)` computed by the caller over all connected clients.
    pub fn tick(&mut self, wants_idr: bool) -> bool {
        self.idr_counter += 1;
        if wants_idr && self.idr_counter >= Self::RATE_LIMIT_TICKS {
            self.idr_counter = 0;
            return true;
        }
        false
    }
}

impl Default for IdrPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_cookie_mismatch_is_ignored() {
        let mut c = ClientStream::new(42, 0);
        assert!(!c.on_udp_cookie_echo(1));
        assert!(c.on_udp_cookie_echo(42));
    }

    #[test]
    fn handshake_waits_for_all_three_conditions() {
        let mut c = ClientStream::new(1, 0);
        assert_eq!(c.poll_handshake(), HandshakeResponse::WaitForClient);

        c.on_kick(PyroKickStateFlags::VIDEO);
        assert_eq!(c.poll_handshake(), HandshakeResponse::Again);

        c.on_udp_cookie_echo(1);
        assert_eq!(c.poll_handshake(), HandshakeResponse::Again);

        c.on_codec_negotiated();
        assert_eq!(c.poll_handshake(), HandshakeResponse::CodecParametersAndKick);
        assert_eq!(c.state(), HandshakeState::Kicked);
        assert_eq!(c.poll_handshake(), HandshakeResponse::WaitForClient);
    }

    #[test]
    fn progress_report_clears_needs_first_idr_once_a_key_frame_lands() {
        let mut c = ClientStream::new(1, 0);
        assert!(c.needs_first_idr());
        c.on_progress_report(
            StreamKind::Video,
            StreamCounters { total_key_frames_received: 1, ..Default::default() },
            1_000,
        );
        assert!(!c.needs_first_idr());
    }

    #[test]
    fn keepalive_expires_after_15_seconds_without_progress() {
        let c = ClientStream::new(1, 0);
        assert!(!c.keepalive_expired(14_999));
        assert!(c.keepalive_expired(15_001));
    }

    #[test]
    fn idr_policy_rate_limits_to_once_per_60_ticks() {
        let mut policy = IdrPolicy::new();
        let mut forced = 0;
        for _ in 0..180 {
            if policy.tick(true) {
                forced += 1;
            }
        }
        assert_eq!(forced, 3);
    }

    #[test]
    fn idr_policy_does_not_fire_when_nothing_wants_it() {
        let mut policy = IdrPolicy::new();
        for _ in 0..200 {
            assert!(!policy.tick(false));
        }
    }
}
