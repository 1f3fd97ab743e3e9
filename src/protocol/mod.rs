//! The pyro wire protocol (C8 header/control types): the fixed-layout UDP packet header, its bit
//! packed flags/sequence fields, and the TCP control-plane message types that ride alongside it.
//!
//! Grounded on spec §4.8 (exact bit layout) and `pyro-server/pyro_server.{hpp,cpp}` /
//! `pyro-client/pyro_client.{hpp,cpp}` (field names, control message set, cookie-seeded sequence
//! split). `pyro_protocol.h` itself -- which would carry the authoritative numeric value of the
//! maximum per-fragment payload size -- was not present in the retrieved source set; 1280 bytes
//! is this crate's own choice (32-byte header + 1280 fits one common-MTU Ethernet frame with UDP
//! headroom to spare), recorded in DESIGN.md rather than lifted from a header we don't have.

pub mod control;
pub mod fragment;

use bitflags::bitflags;
use static_assertions::assert_eq_size;
use thiserror::Error;

/// Maximum bytes of compressed media carried by one UDP fragment (excluding [`PacketHeader`]).
pub const MAX_FRAGMENT_PAYLOAD: usize = 1280;

/// 14-bit packet sequence space, 6-bit sub-packet sequence space (spec §4.8).
pub const PACKET_SEQ_BITS: u32 = 14;
pub const SUBPACKET_SEQ_BITS: u32 = 6;
pub const PACKET_SEQ_MASK: u32 = (1 << PACKET_SEQ_BITS) - 1;
pub const SUBPACKET_SEQ_MASK: u32 = (1 << SUBPACKET_SEQ_BITS) - 1;

const BEGIN_BIT: u32 = 1 << 0;
const DONE_BIT: u32 = 1 << 1;
const FEC_BIT: u32 = 1 << 2;
const KEY_FRAME_BIT: u32 = 1 << 3;
const STREAM_TYPE_BIT: u32 = 1 << 4;
const SUBSEQ_OFFSET: u32 = 5;
const SEQ_OFFSET: u32 = SUBSEQ_OFFSET + SUBPACKET_SEQ_BITS;

/// Sign-extend the low `bits` bits of `value` and widen to `i32`, the modular-delta trick the
/// 14-bit packet sequence and 6-bit sub-packet sequence both rely on (spec §9: "implementations
/// must take care to sign-extend the ... delta into a signed integer before comparison").
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// `b`-relative signed delta of `a` in a `bits`-wide modular sequence space.
fn modular_delta(a: u32, b: u32, bits: u32) -> i32 {
    let mask = (1u32 << bits) - 1;
    sign_extend(a.wrapping_sub(b) & mask, bits)
}

pub fn packet_seq_delta(a: u32, b: u32) -> i32 {
    modular_delta(a, b, PACKET_SEQ_BITS)
}

pub fn subpacket_seq_delta(a: u32, b: u32) -> i32 {
    modular_delta(a, b, SUBPACKET_SEQ_BITS)
}

/// Which of the two per-client streams a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// The fixed 32-byte header prefixing every UDP fragment (spec §4.8).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub encoded: u32,
    pub pts_lo: u32,
    pub pts_hi: u32,
    pub dts_delta: u32,
    pub payload_size: u32,
    pub num_xor_blocks_even: u32,
    pub num_xor_blocks_odd: u32,
    pub num_fec_blocks: u32,
}

assert_eq_size!(PacketHeader, [u8; 32]);

impl PacketHeader {
    pub fn is_begin(&self) -> bool {
        self.encoded & BEGIN_BIT != 0
    }

    pub fn set_begin(&mut self, on: bool) {
        self.set_bit(BEGIN_BIT, on);
    }

    pub fn is_done(&self) -> bool {
        self.encoded & DONE_BIT != 0
    }

    pub fn set_done(&mut self, on: bool) {
        self.set_bit(DONE_BIT, on);
    }

    pub fn is_fec(&self) -> bool {
        self.encoded & FEC_BIT != 0
    }

    pub fn set_fec(&mut self, on: bool) {
        self.set_bit(FEC_BIT, on);
    }

    pub fn is_key_frame(&self) -> bool {
        self.encoded & KEY_FRAME_BIT != 0
    }

    pub fn set_key_frame(&mut self, on: bool) {
        self.set_bit(KEY_FRAME_BIT, on);
    }

    pub fn stream_kind(&self) -> StreamKind {
        if self.encoded & STREAM_TYPE_BIT != 0 {
            StreamKind::Audio
        } else {
            StreamKind::Video
        }
    }

    pub fn set_stream_kind(&mut self, kind: StreamKind) {
        self.set_bit(STREAM_TYPE_BIT, matches!(kind, StreamKind::Audio));
    }

    pub fn packet_seq(&self) -> u32 {
        (self.encoded >> SEQ_OFFSET) & PACKET_SEQ_MASK
    }

    pub fn set_packet_seq(&mut self, seq: u32) {
        self.encoded &= !(PACKET_SEQ_MASK << SEQ_OFFSET);
        self.encoded |= (seq & PACKET_SEQ_MASK) << SEQ_OFFSET;
    }

    pub fn subpacket_seq(&self) -> u32 {
        (self.encoded >> SUBSEQ_OFFSET) & SUBPACKET_SEQ_MASK
    }

    pub fn set_subpacket_seq(&mut self, seq: u32) {
        self.encoded &= !(SUBPACKET_SEQ_MASK << SUBSEQ_OFFSET);
        self.encoded |= (seq & SUBPACKET_SEQ_MASK) << SUBSEQ_OFFSET;
    }

    pub fn pts_us(&self) -> u64 {
        (u64::from(self.pts_hi) << 32) | u64::from(self.pts_lo)
    }

    pub fn set_pts_us(&mut self, pts_us: u64) {
        self.pts_lo = pts_us as u32;
        self.pts_hi = (pts_us >> 32) as u32;
    }

    fn set_bit(&mut self, bit: u32, on: bool) {
        if on {
            self.encoded |= bit;
        } else {
            self.encoded &= !bit;
        }
    }

    /// Raw wire bytes of this header, native-endian (both ends of this protocol run on the same
    /// architecture family), mirroring the `wire_bytes` helper in [`crate::ipc::message`].
    pub fn as_bytes(&self) -> [u8; 32] {
        unsafe { std::mem::transmute(*self) }
    }
}

/// The cookie-derived initial sequence split (spec §4.8 "new detail"): video and audio start on
/// complementary points in the sequence space so a client can tell the streams apart even before
/// the first fragment of either arrives.
pub fn initial_seq_from_cookie(cookie: u64, stream: StreamKind) -> u32 {
    match stream {
        StreamKind::Video => (cookie as u32) & PACKET_SEQ_MASK,
        StreamKind::Audio => (!cookie as u32) & PACKET_SEQ_MASK,
    }
}

/// TCP/UDP control-plane message discriminant (spec §6, `pyro_message_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PyroMessageType {
    Hello = 0,
    Cookie = 1,
    Kick = 2,
    Progress = 3,
    CodecParameters = 4,
    Again = 5,
    Nak = 6,
    /// UDP-only: client reports a phase correction for C10's tick controller.
    PhaseOffset = 7,
    /// UDP-only: round-trip latency probe, echoed back by the server.
    Ping = 8,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid pyro message type tag {0}")]
    InvalidMessageType(u32),
    #[error("control message too short: need {need}, have {have}")]
    Truncated { need: usize, have: usize },
}

impl PyroMessageType {
    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => Self::Hello,
            1 => Self::Cookie,
            2 => Self::Kick,
            3 => Self::Progress,
            4 => Self::CodecParameters,
            5 => Self::Again,
            6 => Self::Nak,
            7 => Self::PhaseOffset,
            8 => Self::Ping,
            other => return Err(ProtocolError::InvalidMessageType(other)),
        })
    }
}

bitflags! {
    /// Which media/control the client is asking for (spec §6 KICK payload).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PyroKickStateFlags: u32 {
        const VIDEO = 1 << 0;
        const AUDIO = 1 << 1;
        const GAMEPAD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PyroVideoCodec {
    None = 0,
    H264 = 1,
    H265 = 2,
    Av1 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PyroAudioCodec {
    None = 0,
    Opus = 1,
    Pcm = 2,
}

/// Negotiated codec descriptors exchanged via `CodecParameters` (spec §3 "new detail").
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParameters {
    pub video_codec: PyroVideoCodec,
    pub video_width: u32,
    pub video_height: u32,
    pub video_frame_rate_num: u32,
    pub video_frame_rate_den: u32,
    pub audio_codec: PyroAudioCodec,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
}

impl Default for CodecParameters {
    fn default() -> Self {
        CodecParameters {
            video_codec: PyroVideoCodec::None,
            video_width: 0,
            video_height: 0,
            video_frame_rate_num: 0,
            video_frame_rate_den: 0,
            audio_codec: PyroAudioCodec::None,
            audio_sample_rate: 0,
            audio_channels: 0,
        }
    }
}

/// Per-client progress counters (spec §4.8 "Progress feedback"), reported over TCP at most once
/// a second and used by the server both as a keepalive and as FEC/IDR feedback.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressReport {
    pub total_received_packets: u64,
    pub total_dropped_video_packets: u64,
    pub total_dropped_audio_packets: u64,
    pub total_received_key_frames: u64,
    pub total_recovered_by_fec: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_flags_and_sequences() {
        let mut h = PacketHeader::default();
        h.set_begin(true);
        h.set_done(false);
        h.set_fec(true);
        h.set_key_frame(true);
        h.set_stream_kind(StreamKind::Audio);
        h.set_packet_seq(12345);
        h.set_subpacket_seq(37);
        h.set_pts_us(0x1_2345_6789);

        assert!(h.is_begin());
        assert!(!h.is_done());
        assert!(h.is_fec());
        assert!(h.is_key_frame());
        assert_eq!(h.stream_kind(), StreamKind::Audio);
        assert_eq!(h.packet_seq(), 12345);
        assert_eq!(h.subpacket_seq(), 37);
        assert_eq!(h.pts_us(), 0x1_2345_6789);
    }

    #[test]
    fn packet_seq_delta_wraps_at_14_bits() {
        let max = PACKET_SEQ_MASK;
        assert_eq!(packet_seq_delta(0, max), 1);
        assert_eq!(packet_seq_delta(max, 0), -1);
        assert_eq!(packet_seq_delta(5, 3), 2);
        assert_eq!(packet_seq_delta(3, 5), -2);
    }

    #[test]
    fn subpacket_seq_delta_wraps_at_6_bits() {
        let max = SUBPACKET_SEQ_MASK;
        assert_eq!(subpacket_seq_delta(0, max), 1);
        assert_eq!(subpacket_seq_delta(max, 0), -1);
    }

    #[test]
    fn cookie_splits_video_and_audio_seeds() {
        let cookie = 0xdead_beef_0000_1234u64;
        let video = initial_seq_from_cookie(cookie, StreamKind::Video);
        let audio = initial_seq_from_cookie(cookie, StreamKind::Audio);
        assert_eq!(video, (cookie as u32) & PACKET_SEQ_MASK);
        assert_eq!(audio, (!cookie as u32) & PACKET_SEQ_MASK);
        assert_ne!(video, audio);
    }
}
