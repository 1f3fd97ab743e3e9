//! Framed message codec (C2): wire header, typed payload schemas, and the `send`/`parse` pair
//! that move them across the local `SOCK_SEQPACKET` connection, with attached file descriptors
//! carried as `SCM_RIGHTS` ancillary data.
//!
//! Grounded on `ipc/messages.{hpp,cpp}` in the original implementation. Every failure mode here
//! is fatal to the connection that observed it -- the far side is assumed cooperating (spec §7).

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

use crate::handle::FileHandle;

/// Fixed 64-bit constant identifying a well-formed header.
pub const MAGIC: u64 = 0x7538_244a_bd12_2f9f;
/// High bit of `type` marks a message as an asynchronous event rather than a request/reply.
pub const EVENT_FLAG: u32 = 0x8000_0000;
/// Size in bytes of [`RawHeader`] on the wire.
pub const HEADER_SIZE: usize = 32;
/// Largest payload a single message may carry (1024-byte datagram budget minus the header).
pub const MAX_PAYLOAD: usize = 1024 - HEADER_SIZE;
/// Maximum number of file descriptors attached to a single datagram via `SCM_RIGHTS`.
pub const MAX_FDS: usize = 16;

/// Errors from encoding or decoding a framed message. All are fatal to the connection.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("magic mismatch")]
    MagicMismatch,
    #[error("message truncated by the kernel (MSG_TRUNC/MSG_CTRUNC)")]
    Truncated,
    #[error("declared payload length {0} exceeds the datagram budget")]
    PayloadTooLarge(u32),
    #[error("message length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unrecognized message type {0}")]
    UnknownType(u32),
    #[error("message type {0:?} expected payload size {expected}, got {actual}")]
    PayloadSizeMismatch {
        ty: MessageType,
        expected: usize,
        actual: usize,
    },
    #[error("message type {0:?} requires exactly one file descriptor, got {1}")]
    MissingFd(MessageType, usize),
    #[error("message type {0:?} accepts at most one file descriptor, got {1}")]
    TooManyFds(MessageType, usize),
    #[error("too many file descriptors attached ({0}, max {MAX_FDS})")]
    TooManyFdsToSend(usize),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte budget")]
    PayloadTooLargeToSend(usize),
    #[error("peer did not become writable within the timeout; congested")]
    Congested,
    #[error("io error: {0}")]
    Io(#[from] nix::Error),
}

/// Message type tag. The high bit ([`EVENT_FLAG`]) distinguishes asynchronous events
/// (`AcquireImage`, `FrameComplete`, `RetireImage`) from requests/replies.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Void = 0,
    Ok = 1,
    ErrorProtocol = 2,
    Error = 3,
    ErrorParameter = 4,
    EchoPayload = 100,
    Device = 101,
    ImageGroup = 102,
    PresentImage = 103,
    AcquireImage = 104 | EVENT_FLAG,
    FrameComplete = 105 | EVENT_FLAG,
    RetireImage = 106 | EVENT_FLAG,
    ClientHello = 200,
    ServerHello = 201,
}

impl MessageType {
    /// True for `AcquireImage`/`FrameComplete`/`RetireImage`, which arrive with wire serial 0.
    pub fn is_event(self) -> bool {
        (self as u32 & EVENT_FLAG) != 0
    }

    fn from_raw(raw: u32) -> Result<Self, WireError> {
        Ok(match raw {
            0 => Self::Void,
            1 => Self::Ok,
            2 => Self::ErrorProtocol,
            3 => Self::Error,
            4 => Self::ErrorParameter,
            100 => Self::EchoPayload,
            101 => Self::Device,
            102 => Self::ImageGroup,
            103 => Self::PresentImage,
            x if x == MessageType::AcquireImage as u32 => Self::AcquireImage,
            x if x == MessageType::FrameComplete as u32 => Self::FrameComplete,
            x if x == MessageType::RetireImage as u32 => Self::RetireImage,
            200 => Self::ClientHello,
            201 => Self::ServerHello,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// Intent asserted by a client in its `ClientHello`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIntent {
    VulkanExternalStream = 1,
    EchoStream = 2,
}

impl ClientIntent {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::VulkanExternalStream),
            2 => Some(Self::EchoStream),
            _ => None,
        }
    }
}

/// Bits of [`FrameCompleteWire::flags`].
pub mod frame_complete_flags {
    pub const VALID: u32 = 1 << 0;
    pub const DISPLAY_FLIPPING: u32 = 1 << 1;
    pub const DISPLAY_PRIMARY_SURFACE: u32 = 1 << 2;
    pub const CONSUME_EARLY_BLIT: u32 = 1 << 3;
    pub const CONSUME_CROSS_DEVICE: u32 = 1 << 4;
    pub const CONSUME_SAMPLED: u32 = 1 << 5;
    pub const CONSUME_EAGER: u32 = 1 << 6;
    pub const SUBOPTIMAL: u32 = 1 << 7;
    pub const ASYNC_DISPLAY: u32 = 1 << 8;
    pub const DROPPED: u32 = 1 << 9;
    pub const HEADROOM_VALID: u32 = 1 << 10;
    pub const VARIABLE_PERIOD: u32 = 1 << 11;
}

/// A fixed-layout payload schema carried inline in a message. Implementors are plain-old-data
/// structs with no padding, verified at parse time against `size_of::<Self>()`.
pub trait WirePayload: Copy + 'static {
    const TYPE: MessageType;
}

macro_rules! wire_payload {
    ($name:ident, $ty:expr, { $($field:ident : $fty:ty),* $(,)? }) => {
        #[repr(C)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $fty),*
        }

        impl WirePayload for $name {
            const TYPE: MessageType = $ty;
        }
    };
}

wire_payload!(ClientHelloWire, MessageType::ClientHello, {
    intent: u32,
    name: [u8; 256 - 4],
});

impl Default for ClientHelloWire {
    fn default() -> Self {
        // SAFETY: all-zero is a valid bit pattern for this struct (plain integers/bytes).
        unsafe { std::mem::zeroed() }
    }
}

impl ClientHelloWire {
    /// Build a hello payload from an application/engine-derived display name, truncated (and
    /// NUL-terminated) to fit the fixed `name` field.
    pub fn with_name(intent: ClientIntent, name: &str) -> Self {
        let mut wire = Self::default();
        wire.intent = intent as u32;
        let bytes = name.as_bytes();
        let max = wire.name.len() - 1;
        let n = bytes.len().min(max);
        wire.name[..n].copy_from_slice(&bytes[..n]);
        wire
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

wire_payload!(ServerHelloWire, MessageType::ServerHello, {
    version: u32,
    capability: [u32; 15],
});

impl Default for ServerHelloWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(DeviceWire, MessageType::Device, {
    device_uuid: [u8; 16],
    driver_uuid: [u8; 16],
    luid: [u8; 8],
    luid_valid: u32,
});

impl Default for DeviceWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(ImageGroupWire, MessageType::ImageGroup, {
    num_images: u32,
    width: u32,
    height: u32,
    vk_format: u32,
    vk_color_space: u32,
    vk_image_usage: u32,
    vk_image_flags: u32,
    vk_external_memory_type: u32,
    vk_num_view_formats: u32,
    vk_view_formats: [u32; 15],
    drm_modifier: u64,
});

impl Default for ImageGroupWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(PresentImageWire, MessageType::PresentImage, {
    image_group_serial: u64,
    period: u16,
    index: u16,
    vk_external_semaphore_type: u32,
    vk_old_layout: u32,
    vk_new_layout: u32,
    id: u64,
});

impl Default for PresentImageWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(AcquireImageWire, MessageType::AcquireImage, {
    image_group_serial: u64,
    index: u32,
    vk_external_semaphore_type: u32,
});

impl Default for AcquireImageWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(RetireImageWire, MessageType::RetireImage, {
    image_group_serial: u64,
    index: u32,
    padding: u32,
});

impl Default for RetireImageWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

wire_payload!(FrameCompleteWire, MessageType::FrameComplete, {
    image_group_serial: u64,
    timestamp: u64,
    period_ns: u64,
    presented_id: u64,
    flags: u32,
    delayed_count: u32,
    headroom_ns: u64,
});

impl Default for FrameCompleteWire {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

static_assertions::assert_eq_size!(ClientHelloWire, [u8; 256]);
static_assertions::assert_eq_size!(ServerHelloWire, [u8; 64]);
static_assertions::assert_eq_size!(DeviceWire, [u8; 44]);
static_assertions::assert_eq_size!(ImageGroupWire, [u8; 104]);
static_assertions::assert_eq_size!(PresentImageWire, [u8; 32]);
static_assertions::assert_eq_size!(AcquireImageWire, [u8; 16]);
static_assertions::assert_eq_size!(RetireImageWire, [u8; 16]);
static_assertions::assert_eq_size!(FrameCompleteWire, [u8; 48]);

/// Tagged sum over the recognized payload schemas (§3, §6).
#[derive(Debug)]
pub enum MessagePayload {
    Ok,
    ErrorProtocol,
    Error,
    ErrorParameter,
    EchoPayload { fd: FileHandle },
    ClientHello(ClientHelloWire),
    ServerHello(ServerHelloWire),
    Device(DeviceWire),
    ImageGroup { wire: ImageGroupWire, fds: Vec<FileHandle> },
    PresentImage { wire: PresentImageWire, fd: FileHandle },
    AcquireImage { wire: AcquireImageWire, fd: Option<FileHandle> },
    RetireImage(RetireImageWire),
    FrameComplete(FrameCompleteWire),
}

impl MessagePayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessagePayload::Ok => MessageType::Ok,
            MessagePayload::ErrorProtocol => MessageType::ErrorProtocol,
            MessagePayload::Error => MessageType::Error,
            MessagePayload::ErrorParameter => MessageType::ErrorParameter,
            MessagePayload::EchoPayload { .. } => MessageType::EchoPayload,
            MessagePayload::ClientHello(_) => MessageType::ClientHello,
            MessagePayload::ServerHello(_) => MessageType::ServerHello,
            MessagePayload::Device(_) => MessageType::Device,
            MessagePayload::ImageGroup { .. } => MessageType::ImageGroup,
            MessagePayload::PresentImage { .. } => MessageType::PresentImage,
            MessagePayload::AcquireImage { .. } => MessageType::AcquireImage,
            MessagePayload::RetireImage(_) => MessageType::RetireImage,
            MessagePayload::FrameComplete(_) => MessageType::FrameComplete,
        }
    }
}

/// A fully decoded message: its direction-local serial (0 for events) plus payload.
#[derive(Debug)]
pub struct Message {
    pub serial: u64,
    pub payload: MessagePayload,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

fn wire_bytes<T: WirePayload>(wire: &T) -> &[u8] {
    // SAFETY: T is repr(C), Copy, and all of its fields are plain integers/byte arrays with no
    // padding (enforced by the static_assertions size checks above), so any byte pattern is valid
    // and reading it as bytes never observes uninitialized memory.
    unsafe { std::slice::from_raw_parts((wire as *const T).cast::<u8>(), std::mem::size_of::<T>()) }
}

fn read_wire<T: WirePayload>(bytes: &[u8]) -> Result<T, WireError> {
    if bytes.len() != std::mem::size_of::<T>() {
        return Err(WireError::PayloadSizeMismatch {
            ty: T::TYPE,
            expected: std::mem::size_of::<T>(),
            actual: bytes.len(),
        });
    }
    // SAFETY: size checked above; T has no alignment requirements stricter than u64 and we read
    // unaligned, so any byte content is a valid T.
    Ok(unsafe { (bytes.as_ptr().cast::<T>()).read_unaligned() })
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawHeader {
    magic: u64,
    serial: u64,
    ty: u32,
    payload_len: u32,
    reserved: u64,
}

static_assertions::assert_eq_size!(RawHeader, [u8; HEADER_SIZE]);

/// Poll `fd` writable for up to 1s, then send `type`/`serial`/`payload` with `fds` attached as
/// `SCM_RIGHTS`. Returns `Ok(true)` on full delivery, `Ok(false)` on a post-poll `EAGAIN`
/// (logged, not an error: the caller treats this as a failed send, not an error to propagate).
pub fn send(
    fd: RawFd,
    ty: MessageType,
    serial: u64,
    payload: &[u8],
    fds: &[RawFd],
) -> Result<bool, WireError> {
    if fds.len() > MAX_FDS {
        return Err(WireError::TooManyFdsToSend(fds.len()));
    }
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLargeToSend(payload.len()));
    }

    let mut fds_poll = [PollFd::new(fd, PollFlags::POLLOUT)];
    let n = poll(&mut fds_poll, 1000)?;
    if n == 0 || !fds_poll[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLOUT) {
        return Err(WireError::Congested);
    }

    let header = RawHeader {
        magic: MAGIC,
        serial,
        ty: ty as u32,
        payload_len: payload.len() as u32,
        reserved: 0,
    };
    let header_bytes =
        unsafe { std::slice::from_raw_parts((&header as *const RawHeader).cast::<u8>(), HEADER_SIZE) };

    let mut iov = vec![IoSlice::new(header_bytes)];
    if !payload.is_empty() {
        iov.push(IoSlice::new(payload));
    }

    let cmsgs = if !fds.is_empty() {
        vec![ControlMessage::ScmRights(fds)]
    } else {
        Vec::new()
    };

    let total = HEADER_SIZE + payload.len();
    match sendmsg::<nix::sys::socket::UnixAddr>(fd, &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
        Ok(sent) => Ok(sent == total),
        Err(nix::Error::EAGAIN) => {
            log::warn!("non-blocking write failed with EAGAIN after a ready poll; clogged pipe?");
            Ok(false)
        }
        Err(e) => Err(WireError::Io(e)),
    }
}

/// Send a message carrying a typed wire payload (no attached FDs).
pub fn send_wire<T: WirePayload>(fd: RawFd, serial: u64, wire: &T) -> Result<bool, WireError> {
    send(fd, T::TYPE, serial, wire_bytes(wire), &[])
}

/// Send a message carrying a typed wire payload plus attached FDs.
pub fn send_wire_with_fds<T: WirePayload>(
    fd: RawFd,
    serial: u64,
    wire: &T,
    fds: &[RawFd],
) -> Result<bool, WireError> {
    send(fd, T::TYPE, serial, wire_bytes(wire), fds)
}

/// Send a message with no payload and no descriptors (`OK`, `Error`, ...).
pub fn send_plain(fd: RawFd, ty: MessageType, serial: u64) -> Result<bool, WireError> {
    send(fd, ty, serial, &[], &[])
}

/// Receive one datagram and decode it into a [`Message`], along with any descriptors
/// carried by `SCM_RIGHTS`. Fails on magic mismatch, length mismatch, OS-reported truncation,
/// an unrecognized type, or an FD-count mismatch for the decoded type.
pub fn parse(fd: RawFd) -> Result<Message, WireError> {
    let mut buf = [0u8; 1024];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<nix::sys::socket::UnixAddr>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())?;

    let mut received_fds: Vec<FileHandle> = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(rights) = cmsg {
            for raw in rights {
                received_fds.push(FileHandle::new(raw).map_err(|_| WireError::Truncated)?);
            }
        }
    }

    let total = msg.bytes;
    if total < HEADER_SIZE {
        return Err(WireError::LengthMismatch {
            expected: HEADER_SIZE,
            actual: total,
        });
    }

    let header: RawHeader =
        unsafe { (buf.as_ptr().cast::<RawHeader>()).read_unaligned() };

    if header.magic != MAGIC {
        return Err(WireError::MagicMismatch);
    }

    if header.payload_len as usize > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(header.payload_len));
    }

    if total != HEADER_SIZE + header.payload_len as usize {
        return Err(WireError::LengthMismatch {
            expected: HEADER_SIZE + header.payload_len as usize,
            actual: total,
        });
    }

    if msg.flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
        return Err(WireError::Truncated);
    }

    let payload_bytes = &buf[HEADER_SIZE..HEADER_SIZE + header.payload_len as usize];
    let ty = MessageType::from_raw(header.ty)?;

    let payload = decode_payload(ty, payload_bytes, received_fds)?;

    Ok(Message {
        serial: header.serial,
        payload,
    })
}

fn take_single_fd(ty: MessageType, mut fds: Vec<FileHandle>) -> Result<FileHandle, WireError> {
    if fds.len() != 1 {
        return Err(WireError::MissingFd(ty, fds.len()));
    }
    Ok(fds.pop().unwrap())
}

fn take_optional_fd(ty: MessageType, mut fds: Vec<FileHandle>) -> Result<Option<FileHandle>, WireError> {
    if fds.len() > 1 {
        return Err(WireError::TooManyFds(ty, fds.len()));
    }
    Ok(fds.pop())
}

fn decode_payload(
    ty: MessageType,
    bytes: &[u8],
    fds: Vec<FileHandle>,
) -> Result<MessagePayload, WireError> {
    Ok(match ty {
        MessageType::Void => return Err(WireError::UnknownType(0)),
        MessageType::Ok => MessagePayload::Ok,
        MessageType::ErrorProtocol => MessagePayload::ErrorProtocol,
        MessageType::Error => MessagePayload::Error,
        MessageType::ErrorParameter => MessagePayload::ErrorParameter,
        MessageType::EchoPayload => {
            if !bytes.is_empty() {
                return Err(WireError::PayloadSizeMismatch {
                    ty,
                    expected: 0,
                    actual: bytes.len(),
                });
            }
            MessagePayload::EchoPayload {
                fd: take_single_fd(ty, fds)?,
            }
        }
        MessageType::ClientHello => MessagePayload::ClientHello(read_wire(bytes)?),
        MessageType::ServerHello => MessagePayload::ServerHello(read_wire(bytes)?),
        MessageType::Device => MessagePayload::Device(read_wire(bytes)?),
        MessageType::ImageGroup => MessagePayload::ImageGroup {
            wire: read_wire(bytes)?,
            fds,
        },
        MessageType::PresentImage => MessagePayload::PresentImage {
            wire: read_wire(bytes)?,
            fd: take_single_fd(ty, fds)?,
        },
        MessageType::AcquireImage => MessagePayload::AcquireImage {
            wire: read_wire(bytes)?,
            fd: take_optional_fd(ty, fds)?,
        },
        MessageType::RetireImage => MessagePayload::RetireImage(read_wire(bytes)?),
        MessageType::FrameComplete => MessagePayload::FrameComplete(read_wire(bytes)?),
    })
}

/// Relative timeout in nanoseconds to a `poll(2)` timeout in milliseconds, per the cooperative
/// session's wait contract: values larger than `i32::MAX` milliseconds collapse to infinite (-1).
pub fn timeout_ns_to_poll_ms(timeout_ns: u64) -> i32 {
    let ms = Duration::from_nanos(timeout_ns).as_millis();
    if ms > i32::MAX as u128 {
        -1
    } else {
        ms as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_event_flag() {
        assert!(MessageType::AcquireImage.is_event());
        assert!(MessageType::FrameComplete.is_event());
        assert!(MessageType::RetireImage.is_event());
        assert!(!MessageType::PresentImage.is_event());
        assert!(!MessageType::Ok.is_event());
    }

    #[test]
    fn from_raw_roundtrips_event_types() {
        assert_eq!(
            MessageType::from_raw(MessageType::AcquireImage as u32).unwrap(),
            MessageType::AcquireImage
        );
        assert!(MessageType::from_raw(0xdead_beef).is_err());
    }

    #[test]
    fn client_hello_name_roundtrip() {
        let wire = ClientHelloWire::with_name(ClientIntent::VulkanExternalStream, "my game");
        assert_eq!(wire.name(), "my game");
        assert_eq!(wire.intent, ClientIntent::VulkanExternalStream as u32);
    }

    #[test]
    fn client_hello_name_truncates() {
        let long = "x".repeat(1000);
        let wire = ClientHelloWire::with_name(ClientIntent::EchoStream, &long);
        assert_eq!(wire.name().len(), 256 - 4 - 1);
    }

    #[test]
    fn send_parse_roundtrip_over_seqpacket_socketpair() {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        let wire = PresentImageWire {
            image_group_serial: 7,
            period: 1,
            index: 2,
            vk_external_semaphore_type: 1,
            vk_old_layout: 0,
            vk_new_layout: 5,
            id: 42,
        };
        let (r, w) = nix::unistd::pipe().unwrap();
        let ok = send_wire_with_fds(a, 3, &wire, &[r]).unwrap();
        assert!(ok);
        let msg = parse(b).unwrap();
        assert_eq!(msg.serial, 3);
        match msg.payload {
            MessagePayload::PresentImage { wire: got, fd } => {
                assert_eq!(got, wire);
                assert!(fd.is_valid());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        let _ = nix::unistd::close(w);
        let _ = nix::unistd::close(a);
        let _ = nix::unistd::close(b);
    }

    #[test]
    fn plain_message_roundtrip() {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        send_plain(a, MessageType::Ok, 1).unwrap();
        let msg = parse(b).unwrap();
        assert_eq!(msg.serial, 1);
        assert!(matches!(msg.payload, MessagePayload::Ok));
        let _ = nix::unistd::close(a);
        let _ = nix::unistd::close(b);
    }
}
