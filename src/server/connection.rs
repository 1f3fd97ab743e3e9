//! Per-connection [`Handler`] implementations (C9): a local `SOCK_SEQPACKET` producer (the
//! capture layer on the other end) and a TCP/UDP viewer.
//!
//! Grounded on `pyro-server/pyro_server.cpp`'s `PyroStreamConnection`/`PyroStreamViewer` split and
//! styled after [`crate::capture::CaptureState`]: each connection struct is a thin Handler shim
//! around the pure state machines in [`crate::server::image_group`] and [`crate::server::stream`],
//! reaching back into [`StreamingServer`](super::StreamingServer) through a non-owning [`Weak`]
//! reference (spec §9 "cyclic lifecycle") rather than the other way around.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Weak;

use crate::handle::FileHandle;
use crate::ipc::dispatcher::RemoteAddress;
use crate::ipc::message::{self, ClientIntent, MessagePayload, MessageType};
use crate::ipc::{Handler, Message};
use crate::protocol::control::{self, ControlMessage};
use crate::server::device::DeviceClaim;
use crate::server::image_group::ServerImageGroup;
use crate::server::stream::{ClientStream, Cookie, StreamCounters};

use super::StreamingServer;

/// Server-side bookkeeping for one producer's local IPC connection (spec §4.5/§4.9): the
/// handshake it has completed so far, the image memory it last handed over, and its current
/// image group generation.
pub struct ProducerConnection {
    id: u64,
    fd: RawFd,
    server: Weak<RefCell<StreamingServer>>,
    intent: Option<ClientIntent>,
    matched_device: Option<u32>,
    /// Per-image memory/sync handles from the most recent `ImageGroup` message. Held onto so a
    /// future `PresentImage` fd (carried per-present) is the only additional descriptor needed;
    /// dropping a stale group's fds (on a new `ImageGroup` or on disconnect) closes them.
    image_fds: Vec<FileHandle>,
    image_group: Option<ServerImageGroup>,
}

impl ProducerConnection {
    pub fn new(id: u64, fd: RawFd, server: Weak<RefCell<StreamingServer>>) -> Self {
        ProducerConnection {
            id,
            fd,
            server,
            intent: None,
            matched_device: None,
            image_fds: Vec::new(),
            image_group: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn image_group_mut(&mut self) -> Option<&mut ServerImageGroup> {
        self.image_group.as_mut()
    }

    pub fn image_group(&self) -> Option<&ServerImageGroup> {
        self.image_group.as_ref()
    }

    fn dispatch(&mut self, msg: Message) -> bool {
        let serial = msg.serial;
        match msg.payload {
            MessagePayload::ClientHello(wire) => self.on_client_hello(serial, wire),
            MessagePayload::Device(wire) => self.on_device(serial, wire),
            MessagePayload::ImageGroup { wire, fds } => self.on_image_group(serial, wire, fds),
            MessagePayload::PresentImage { wire, fd } => self.on_present_image(serial, wire, fd),
            MessagePayload::EchoPayload { fd } => self.on_echo_payload(serial, fd),
            // These three only ever flow server -> client; a producer sending one is a protocol
            // violation fatal to the connection (spec §7: "every failure mode here is fatal").
            MessagePayload::AcquireImage { .. } | MessagePayload::FrameComplete(_) | MessagePayload::RetireImage(_) => {
                log::warn!("producer {} sent a server-to-client event type", self.id);
                false
            }
            MessagePayload::Ok
            | MessagePayload::Error
            | MessagePayload::ErrorProtocol
            | MessagePayload::ErrorParameter
            | MessagePayload::ServerHello(_) => {
                log::warn!("producer {} sent a reply-only message type", self.id);
                false
            }
        }
    }

    fn on_client_hello(&mut self, serial: u64, wire: message::ClientHelloWire) -> bool {
        let Some(intent) = ClientIntent::from_raw(wire.intent) else {
            let _ = message::send_plain(self.fd, MessageType::ErrorParameter, serial);
            return false;
        };
        log::info!("producer {} hello: intent={:?} name={:?}", self.id, intent, wire.name());
        self.intent = Some(intent);
        let reply = message::ServerHelloWire {
            version: 1,
            capability: [0; 15],
        };
        matches!(message::send_wire(self.fd, serial, &reply), Ok(true))
    }

    fn on_device(&mut self, serial: u64, wire: message::DeviceWire) -> bool {
        let claim = DeviceClaim {
            device_uuid: wire.device_uuid,
            driver_uuid: wire.driver_uuid,
            luid: (wire.luid_valid != 0).then_some(wire.luid),
        };
        let Some(server) = self.server.upgrade() else { return false };
        let matched = server.borrow().devices().match_claim(&claim).map(|d| d.index);
        match matched {
            Some(index) => {
                self.matched_device = Some(index);
                matches!(message::send_plain(self.fd, MessageType::Ok, serial), Ok(true))
            }
            None => {
                let _ = message::send_plain(self.fd, MessageType::ErrorParameter, serial);
                false
            }
        }
    }

    /// Spec §4.9 open question resolved here: `PresentImageWire::image_group_serial` is keyed to
    /// the IPC message serial of the `ImageGroup` request that created that generation, not a
    /// separately-allocated counter -- the wire schema has no other channel to hand the client a
    /// server-chosen serial, and both sides derive the same value from the request they already
    /// agree on (the client from the serial it assigned when it sent the request, the server from
    /// the header it just parsed).
    fn on_image_group(&mut self, serial: u64, wire: message::ImageGroupWire, fds: Vec<FileHandle>) -> bool {
        self.image_fds = fds;
        self.image_group = Some(ServerImageGroup::new(serial, wire.width, wire.height, wire.num_images, false));
        log::info!(
            "producer {} image group {serial}: {}x{}, {} images",
            self.id,
            wire.width,
            wire.height,
            wire.num_images
        );
        matches!(message::send_plain(self.fd, MessageType::Ok, serial), Ok(true))
    }

    fn on_present_image(&mut self, serial: u64, wire: message::PresentImageWire, fd: FileHandle) -> bool {
        let Some(server) = self.server.upgrade() else { return false };
        let now = server.borrow().current_timestamp();
        let Some(group) = self.image_group.as_mut() else {
            let _ = message::send_plain(self.fd, MessageType::ErrorProtocol, serial);
            return false;
        };
        match group.handle_present(wire.image_group_serial, wire.index as u32, wire.id, wire.period as u32, now) {
            Ok(_target_timestamp) => {
                let mut server = server.borrow_mut();
                if let Err(e) = server.present_backend_mut().import_and_submit(
                    self.id,
                    wire.image_group_serial,
                    wire.index as u32,
                    wire.id,
                    fd,
                    None,
                ) {
                    log::warn!("producer {} present import failed: {e}", self.id);
                }
                matches!(message::send_plain(self.fd, MessageType::Ok, serial), Ok(true))
            }
            Err(e) => {
                log::warn!("producer {} present rejected: {e}", self.id);
                let _ = message::send_plain(self.fd, MessageType::ErrorParameter, serial);
                false
            }
        }
    }

    /// Loops the descriptor straight back (spec §1's "example echo server" conformance path,
    /// exercised by the `pyrofling-echo` binary): the client's `EchoPayload` intent exists purely
    /// to exercise the fd-passing plumbing end to end without a real Vulkan producer attached.
    fn on_echo_payload(&mut self, serial: u64, fd: FileHandle) -> bool {
        matches!(message::send(self.fd, MessageType::EchoPayload, serial, &[], &[fd.native_handle()]), Ok(true))
    }
}

impl Handler for ProducerConnection {
    fn handle(&mut self, fd: RawFd, _id: u32) -> bool {
        match message::parse(fd) {
            Ok(msg) => self.dispatch(msg),
            Err(e) => {
                log::warn!("producer {} wire error: {e}", self.id);
                false
            }
        }
    }

    fn release_id(&mut self, _id: u32) {
        if let Some(server) = self.server.upgrade() {
            server.borrow_mut().remove_producer(self.id);
        }
    }
}

/// Server-side bookkeeping for one viewer's TCP control connection plus its (once learned) UDP
/// remote address (spec §6 "Client handshake").
pub struct ViewerConnection {
    id: u64,
    fd: RawFd,
    server: Weak<RefCell<StreamingServer>>,
    buf: Vec<u8>,
    stream: ClientStream,
    udp_remote: Option<RemoteAddress>,
}

impl ViewerConnection {
    /// Sends the initial `Cookie` message immediately (spec §6: "the server picks a cookie at
    /// connect time and sends it before anything else").
    pub fn new(id: u64, fd: RawFd, cookie: Cookie, connect_ms: u64, server: Weak<RefCell<StreamingServer>>) -> Self {
        if let Err(e) = control::write_message(fd, &ControlMessage::Cookie(cookie)) {
            log::warn!("viewer {id}: failed to send initial cookie: {e}");
        }
        ViewerConnection {
            id,
            fd,
            server,
            buf: Vec::new(),
            stream: ClientStream::new(cookie, connect_ms),
            udp_remote: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn stream(&self) -> &ClientStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut ClientStream {
        &mut self.stream
    }

    pub fn udp_remote(&self) -> Option<&RemoteAddress> {
        self.udp_remote.as_ref()
    }

    pub fn set_udp_remote(&mut self, addr: RemoteAddress) {
        self.udp_remote = Some(addr);
    }

    fn dispatch(&mut self, msg: ControlMessage, now_ms: u64) {
        match msg {
            ControlMessage::Kick(flags) => self.stream.on_kick(flags),
            ControlMessage::Progress { stream, report } => {
                let counters = StreamCounters {
                    total_received: report.total_received_packets,
                    total_dropped: match stream {
                        crate::protocol::StreamKind::Video => report.total_dropped_video_packets,
                        crate::protocol::StreamKind::Audio => report.total_dropped_audio_packets,
                    },
                    total_key_frames_received: report.total_received_key_frames,
                    total_recovered_by_fec: report.total_recovered_by_fec,
                };
                self.stream.on_progress_report(stream, counters, now_ms);
            }
            ControlMessage::Hello | ControlMessage::Cookie(_) | ControlMessage::CodecParameters(_) | ControlMessage::Again | ControlMessage::Nak => {
                log::warn!("viewer {} sent a server-to-client control message {:?}", self.id, msg);
            }
        }
    }
}

impl Handler for ViewerConnection {
    fn handle(&mut self, fd: RawFd, _id: u32) -> bool {
        match control::fill_from_socket(fd, &mut self.buf) {
            Ok(0) => return false,
            Ok(n) if n == usize::MAX => {}
            Ok(_) => {}
            Err(e) => {
                log::warn!("viewer {} read error: {e}", self.id);
                return false;
            }
        }

        let now_ms = self.server.upgrade().map(|s| s.borrow().now_ms()).unwrap_or(0);
        loop {
            match control::decode_one(&mut self.buf) {
                Ok(Some(msg)) => self.dispatch(msg, now_ms),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("viewer {} control framing error: {e}", self.id);
                    return false;
                }
            }
        }

        if let Some(server) = self.server.upgrade() {
            server.borrow_mut().poll_viewer_handshake(self.id);
        }
        true
    }

    fn release_id(&mut self, _id: u32) {
        if let Some(server) = self.server.upgrade() {
            server.borrow_mut().remove_viewer(self.id);
        }
    }
}
