//! The streaming server (C9): the `HandlerFactory` the dispatcher (C4) drives, wiring together the
//! device registry, per-connection state machines, the virtual vblank, and the encode/present
//! backends.
//!
//! Grounded on `pyro-server/pyro_server.{hpp,cpp}`'s `PyroStreamServer` -- the single object that
//! owns every producer and viewer and is driven once per vblank -- and on
//! [`crate::ipc::dispatcher::Dispatcher`] for the ownership shape: rather than a factory holding a
//! back-reference to the dispatcher, [`StreamingServer`] lives in its own `Rc<RefCell<_>>` and the
//! dispatcher only ever holds it as a `Box<dyn HandlerFactory>` (spec §9 "cyclic lifecycle").

pub mod backend;
pub mod connection;
pub mod device;
pub mod encode;
pub mod image_group;
pub mod stream;
pub mod tick;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Instant;

use clap::Parser;

use crate::ipc::dispatcher::RemoteAddress;
use crate::ipc::{send_udp_datagram, Handler, HandlerFactory};
use crate::protocol::{self, initial_seq_from_cookie, CodecParameters, PyroAudioCodec, PyroVideoCodec, StreamKind};

use backend::{NullPresentBackend, PresentBackend};
use connection::{ProducerConnection, ViewerConnection};
use device::DeviceRegistry;
use encode::{EncodeOutcome, EncoderBackend, NullEncoderBackend};
use stream::{Cookie, HandshakeResponse, HandshakeState, IdrPolicy};
use tick::{TickError, TimerBackend, VirtualVblank};

/// CLI surface for the `pyrofling-server` binary (spec §6 "Server CLI"), doubling as the
/// configuration `StreamingServer` is built from -- the same one-struct-is-both-things shape
/// [`crate::env::CaptureConfig`] uses for the capture layer's environment variables.
#[derive(Parser, Debug, Clone)]
#[command(name = "pyrofling-server", about = "Capture, encode, and redistribute a GPU swapchain")]
pub struct ServerConfig {
    /// Local IPC socket producers connect to (spec §4.1). Matches [`crate::ipc::DEFAULT_SOCKET_PATH`].
    #[arg(long, default_value = "/tmp/pyrofling-socket")]
    pub socket: PathBuf,
    /// TCP/UDP port viewers connect to (spec §6).
    #[arg(long, default_value_t = 6680)]
    pub port: u16,
    #[arg(long, default_value_t = 1920)]
    pub width: u32,
    #[arg(long, default_value_t = 1080)]
    pub height: u32,
    #[arg(long, default_value_t = 60)]
    pub fps: u32,
    /// Emit one encoded frame every N vblanks (spec §4.9 "Client rate multiplier").
    #[arg(long, default_value_t = 1)]
    pub client_rate_multiplier: u32,
    /// Pin capture to one enumerated physical device instead of matching the client's claim.
    #[arg(long)]
    pub device_index: Option<u32>,
    #[arg(long, default_value_t = 4)]
    pub threads: u32,
    #[arg(long, default_value = "medium")]
    pub preset: String,
    #[arg(long, default_value = "zerolatency")]
    pub tune: String,
    #[arg(long, default_value_t = 2)]
    pub gop_seconds: u32,
    #[arg(long, default_value_t = 20_000)]
    pub bitrate_kbits: u32,
    #[arg(long, default_value_t = 30_000)]
    pub max_bitrate_kbits: u32,
    #[arg(long, default_value_t = 40_000)]
    pub vbv_size_kbits: u32,
    /// Also mux a local copy of the stream to this path, alongside redistributing it.
    #[arg(long)]
    pub local_backup: Option<PathBuf>,
    #[arg(long, default_value = "h264")]
    pub encoder: String,
    #[arg(long, default_value = "mpegts")]
    pub muxer: String,
    #[arg(long, default_value_t = 48_000)]
    pub audio_rate: u32,
    #[arg(long, default_value_t = false)]
    pub low_latency: bool,
    #[arg(long, default_value_t = false)]
    pub no_audio: bool,
    #[arg(long, default_value_t = false)]
    pub immediate_encode: bool,
    /// Where to redistribute the stream, e.g. `udp://0.0.0.0:6681` (spec §6).
    pub output: Option<String>,
}

fn codec_params_from_config(config: &ServerConfig) -> CodecParameters {
    let video_codec = match config.encoder.to_ascii_lowercase().as_str() {
        s if s.contains("265") || s.contains("hevc") => PyroVideoCodec::H265,
        s if s.contains("av1") => PyroVideoCodec::Av1,
        _ => PyroVideoCodec::H264,
    };
    CodecParameters {
        video_codec,
        video_width: config.width,
        video_height: config.height,
        video_frame_rate_num: config.fps,
        video_frame_rate_den: 1,
        audio_codec: if config.no_audio { PyroAudioCodec::None } else { PyroAudioCodec::Opus },
        audio_sample_rate: if config.no_audio { 0 } else { config.audio_rate },
        audio_channels: if config.no_audio { 0 } else { 2 },
    }
}

/// Decode the self-chosen raw UDP control framing: `[u8 kind][u64 cookie][payload]`. Grounded in
/// the same reasoning as [`crate::protocol::control`]'s TCP framing -- `pyro_protocol.h` isn't in
/// the retrieved source, so `PhaseOffset`/`Ping` (the two message types the TCP framing explicitly
/// rejects as "UDP-only") get their own minimal framing here instead of a guessed original one.
/// Recorded in DESIGN.md.
mod udp_wire {
    pub const COOKIE_ECHO: u8 = 0;
    pub const PHASE_OFFSET: u8 = 1;
    pub const PING: u8 = 2;

    pub fn decode(data: &[u8]) -> Option<(u8, u64, &[u8])> {
        if data.len() < 9 {
            return None;
        }
        let kind = data[0];
        let cookie = u64::from_ne_bytes(data[1..9].try_into().ok()?);
        Some((kind, cookie, &data[9..]))
    }
}

/// The single object driving every connected producer and viewer (spec §4.9, §4.10). Lives inside
/// an `Rc<RefCell<_>>`; [`ProducerConnection`]/[`ViewerConnection`]/[`VblankHandler`] each hold a
/// [`Weak`] reference back to it rather than the other way around.
pub struct StreamingServer {
    config: ServerConfig,
    devices: DeviceRegistry,
    self_weak: Weak<RefCell<StreamingServer>>,
    producers: HashMap<u64, Rc<RefCell<ProducerConnection>>>,
    viewers: HashMap<u64, Rc<RefCell<ViewerConnection>>>,
    next_producer_id: u64,
    next_viewer_id: u64,
    cookie_seed: u64,
    vblank: VirtualVblank,
    idr_policy: IdrPolicy,
    encode_scheduler: encode::EncodeScheduler,
    encoder_backend: Box<dyn EncoderBackend>,
    codec_params: CodecParameters,
    present_backend: Box<dyn PresentBackend>,
    video_senders: HashMap<u64, protocol::fragment::Sender>,
    audio_senders: HashMap<u64, protocol::fragment::Sender>,
    udp_fd: Option<RawFd>,
    accumulated_pts_us: u64,
    started: Instant,
}

impl StreamingServer {
    pub fn new(config: ServerConfig, devices: DeviceRegistry) -> Self {
        let codec_params = codec_params_from_config(&config);
        let period_ns = 1_000_000_000u64 / config.fps.max(1) as u64;
        let client_rate_multiplier = config.client_rate_multiplier;
        // Mixed into every viewer's cookie (spec §6: "the server picks a cookie at connect time").
        // Not security-sensitive -- a cookie only needs to disambiguate UDP senders during the
        // handshake (spec §8) -- so process start time is a sufficient, dependency-free seed.
        let cookie_seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed_1234);

        StreamingServer {
            config,
            devices,
            self_weak: Weak::new(),
            producers: HashMap::new(),
            viewers: HashMap::new(),
            next_producer_id: 0,
            next_viewer_id: 0,
            cookie_seed,
            vblank: VirtualVblank::new(period_ns),
            idr_policy: IdrPolicy::new(),
            encode_scheduler: encode::EncodeScheduler::new(client_rate_multiplier),
            encoder_backend: Box::new(NullEncoderBackend),
            codec_params,
            present_backend: Box::new(NullPresentBackend),
            video_senders: HashMap::new(),
            audio_senders: HashMap::new(),
            udp_fd: None,
            accumulated_pts_us: 0,
            started: Instant::now(),
        }
    }

    /// Must be called once right after `Rc::new(RefCell::new(server))`, so every connection this
    /// server hands out can carry a [`Weak`] reference back to it.
    pub fn set_self_weak(&mut self, weak: Weak<RefCell<StreamingServer>>) {
        self.self_weak = weak;
    }

    pub fn set_present_backend(&mut self, backend: Box<dyn PresentBackend>) {
        self.present_backend = backend;
    }

    pub fn set_encoder_backend(&mut self, backend: Box<dyn EncoderBackend>) {
        self.encoder_backend = backend;
    }

    pub fn set_udp_native_handle(&mut self, fd: Option<RawFd>) {
        self.udp_fd = fd;
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn present_backend_mut(&mut self) -> &mut dyn PresentBackend {
        self.present_backend.as_mut()
    }

    /// Current virtual-vblank tick count, the time unit [`image_group::ServerImageGroup`] derives
    /// target timestamps in (spec §4.9 "Target timestamp derivation").
    pub fn current_timestamp(&self) -> u64 {
        self.vblank.tick_count()
    }

    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn make_cookie(&self, id: u64) -> Cookie {
        self.cookie_seed ^ id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    pub fn register_producer(&mut self, fd: RawFd) -> Option<Rc<RefCell<dyn Handler>>> {
        let id = self.next_producer_id;
        self.next_producer_id += 1;
        let conn = Rc::new(RefCell::new(ProducerConnection::new(id, fd, self.self_weak.clone())));
        self.producers.insert(id, conn.clone());
        log::info!("producer {id} connected");
        Some(conn)
    }

    pub fn register_viewer(&mut self, fd: RawFd, _tcp_remote: RemoteAddress) -> Option<Rc<RefCell<dyn Handler>>> {
        let id = self.next_viewer_id;
        self.next_viewer_id += 1;
        let cookie = self.make_cookie(id);
        let now_ms = self.now_ms();
        let conn = Rc::new(RefCell::new(ViewerConnection::new(id, fd, cookie, now_ms, self.self_weak.clone())));
        // The server's codec parameters are fixed at startup from `ServerConfig`, not negotiated
        // per client, so this half of the handshake gate is always satisfied immediately.
        conn.borrow_mut().stream_mut().on_codec_negotiated();
        self.viewers.insert(id, conn.clone());
        log::info!("viewer {id} connected, cookie={cookie:#x}");
        Some(conn)
    }

    pub fn handle_udp_datagram(&mut self, remote: &RemoteAddress, data: &[u8]) {
        let Some((kind, cookie, rest)) = udp_wire::decode(data) else {
            return;
        };
        let Some(viewer) = self.viewers.values().find(|v| v.borrow().stream().cookie == cookie).cloned() else {
            log::debug!("udp datagram with unrecognized cookie {cookie:#x}, dropping (spec §8)");
            return;
        };

        match kind {
            udp_wire::COOKIE_ECHO => {
                let mut v = viewer.borrow_mut();
                if v.stream_mut().on_udp_cookie_echo(cookie) {
                    v.set_udp_remote(remote.clone());
                }
            }
            udp_wire::PHASE_OFFSET if rest.len() >= 4 => {
                let offset = i32::from_ne_bytes(rest[0..4].try_into().unwrap());
                self.vblank.report_phase_offset(offset);
            }
            udp_wire::PING => {
                if let Some(udp_fd) = self.udp_fd {
                    // Round-trip latency probe: echo the exact datagram back (spec §6 "Ping").
                    send_udp_datagram(udp_fd, remote, data, &[]);
                }
            }
            _ => {}
        }
    }

    /// Advances one viewer's handshake and sends whatever [`stream::ClientStream::poll_handshake`]
    /// says to (spec §6). Called after every batch of control messages a [`ViewerConnection`]
    /// decodes.
    pub fn poll_viewer_handshake(&mut self, id: u64) {
        let Some(conn) = self.viewers.get(&id).cloned() else { return };
        let response = conn.borrow_mut().stream_mut().poll_handshake();
        let fd = conn.borrow().fd();
        match response {
            HandshakeResponse::WaitForClient => {}
            HandshakeResponse::Again => {
                if let Err(e) = protocol::control::write_message(fd, &protocol::control::ControlMessage::Again) {
                    log::warn!("viewer {id}: failed to send AGAIN: {e}");
                }
            }
            HandshakeResponse::CodecParametersAndKick => {
                let msg = protocol::control::ControlMessage::CodecParameters(self.codec_params);
                if let Err(e) = protocol::control::write_message(fd, &msg) {
                    log::warn!("viewer {id}: failed to send CODEC_PARAMETERS: {e}");
                }
                let cookie = conn.borrow().stream().cookie;
                self.video_senders
                    .insert(id, protocol::fragment::Sender::new(StreamKind::Video, initial_seq_from_cookie(cookie, StreamKind::Video), true));
                self.audio_senders
                    .insert(id, protocol::fragment::Sender::new(StreamKind::Audio, initial_seq_from_cookie(cookie, StreamKind::Audio), false));
                log::info!("viewer {id} kicked, media flow active");
            }
        }
    }

    /// A producer's present import/submit finished (spec §4.9 "Present path" step 5, reported by
    /// the real [`PresentBackend`] once its fence-wait task observes completion).
    pub fn on_present_ready(&mut self, producer_id: u64, index: u32) {
        let Some(producer) = self.producers.get(&producer_id) else { return };
        let Some(group) = producer.borrow_mut().image_group_mut() else { return };
        if let Err(e) = group.mark_ready(index) {
            log::warn!("producer {producer_id}: present-ready for image {index} rejected: {e}");
        }
    }

    /// The out-of-scope encoder finished one frame (reported by the real [`EncoderBackend`]);
    /// fragments it and fans it out over UDP to every kicked viewer (spec §4.8 step 2).
    pub fn on_encoded_frame(&mut self, stream: StreamKind, payload: &[u8], pts_us: u64, dts_delta: i32, key_frame: bool) {
        let Some(udp_fd) = self.udp_fd else { return };
        let kicked: Vec<u64> = self
            .viewers
            .iter()
            .filter(|(_, v)| v.borrow().stream().state() == HandshakeState::Kicked)
            .map(|(id, _)| *id)
            .collect();

        for id in kicked {
            let Some(viewer) = self.viewers.get(&id) else { continue };
            let Some(remote) = viewer.borrow().udp_remote().cloned() else { continue };
            let senders = match stream {
                StreamKind::Video => &mut self.video_senders,
                StreamKind::Audio => &mut self.audio_senders,
            };
            let Some(sender) = senders.get_mut(&id) else { continue };
            for fragment in sender.fragment(payload, pts_us, dts_delta, key_frame) {
                send_udp_datagram(udp_fd, &remote, &fragment.header.as_bytes(), &fragment.payload);
            }
        }
    }

    /// One virtual vblank (spec §4.9, §4.10): advance the tick, promote any image group's ready
    /// present, decide whether to force an IDR, and gate the encode scheduler.
    pub fn drive_vblank(&mut self, backend: &mut dyn TimerBackend) -> Result<(), TickError> {
        self.vblank.tick(backend)?;
        let now = self.vblank.tick_count();

        for (producer_id, producer) in self.producers.iter() {
            if let Some(group) = producer.borrow_mut().image_group_mut() {
                let outcome = group.tick(now);
                if outcome.stalled {
                    log::trace!("producer {producer_id} vblank stalled, no ready image due");
                }
                // `outcome.retired` would each need an AcquireImage/RetireImage event sent back to
                // the producer over its IPC connection (spec §4.9 "an AcquireImage/RetireImage
                // pair per obsoleted image") -- left to the real present backend's import path,
                // which is the only collaborator holding the matching acquire semaphore.
            }
        }

        let wants_idr = self.viewers.values().any(|v| {
            let v = v.borrow();
            v.stream().needs_first_idr() || v.stream().loss_pending()
        });
        if self.idr_policy.tick(wants_idr) {
            log::debug!("forcing an IDR this vblank");
        }

        let vblank_us = self.vblank.target_interval_ns() / 1_000;
        let audio_compensation_us = encode::audio_compensation_us(3, 1, vblank_us);
        let pts_us = self.accumulated_pts_us;
        self.accumulated_pts_us += vblank_us;

        match self.encode_scheduler.on_vblank(self.encoder_backend.as_mut(), pts_us, audio_compensation_us) {
            EncodeOutcome::Submitted(slot) => log::trace!("encode submitted on ring slot {slot}"),
            EncodeOutcome::Stalled => log::warn!("encode ring stalled; next slot still running at deadline"),
            EncodeOutcome::Skipped => {}
        }

        let expired: Vec<u64> = self
            .viewers
            .iter()
            .filter(|(_, v)| v.borrow().stream().keepalive_expired(self.started.elapsed().as_millis() as u64))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            // Skip dead clients in the broadcast loop rather than forcing the dispatcher to cancel
            // their connection from here (that would need a back-reference into `Dispatcher`,
            // re-introducing the cycle spec §9 warns about) -- the socket itself is reaped once the
            // OS observes the peer gone, same as every other hung-up connection.
            log::info!("viewer {id} keepalive expired, excluding from encoded frame fan-out");
            self.video_senders.remove(&id);
            self.audio_senders.remove(&id);
        }

        Ok(())
    }

    pub fn remove_producer(&mut self, id: u64) {
        self.producers.remove(&id);
        log::info!("producer {id} disconnected");
    }

    pub fn remove_viewer(&mut self, id: u64) {
        self.viewers.remove(&id);
        self.video_senders.remove(&id);
        self.audio_senders.remove(&id);
        log::info!("viewer {id} disconnected");
    }
}

impl HandlerFactory for Rc<RefCell<StreamingServer>> {
    fn register(&mut self, fd: RawFd) -> Option<Rc<RefCell<dyn Handler>>> {
        self.borrow_mut().register_producer(fd)
    }

    fn add_stream_socket(&mut self, fd: RawFd, remote: RemoteAddress) -> Option<Rc<RefCell<dyn Handler>>> {
        self.borrow_mut().register_viewer(fd, remote)
    }

    fn handle_udp_datagram(&mut self, remote: &RemoteAddress, data: &[u8]) {
        self.borrow_mut().handle_udp_datagram(remote, data)
    }
}

/// Thin [`Handler`] adapter driving [`StreamingServer::drive_vblank`] off a registered timerfd
/// (spec §4.10), the same shape as [`ProducerConnection`]/[`ViewerConnection`]: a [`Weak`]
/// reference to the server rather than the other way around.
pub struct VblankHandler {
    server: Weak<RefCell<StreamingServer>>,
    backend: tick::TimerFdBackend,
}

impl VblankHandler {
    pub fn new(server: Weak<RefCell<StreamingServer>>, backend: tick::TimerFdBackend) -> Self {
        VblankHandler { server, backend }
    }

    pub fn native_handle(&self) -> RawFd {
        self.backend.native_handle()
    }
}

impl Handler for VblankHandler {
    fn handle(&mut self, _fd: RawFd, _id: u32) -> bool {
        let Some(server) = self.server.upgrade() else { return false };
        match server.borrow_mut().drive_vblank(&mut self.backend) {
            Ok(()) => true,
            Err(e) => {
                log::error!("vblank timer failed: {e}");
                false
            }
        }
    }

    fn release_id(&mut self, _id: u32) {}
}
