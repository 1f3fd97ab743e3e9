//! Minimal conformance client for the `EchoStream` intent (spec §1 "example echo server"):
//! connects to a running `pyrofling-server`, sends `CLIENT_HELLO` with `EchoStream`, then hands an
//! eventfd across with `ECHO_PAYLOAD` and checks the server loops the same descriptor back.
//!
//! Grounded on `pyro-client/pyro_client.cpp`'s connection bootstrap for the handshake shape, and on
//! [`pyrofling::ipc::session::Session`] for how a client drives replies without a reader thread.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};

use pyrofling::handle::FileHandle;
use pyrofling::ipc::message::{self, ClientHelloWire, ClientIntent, MessagePayload};
use pyrofling::ipc::Session;

#[derive(Parser, Debug)]
#[command(name = "pyrofling-echo", about = "Exercise the server's fd-passing echo path")]
struct Args {
    /// Matches [`pyrofling::ipc::DEFAULT_SOCKET_PATH`].
    #[arg(long, default_value = "/tmp/pyrofling-socket")]
    socket: PathBuf,
}

fn connect_unix_seqpacket(path: &std::path::Path) -> nix::Result<RawFd> {
    let fd = socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)?;
    let addr = UnixAddr::new(path)?;
    connect(fd, &addr)?;
    Ok(fd)
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let fd = connect_unix_seqpacket(&args.socket).unwrap_or_else(|e| {
        log::error!("failed to connect to {}: {e}", args.socket.display());
        std::process::exit(1);
    });
    let session = Session::new(FileHandle::new(fd).expect("freshly connected socket is a valid handle"));

    let hello = ClientHelloWire::with_name(ClientIntent::EchoStream, "pyrofling-echo");
    let serial = session.send_wire(&hello, &[]);
    if !session.wait_reply_for_serial(serial) {
        log::error!("server did not reply to CLIENT_HELLO");
        std::process::exit(1);
    }
    log::info!("hello acknowledged, intent=EchoStream");

    let probe = eventfd(0, EfdFlags::empty()).expect("eventfd(2) should not fail");
    let probe_handle = FileHandle::new(probe).expect("eventfd returns a valid descriptor");

    let echoed = Arc::new(AtomicBool::new(false));
    let echoed_for_handler = echoed.clone();
    let probe_native = probe_handle.native_handle();
    let serial = session.send_message_with_handler(
        message::MessageType::EchoPayload,
        &[],
        &[probe_handle.native_handle()],
        move |msg| {
            if let MessagePayload::EchoPayload { fd } = &msg.payload {
                log::info!("echoed descriptor received (sent {probe_native}, got {})", fd.native_handle());
                echoed_for_handler.store(true, Ordering::SeqCst);
            } else {
                log::error!("unexpected reply payload to ECHO_PAYLOAD");
            }
            true
        },
    );

    if serial == 0 || !session.wait_reply_for_serial(serial) {
        log::error!("server did not echo the payload descriptor");
        std::process::exit(1);
    }

    if echoed.load(Ordering::SeqCst) {
        log::info!("echo round-trip succeeded");
    } else {
        std::process::exit(1);
    }
}
