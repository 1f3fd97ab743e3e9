//! Event-loop dispatcher (C4): a single readiness-multiplexed loop that accepts connections on
//! the local `SOCK_SEQPACKET` socket, optionally a TCP listener and a UDP socket, and routes
//! readiness to per-connection handlers.
//!
//! Grounded on `ipc/listener.{hpp,cpp}`. The original keys epoll events off the `Connection *`
//! pointer identity; this translation keys them off a small integer [`ConnectionId`] stored in
//! the epoll user-data word instead, which sidesteps raw-pointer aliasing concerns without
//! changing the dispatch shape.

use std::collections::HashMap;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::cell::RefCell;

use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;
use nix::sys::socket::{
    accept4, bind, listen, setsockopt, sockopt, socket, AddressFamily, SockFlag, SockType, SockaddrStorage, UnixAddr,
};
use thiserror::Error;

use crate::handle::{FileHandle, HandleError};

/// Opaque key into the dispatcher's connection table; also the value stored in each epoll
/// event's user-data word.
pub type ConnectionId = u64;

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),
    #[error("invalid handle: {0}")]
    Handle(#[from] HandleError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote peer address, as returned by `accept`/`recvfrom` on the TCP/UDP surfaces.
#[derive(Debug, Clone)]
pub struct RemoteAddress(pub SockaddrStorage);

impl PartialEq for RemoteAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && format!("{}", self.0) == format!("{}", other.0)
    }
}

/// A capability set for connection readiness: handle data, learn it is going away.
pub trait Handler {
    /// `id` is the per-connection tag passed to [`Dispatcher::add_connection`] (distinct fds
    /// owned by the same handler -- e.g. a stream socket and an associated timerfd -- are
    /// distinguished by this, not by the dispatcher's internal [`ConnectionId`]).
    fn handle(&mut self, fd: RawFd, id: u32) -> bool;
    fn release_id(&mut self, id: u32);
    /// A sentinel handler's hangup terminates the whole dispatcher loop (signalfd/eventfd).
    fn is_sentinel(&self) -> bool {
        false
    }
}

/// Capability set for accepting new connections and routing UDP datagrams, implemented by the
/// server (C9).
pub trait HandlerFactory {
    /// A new UNIX `SOCK_SEQPACKET` peer connected. Return a handler to adopt it, or `None` to
    /// hang up immediately.
    fn register(&mut self, fd: RawFd) -> Option<Rc<RefCell<dyn Handler>>>;
    /// A TCP socket accepted and readied (1 MiB send buffer, half-closed for reading, spec §4.4
    /// point 2). Mirrors [`HandlerFactory::register`]'s shape: the dispatcher keeps ownership of
    /// `fd` and performs the epoll registration itself, sidestepping a factory -> dispatcher
    /// back reference (spec §9 "cyclic lifecycle").
    fn add_stream_socket(&mut self, fd: RawFd, remote: RemoteAddress) -> Option<Rc<RefCell<dyn Handler>>>;
    /// One UDP datagram arrived.
    fn handle_udp_datagram(&mut self, remote: &RemoteAddress, data: &[u8]);
}

struct Connection {
    fd: FileHandle,
    id: u32,
    handler: Option<Rc<RefCell<dyn Handler>>>,
}

enum Role {
    UnixListener,
    TcpListener,
    UdpSocket,
    Sentinel,
    Client,
}

struct Slot {
    conn: Connection,
    role: Role,
}

/// Owns the epoll fd, the UNIX listener, optional TCP/UDP sockets, the signal/event sentinels,
/// and the registered connection table. One instance per server process (spec §4.4).
pub struct Dispatcher {
    epoll_fd: FileHandle,
    unix_listener: FileHandle,
    unix_listener_key: ConnectionId,
    tcp_listener: Option<FileHandle>,
    tcp_listener_key: ConnectionId,
    udp_socket: Option<FileHandle>,
    udp_socket_key: ConnectionId,
    event_fd_key: ConnectionId,
    next_key: ConnectionId,
    slots: HashMap<ConnectionId, Slot>,
    cancellations: Vec<ConnectionId>,
    unlink_path: Option<PathBuf>,
    factory: Option<Box<dyn HandlerFactory>>,
}

const EPOLL_MAX_EVENTS: usize = 64;

impl Dispatcher {
    /// Bind the UNIX `SOCK_SEQPACKET` listener at `socket_path` (rebinding over a stale socket
    /// file of the same type), optionally a TCP+UDP pair on `tcp_port`, and arm the
    /// signalfd/eventfd sentinels.
    pub fn new(socket_path: &Path, tcp_port: Option<u16>) -> Result<Self, DispatcherError> {
        block_signals();

        if let Ok(meta) = std::fs::symlink_metadata(socket_path) {
            use std::os::unix::fs::FileTypeExt;
            if meta.file_type().is_socket() {
                log::warn!("rebinding over stale socket file at {}", socket_path.display());
                let _ = std::fs::remove_file(socket_path);
            }
        }

        let unix_fd = socket(AddressFamily::Unix, SockType::SeqPacket, SockFlag::empty(), None)?;
        let addr = UnixAddr::new(socket_path)?;
        bind(unix_fd, &addr)?;
        listen(unix_fd, 16)?;
        let unix_listener = FileHandle::new(unix_fd)?;

        let epoll_raw = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        let epoll_fd = FileHandle::new(epoll_raw)?;

        let mut dispatcher = Dispatcher {
            epoll_fd,
            unix_listener,
            unix_listener_key: 0,
            tcp_listener: None,
            tcp_listener_key: 0,
            udp_socket: None,
            udp_socket_key: 0,
            event_fd_key: 0,
            next_key: 16,
            slots: HashMap::new(),
            cancellations: Vec::new(),
            unlink_path: Some(socket_path.to_path_buf()),
            factory: None,
        };

        dispatcher.add_signalfd()?;
        dispatcher.add_eventfd()?;

        let unix_key = dispatcher.alloc_key();
        dispatcher.epoll_add(dispatcher.unix_listener.native_handle(), EpollFlags::EPOLLIN, unix_key)?;
        dispatcher.unix_listener_key = unix_key;

        if let Some(port) = tcp_port {
            let tcp = TcpListener::bind(("0.0.0.0", port))?;
            tcp.set_nonblocking(true)?;
            let tcp_fd = FileHandle::new(tcp.into_raw_fd())?;
            let key = dispatcher.alloc_key();
            dispatcher.epoll_add(tcp_fd.native_handle(), EpollFlags::EPOLLIN, key)?;
            dispatcher.tcp_listener_key = key;
            dispatcher.tcp_listener = Some(tcp_fd);

            let udp = UdpSocket::bind(("0.0.0.0", port))?;
            udp.set_nonblocking(true)?;
            let udp_fd = FileHandle::new(udp.into_raw_fd())?;
            let key = dispatcher.alloc_key();
            dispatcher.epoll_add(udp_fd.native_handle(), EpollFlags::EPOLLIN, key)?;
            dispatcher.udp_socket_key = key;
            dispatcher.udp_socket = Some(udp_fd);
        }

        Ok(dispatcher)
    }

    pub fn set_handler_factory(&mut self, factory: Box<dyn HandlerFactory>) {
        self.factory = Some(factory);
    }

    /// The UDP socket's raw descriptor, if one was bound (`tcp_port` was `Some` in [`Dispatcher::new`]).
    ///
    /// Returned as a bare [`RawFd`], not a [`FileHandle`](crate::handle::FileHandle): the
    /// dispatcher remains the sole owner of the descriptor. This lets a [`HandlerFactory`] (the
    /// streaming server) send UDP datagrams on its own schedule -- e.g. from a vblank tick,
    /// outside of any `handle_udp_datagram` callback -- without holding a reference back into the
    /// `Dispatcher` itself (spec §9 "cyclic lifecycle").
    pub fn udp_native_handle(&self) -> Option<RawFd> {
        self.udp_socket.as_ref().map(FileHandle::native_handle)
    }

    fn alloc_key(&mut self) -> ConnectionId {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn epoll_add(&self, fd: RawFd, flags: EpollFlags, key: ConnectionId) -> Result<(), DispatcherError> {
        let mut event = EpollEvent::new(flags, key);
        epoll_ctl(self.epoll_fd.native_handle(), EpollOp::EpollCtlAdd, fd, Some(&mut event))?;
        Ok(())
    }

    fn epoll_del(&self, fd: RawFd) -> Result<(), DispatcherError> {
        epoll_ctl(self.epoll_fd.native_handle(), EpollOp::EpollCtlDel, fd, None)?;
        Ok(())
    }

    fn add_signalfd(&mut self) -> Result<(), DispatcherError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block()?;
        let sfd = SignalFd::with_flags(&mask, nix::sys::signalfd::SfdFlags::SFD_NONBLOCK)?;
        let fd = FileHandle::new(sfd.as_raw_fd())?;
        std::mem::forget(sfd); // ownership now lives in `fd`
        let key = self.alloc_key();
        self.epoll_add(fd.native_handle(), EpollFlags::EPOLLIN, key)?;
        self.slots.insert(
            key,
            Slot {
                conn: Connection {
                    fd,
                    id: 0,
                    handler: None,
                },
                role: Role::Sentinel,
            },
        );
        Ok(())
    }

    fn add_eventfd(&mut self) -> Result<(), DispatcherError> {
        let raw = eventfd(0, EfdFlags::EFD_NONBLOCK)?;
        let fd = FileHandle::new(raw)?;
        let key = self.alloc_key();
        self.epoll_add(fd.native_handle(), EpollFlags::EPOLLIN, key)?;
        self.event_fd_key = key;
        self.slots.insert(
            key,
            Slot {
                conn: Connection {
                    fd,
                    id: 0,
                    handler: None,
                },
                role: Role::Sentinel,
            },
        );
        Ok(())
    }

    /// Register an additional fd (e.g. a per-connection timerfd) under an existing or new
    /// handler, tagged with `id`.
    pub fn add_connection(
        &mut self,
        fd: FileHandle,
        handler: Rc<RefCell<dyn Handler>>,
        id: u32,
        readable: bool,
        writable: bool,
    ) -> bool {
        let mut flags = EpollFlags::empty();
        if readable {
            flags |= EpollFlags::EPOLLIN;
        }
        if writable {
            flags |= EpollFlags::EPOLLOUT;
        }
        let key = self.alloc_key();
        if self.epoll_add(fd.native_handle(), flags, key).is_err() {
            return false;
        }
        self.slots.insert(
            key,
            Slot {
                conn: Connection {
                    fd,
                    id,
                    handler: Some(handler),
                },
                role: Role::Client,
            },
        );
        true
    }

    /// Defer removal of the connection identified by `(handler, id)` to the end of the current
    /// iteration, so a handler may safely cancel itself mid-callback.
    pub fn cancel_connection(&mut self, handler: &Rc<RefCell<dyn Handler>>, id: u32) {
        if let Some(key) = self.slots.iter().find_map(|(k, slot)| {
            let matches = slot
                .conn
                .handler
                .as_ref()
                .map(|h| Rc::ptr_eq(h, handler) && slot.conn.id == id)
                .unwrap_or(false);
            matches.then_some(*k)
        }) {
            self.cancellations.push(key);
        }
    }

    /// Send one UDP datagram consisting of `header` followed by `data` to `addr`.
    pub fn write_udp_datagram(&self, addr: &RemoteAddress, header: &[u8], data: &[u8]) -> isize {
        let Some(udp) = &self.udp_socket else {
            return -1;
        };
        send_udp_datagram(udp.native_handle(), addr, header, data)
    }

    /// Run the loop until a sentinel hangs up, `kill()` is called, or an unrecoverable error
    /// occurs.
    pub fn run(&mut self) {
        while self.iterate() {}
    }

    /// Wake the loop from another thread/signal handler (writes to the internal eventfd).
    pub fn kill(&self) {
        if let Some(slot) = self.slots.get(&self.event_fd_key) {
            let value: u64 = 1;
            let _ = nix::unistd::write(slot.conn.fd.native_handle(), &value.to_ne_bytes());
        }
    }

    /// Block on one `epoll_wait`, route every ready fd, and process deferred cancellations.
    /// Returns `false` when the loop should terminate (a sentinel hung up, or an unrecoverable
    /// epoll error occurred).
    pub fn iterate(&mut self) -> bool {
        let ok = self.iterate_inner();
        if !ok {
            self.slots.clear();
            self.cancellations.clear();
        }
        ok
    }

    fn iterate_inner(&mut self) -> bool {
        let mut events = [EpollEvent::empty(); EPOLL_MAX_EVENTS];
        let count = match epoll_wait(self.epoll_fd.native_handle(), &mut events, -1) {
            Ok(n) => n,
            Err(nix::Error::EINTR) => return true,
            Err(_) => return false,
        };

        for event in &events[..count] {
            let key = event.data();
            if key == self.unix_listener_key {
                self.accept_unix();
            } else if key == self.tcp_listener_key {
                self.accept_tcp();
            } else if key == self.udp_socket_key {
                self.read_udp();
            } else {
                if !self.service_existing(key, event.events()) {
                    return false;
                }
            }
        }

        if !self.drain_cancellations() {
            return false;
        }

        true
    }

    fn accept_unix(&mut self) {
        let Ok(raw) = accept4(self.unix_listener.native_handle(), SockFlag::SOCK_NONBLOCK) else {
            return;
        };
        let Ok(fd) = FileHandle::new(raw) else { return };
        let key = self.alloc_key();
        if self.epoll_add(fd.native_handle(), EpollFlags::EPOLLIN, key).is_err() {
            return;
        }
        self.slots.insert(
            key,
            Slot {
                conn: Connection {
                    fd,
                    id: 0,
                    handler: None,
                },
                role: Role::Client,
            },
        );
    }

    fn accept_tcp(&mut self) {
        let Some(tcp) = &self.tcp_listener else { return };
        let Ok((raw, addr)) = nix::sys::socket::accept(tcp.native_handle()).and_then(|fd| {
            nix::sys::socket::getpeername::<SockaddrStorage>(fd).map(|a| (fd, a))
        }) else {
            return;
        };
        let Ok(fd) = FileHandle::new(raw) else { return };

        let _ = setsockopt(&fd, sockopt::SndBuf, &(1024 * 1024usize));
        let _ = nix::sys::socket::shutdown(fd.native_handle(), nix::sys::socket::Shutdown::Read);

        let handler = match self.factory.as_mut() {
            Some(factory) => factory.add_stream_socket(fd.native_handle(), RemoteAddress(addr)),
            None => return,
        };
        let Some(handler) = handler else { return };
        let key = self.alloc_key();
        if self.epoll_add(fd.native_handle(), EpollFlags::EPOLLIN, key).is_err() {
            return;
        }
        self.slots.insert(
            key,
            Slot {
                conn: Connection { fd, id: 0, handler: Some(handler) },
                role: Role::Client,
            },
        );
    }

    fn read_udp(&mut self) {
        let Some(udp) = &self.udp_socket else { return };
        let mut buf = [0u8; 2048];
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let Ok(msg) = nix::sys::socket::recvmsg::<SockaddrStorage>(
            udp.native_handle(),
            &mut iov,
            None,
            nix::sys::socket::MsgFlags::empty(),
        ) else {
            return;
        };
        let Some(addr) = msg.address else { return };
        let n = msg.bytes;
        if let Some(factory) = self.factory.as_mut() {
            factory.handle_udp_datagram(&RemoteAddress(addr), &buf[..n]);
        }
    }

    /// Route readiness on an already-registered connection: accept-without-handler attaches one
    /// via the factory, `EPOLLHUP` or a `false` return from `handle` hangs it up.
    fn service_existing(&mut self, key: ConnectionId, events: EpollFlags) -> bool {
        let Some(slot) = self.slots.get(&key) else { return true };

        if matches!(slot.role, Role::Sentinel) {
            // Any readiness on a sentinel fd (signalfd/eventfd firing) terminates the loop.
            return false;
        }

        let fd = slot.conn.fd.native_handle();
        let id = slot.conn.id;
        let mut hangup = events.contains(EpollFlags::EPOLLHUP);

        if !hangup && slot.conn.handler.is_none() {
            let attached = self.factory.as_mut().and_then(|f| f.register(fd));
            match attached {
                Some(handler) => {
                    if let Some(slot) = self.slots.get_mut(&key) {
                        slot.conn.handler = Some(handler);
                    }
                }
                None => hangup = true,
            }
        } else if !hangup {
            let handler = slot.conn.handler.clone();
            if let Some(handler) = handler {
                if !handler.borrow_mut().handle(fd, id) {
                    hangup = true;
                }
            }
        }

        if hangup {
            let _ = self.epoll_del(fd);
            let is_sentinel = self
                .slots
                .get(&key)
                .and_then(|s| s.conn.handler.as_ref())
                .map(|h| h.borrow().is_sentinel())
                .unwrap_or(false);
            if let Some(slot) = self.slots.remove(&key) {
                if let Some(handler) = slot.conn.handler {
                    handler.borrow_mut().release_id(slot.conn.id);
                }
            }
            if is_sentinel {
                return false;
            }
        }

        true
    }

    fn drain_cancellations(&mut self) -> bool {
        let keys = std::mem::take(&mut self.cancellations);
        let mut is_sentinel = false;
        for key in keys {
            if let Some(slot) = self.slots.remove(&key) {
                if self.epoll_del(slot.conn.fd.native_handle()).is_err() {
                    return false;
                }
                if let Some(handler) = slot.conn.handler {
                    is_sentinel |= handler.borrow().is_sentinel();
                    handler.borrow_mut().release_id(slot.conn.id);
                }
            }
        }
        !is_sentinel
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(path) = &self.unlink_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Send one UDP datagram consisting of `header` followed by `data` to `addr` on a raw socket
/// descriptor. A free function (rather than a [`Dispatcher`] method) so a [`HandlerFactory`] that
/// only holds [`Dispatcher::udp_native_handle`]'s bare descriptor can still send on it.
pub fn send_udp_datagram(fd: RawFd, addr: &RemoteAddress, header: &[u8], data: &[u8]) -> isize {
    let iov = [std::io::IoSlice::new(header), std::io::IoSlice::new(data)];
    match nix::sys::socket::sendmsg(fd, &iov, &[], nix::sys::socket::MsgFlags::MSG_NOSIGNAL, Some(&addr.0)) {
        Ok(n) => n as isize,
        Err(_) => -1,
    }
}

fn block_signals() {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    let _ = mask.thread_block();
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
