//! Sequenced IPC client/session (C3): send requests, await replies by serial, receive
//! out-of-band events.
//!
//! Grounded on `ipc/client.{hpp,cpp}`. The notable piece of machinery here is the cooperative
//! "socket master": rather than a dedicated reader thread, whichever waiting thread finds no
//! master elects itself, drops the lock, polls the socket, and processes exactly one message
//! before waking a single other waiter. This lets any caller make progress without a background
//! thread (spec §4.3, §9).

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};
use thiserror::Error;

use crate::handle::FileHandle;
use crate::ipc::message::{self, Message, MessageType, WireError, WirePayload};

/// A one-shot continuation run against the reply for a specific serial (or, for the default and
/// event handlers, any unmatched reply / any event). Returning `false` terminates the session.
pub type SerialHandler = Box<dyn FnMut(&Message) -> bool + Send>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("poll failed: {0}")]
    Poll(#[from] nix::Error),
}

struct Inner {
    send_serial: u64,
    received_replies: u64,
    handlers: HashMap<u64, SerialHandler>,
    default_handler: Option<SerialHandler>,
    event_handler: Option<SerialHandler>,
    has_socket_master: bool,
    socket_master_error: bool,
    process_count: u64,
}

impl Inner {
    fn new() -> Self {
        Inner {
            send_serial: 0,
            received_replies: 0,
            handlers: HashMap::new(),
            default_handler: None,
            event_handler: None,
            has_socket_master: false,
            socket_master_error: false,
            process_count: 0,
        }
    }
}

/// Wraps one [`FileHandle`] plus the serial/handler bookkeeping described in spec §3
/// (`SerialState`). Safe to share across threads: all of them may call [`Session::wait_reply`]
/// and friends concurrently.
pub struct Session {
    fd: FileHandle,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Session {
    pub fn new(fd: FileHandle) -> Self {
        Session {
            fd,
            inner: Mutex::new(Inner::new()),
            cond: Condvar::new(),
        }
    }

    pub fn native_handle(&self) -> RawFd {
        self.fd.native_handle()
    }

    /// Send a message, incrementing the send serial only on success. Returns 0 on failure, so
    /// serial 0 unambiguously means "no reply to wait for".
    pub fn send_message(&self, ty: MessageType, payload: &[u8], fds: &[RawFd]) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        self.send_locked(&mut inner, ty, payload, fds)
    }

    /// Send a typed wire payload with no attached FDs.
    pub fn send_wire<T: WirePayload>(&self, wire: &T, fds: &[RawFd]) -> u64 {
        self.send_message(T::TYPE, message_wire_bytes(wire), fds)
    }

    /// Send a message and, iff it succeeds, atomically install `handler` for the serial it was
    /// assigned -- avoiding the race where a concurrent socket master observes the reply before
    /// the handler would otherwise have been registered (spec §4.5: "the session lock is held
    /// across any send that registers a serial handler").
    pub fn send_message_with_handler<F>(
        &self,
        ty: MessageType,
        payload: &[u8],
        fds: &[RawFd],
        handler: F,
    ) -> u64
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let serial = self.send_locked(&mut inner, ty, payload, fds);
        if serial != 0 {
            inner.handlers.insert(serial, Box::new(handler));
        }
        serial
    }

    fn send_locked(&self, inner: &mut Inner, ty: MessageType, payload: &[u8], fds: &[RawFd]) -> u64 {
        match message::send(self.fd.native_handle(), ty, inner.send_serial + 1, payload, fds) {
            Ok(true) => {
                inner.send_serial += 1;
                inner.send_serial
            }
            Ok(false) | Err(_) => 0,
        }
    }

    /// Install a one-shot handler for `serial`. Must be called before the reply can be observed
    /// -- i.e. before the corresponding send hands control back to another thread. Prefer
    /// [`Session::send_message_with_handler`], which does this atomically.
    pub fn set_serial_handler<F>(&self, serial: u64, handler: F)
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        assert_ne!(serial, 0);
        self.inner.lock().unwrap().handlers.insert(serial, Box::new(handler));
    }

    pub fn set_default_serial_handler<F>(&self, handler: F)
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.inner.lock().unwrap().default_handler = Some(Box::new(handler));
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: FnMut(&Message) -> bool + Send + 'static,
    {
        self.inner.lock().unwrap().event_handler = Some(Box::new(handler));
    }

    /// Cooperatively make progress on the connection. Returns -1 on error (the session is dead),
    /// 0 on timeout, 1 if at least one message was processed.
    pub fn wait_reply(&self, timeout_ms: i32) -> i32 {
        let mut inner = self.inner.lock().unwrap();
        let current_count = inner.process_count;
        let mut self_is_master = false;

        let deadline = if timeout_ms >= 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };

        while current_count == inner.process_count && !inner.socket_master_error && !self_is_master {
            if !inner.has_socket_master {
                self_is_master = true;
                inner.has_socket_master = true;

                // Drop the lock while blocking on the readiness poll: other threads may still
                // observe `has_socket_master` and defer to the condition variable below.
                drop(inner);
                let mut pfd = [PollFd::new(self.fd.native_handle(), PollFlags::POLLIN)];
                let remaining_ms = match deadline {
                    Some(d) => d.saturating_duration_since(Instant::now()).as_millis().min(i32::MAX as u128) as i32,
                    None => -1,
                };
                let ret = poll(&mut pfd, remaining_ms);
                inner = self.inner.lock().unwrap();

                match ret {
                    Err(_) => {
                        inner.socket_master_error = true;
                    }
                    Ok(n) => {
                        let readable = pfd[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);
                        if n <= 0 || !readable {
                            break;
                        }
                        if self.process(&mut inner) {
                            inner.process_count += 1;
                        } else {
                            inner.socket_master_error = true;
                        }
                    }
                }
            } else {
                let wait_for = match deadline {
                    Some(d) => d.saturating_duration_since(Instant::now()),
                    None => Duration::from_secs(3600),
                };
                let (guard, timeout_result) = self.cond.wait_timeout(inner, wait_for).unwrap();
                inner = guard;
                if deadline.is_some() && timeout_result.timed_out() {
                    break;
                }
            }
        }

        let result = if current_count != inner.process_count {
            1
        } else if inner.socket_master_error {
            -1
        } else {
            0
        };

        if self_is_master {
            inner.has_socket_master = false;
            drop(inner);
            if result != 0 {
                self.cond.notify_all();
            } else {
                self.cond.notify_one();
            }
        }

        result
    }

    /// Drain replies until every sent serial has one.
    pub fn roundtrip(&self) -> bool {
        loop {
            let pending = {
                let inner = self.inner.lock().unwrap();
                inner.received_replies < inner.send_serial
            };
            if !pending {
                return true;
            }
            if self.wait_reply(-1) <= 0 {
                return false;
            }
        }
    }

    pub fn wait_reply_for_serial(&self, serial: u64) -> bool {
        loop {
            let satisfied = self.inner.lock().unwrap().received_replies >= serial;
            if satisfied {
                return true;
            }
            if self.wait_reply(-1) <= 0 {
                return false;
            }
        }
    }

    /// Wait for `serial`'s reply and return its message type (discarding its payload). Used for
    /// simple request/acknowledge exchanges such as `ImageGroup -> OK`.
    pub fn wait_plain_reply_for_serial(&self, serial: u64) -> MessageType {
        if serial == 0 {
            return MessageType::Void;
        }

        let observed = std::sync::Arc::new(Mutex::new(MessageType::Void));
        {
            let observed = observed.clone();
            self.set_serial_handler(serial, move |msg| {
                *observed.lock().unwrap() = msg.message_type();
                true
            });
        }

        if !self.wait_reply_for_serial(serial) {
            return MessageType::Void;
        }
        *observed.lock().unwrap()
    }

    /// Parse exactly one ready datagram and dispatch it to the appropriate handler. Mirrors
    /// `Client::process`: serial 0 must carry the event bit and goes to the event handler;
    /// non-zero serials must be strictly sequential and go to their registered (or default)
    /// handler.
    fn process(&self, inner: &mut Inner) -> bool {
        let msg = match message::parse(self.fd.native_handle()) {
            Ok(msg) => msg,
            Err(_) => return false,
        };

        if msg.serial == 0 {
            if !msg.message_type().is_event() {
                log::error!("unexpected message type {:?}: event flag not set", msg.message_type());
                return false;
            }
            return match inner.event_handler.as_mut() {
                Some(handler) => handler(&msg),
                None => true,
            };
        }

        if msg.message_type().is_event() {
            log::error!("unexpected message type {:?}: event flag unexpectedly set", msg.message_type());
            return false;
        }

        inner.received_replies += 1;
        if msg.serial != inner.received_replies {
            log::error!(
                "unexpected serial, expected {}, got {}",
                inner.received_replies,
                msg.serial
            );
            return false;
        }

        if let Some(mut handler) = inner.handlers.remove(&msg.serial) {
            handler(&msg)
        } else if let Some(handler) = inner.default_handler.as_mut() {
            handler(&msg)
        } else {
            true
        }
    }
}

fn message_wire_bytes<T: WirePayload>(wire: &T) -> &[u8] {
    // SAFETY: see `ipc::message::wire_bytes`; T is repr(C), Copy, padding-free POD.
    unsafe { std::slice::from_raw_parts((wire as *const T).cast::<u8>(), std::mem::size_of::<T>()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MessagePayload;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn pair() -> (Session, RawFd) {
        let (a, b) = socketpair(AddressFamily::Unix, SockType::SeqPacket, None, SockFlag::empty()).unwrap();
        (Session::new(FileHandle::new(a).unwrap()), b)
    }

    #[test]
    fn wait_reply_zero_timeout_returns_zero_without_data() {
        let (session, peer) = pair();
        assert_eq!(session.wait_reply(0), 0);
        let _ = nix::unistd::close(peer);
    }

    #[test]
    fn serial_handler_observes_reply() {
        let (session, peer) = pair();
        let seen = Arc::new(AtomicBool::new(false));
        let seen2 = seen.clone();

        let serial = session.send_message_with_handler(MessageType::Ok, &[], &[], move |msg| {
            assert!(matches!(msg.payload, MessagePayload::Error));
            seen2.store(true, Ordering::SeqCst);
            true
        });
        assert_eq!(serial, 1);

        message::send_plain(peer, MessageType::Error, 1).unwrap();
        assert!(session.wait_reply_for_serial(1));
        assert!(seen.load(Ordering::SeqCst));
        let _ = nix::unistd::close(peer);
    }

    #[test]
    fn out_of_order_reply_fails_session() {
        let (session, peer) = pair();
        session.send_message(MessageType::Ok, &[], &[]);
        // Reply carries serial 2 when only serial 1 was ever sent -- a gap.
        message::send_plain(peer, MessageType::Ok, 2).unwrap();
        assert_eq!(session.wait_reply(1000), -1);
        let _ = nix::unistd::close(peer);
    }
}
