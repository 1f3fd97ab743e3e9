//! Local sequenced-packet IPC: framed messages (C2), the client/server session (C3), and the
//! readiness-multiplexed event loop (C4) that the capture layer and the streaming server speak
//! to each other over.

pub mod dispatcher;
pub mod message;
pub mod session;

pub use dispatcher::{send_udp_datagram, ConnectionId, Dispatcher, DispatcherError, Handler, HandlerFactory, RemoteAddress};
pub use message::{Message, MessagePayload, MessageType, WireError};
pub use session::{Session, SessionError};

/// Default path for the local sequenced-packet socket (`PYROFLING_SERVER` in the capture layer,
/// `--socket` on the server CLI).
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/pyrofling-socket";
