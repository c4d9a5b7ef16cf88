use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use crate::connection_id::ConnectionId;

/// The server-side user callback surface. All callbacks for one server are
///  invoked sequentially from a single dispatch task, so implementations see
///  `on_connected` for a connection strictly before any of its
///  `on_message_received`, and `on_closed` strictly last. Messages from one
///  connection arrive in wire order; there is no cross-connection ordering.
///
/// Callbacks may freely call back into the server (`send`,
///  `close_connection`, accessors) for any connection id including their own -
///  no server lock is held while a callback runs.
#[async_trait]
pub trait ServerReceiver: Send + Sync + 'static {
    async fn on_connected(&self, cid: ConnectionId, peer_addr: SocketAddr);

    async fn on_message_received(&self, cid: ConnectionId, payload: Bytes);

    async fn on_closed(&self, cid: ConnectionId);
}

/// The client-side user callback surface, invoked from the client's worker
///  task. `on_connect_result` is called exactly once per `connect` attempt;
///  `on_closed` is called when an established connection breaks (but not on
///  user-initiated shutdown).
#[async_trait]
pub trait ClientReceiver: Send + Sync + 'static {
    async fn on_connect_result(&self, success: bool);

    async fn on_message_received(&self, payload: Bytes);

    async fn on_closed(&self);
}

/// Decouples the connection state machine from what happens with a framed
///  package: connections report extracted packages and close notifications
///  through this seam, the server forwards them into the dispatch queue.
pub(crate) trait NotificationTransfer: Send + Sync {
    fn on_data_received(&self, cid: ConnectionId, payload: Bytes);

    fn on_connection_closed(&self, cid: ConnectionId);
}

/// The poller-to-server event contract. The poller (and nothing else)
///  produces per-connection I/O events; each entry point returns `true` iff
///  the connection is still healthy, `false` uniformly means the connection
///  was (or must be) torn down and its drivers should stop.
///
/// A completion-based poller would invoke the same surface, carrying the
///  transferred byte counts alongside the id; the readiness implementation
///  leaves reading and writing to the connection itself.
pub(crate) trait EventHandler: Send + Sync + 'static {
    fn on_recv_event(&self, cid: ConnectionId) -> bool;

    fn on_send_event(&self, cid: ConnectionId) -> bool;

    fn on_error_event(&self, cid: ConnectionId);

    /// periodic tick driving the idle-timeout sweeper; `now_secs` is seconds
    ///  since the UNIX epoch
    fn on_checking_event(&self, now_secs: u64);
}

/// Accept seam between the listener and the server.
pub(crate) trait Acceptor: Send + Sync + 'static {
    fn on_new_connection(&self, stream: TcpStream, listen_port: u16, peer_addr: SocketAddr);
}
