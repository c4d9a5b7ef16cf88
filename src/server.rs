use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RaptorOptions;
use crate::connection::Connection;
use crate::connection_id::ConnectionId;
use crate::connection_registry::ConnectionRegistry;
use crate::dispatch_queue::{DispatchQueue, TcpMessage};
use crate::listener::Listener;
use crate::poller::{now_secs, ReadinessPoller};
use crate::protocol::{LengthPrefixProtocol, Protocol};
use crate::service::{Acceptor, EventHandler, NotificationTransfer, ServerReceiver};
use crate::shutdown::ShutdownLatch;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The server engine: owns the connection table, the accepting sockets, the
///  poller and the dispatch queue, and routes every I/O event to the
///  connection it belongs to.
///
/// ```text
/// poller -> on_recv_event(cid) -> Connection::do_recv_event -> framing loop
///        -> dispatch queue -> dispatch task -> ServerReceiver callback
/// ```
///
/// Connection ids handed to the [ServerReceiver] stay valid until the
///  matching `on_closed`; using one later (or after a restart) fails
///  validation and is simply reported as `false` / `None` by the accessors.
///
/// All user callbacks are made from one dispatch task, with no server lock
///  held, so they may call back into the server freely.
pub struct TcpServer {
    /// self-reference handed out to the poller, listener and dispatch task
    ///  (the server is only ever constructed inside an `Arc`)
    weak_self: Weak<TcpServer>,

    options: RaptorOptions,
    /// server-lifetime discriminator baked into every id this instance hands
    ///  out; derived from the start time, never 0
    magic: u16,
    receiver: Arc<dyn ServerReceiver>,
    protocol: Mutex<Arc<dyn Protocol>>,

    registry: Mutex<ConnectionRegistry>,
    queue: DispatchQueue,
    listener: Listener,
    poller: Mutex<Option<Arc<ReadinessPoller>>>,

    shutdown: Arc<ShutdownLatch>,
    started: AtomicBool,
    /// coalesces sweeps when ticks arrive from more than one source
    last_sweep_secs: AtomicU64,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    pub fn new(receiver: Arc<dyn ServerReceiver>, options: RaptorOptions) -> Arc<TcpServer> {
        let mut options = options;
        options.max_connections = options.max_connections.max(1);

        let mut magic = (now_secs() & 0xffff) as u16;
        if magic == 0 {
            // keep the all-zero sentinel unreachable
            magic = 1;
        }

        let shutdown = Arc::new(ShutdownLatch::new());
        Arc::new_cyclic(|weak_self| TcpServer {
            weak_self: weak_self.clone(),
            registry: Mutex::new(ConnectionRegistry::new(&options)),
            options,
            magic,
            receiver,
            protocol: Mutex::new(Arc::new(LengthPrefixProtocol::new())),
            queue: DispatchQueue::new(),
            listener: Listener::new(shutdown.clone()),
            poller: Mutex::new(None),
            shutdown,
            started: AtomicBool::new(false),
            last_sweep_secs: AtomicU64::new(0),
            dispatch_task: Mutex::new(None),
        })
    }

    fn strong_self(&self) -> Arc<TcpServer> {
        self.weak_self.upgrade().expect("server instance already dropped")
    }

    /// Replace the default length-prefix protocol. Only allowed before
    ///  [TcpServer::start]; connections freeze the protocol on accept.
    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) -> anyhow::Result<()> {
        if self.started.load(Ordering::Acquire) {
            bail!("cannot change the protocol of a started server");
        }
        *self.protocol.lock().expect("poisoned protocol lock") = protocol;
        Ok(())
    }

    /// Bind all addresses `addr` resolves to. Returns the bound ports.
    pub async fn add_listening(&self, addr: &str) -> anyhow::Result<Vec<u16>> {
        if self.shutdown.is_triggered() {
            bail!("tcp server is shut down");
        }

        let ports = self.listener.add_listening(addr).await?;
        if self.started.load(Ordering::Acquire) {
            // already running - bring the new sockets up right away
            self.listener.start(self.strong_self());
        }
        Ok(ports)
    }

    /// Start accepting and dispatching.
    pub fn start(&self) -> anyhow::Result<()> {
        if self.shutdown.is_triggered() {
            bail!("tcp server is shut down");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("tcp server already started");
        }

        let poller = Arc::new(ReadinessPoller::new(self.strong_self()));
        poller.start(TICK_INTERVAL);
        *self.poller.lock().expect("poisoned poller lock") = Some(poller);

        self.listener.start(self.strong_self());

        let server = self.strong_self();
        let dispatch_task = tokio::spawn(async move { server.dispatch_loop().await });
        *self.dispatch_task.lock().expect("poisoned dispatch task lock") = Some(dispatch_task);

        info!("tcp server started (magic {:04x})", self.magic);
        Ok(())
    }

    /// Stop everything: accepting, polling, dispatching. Live connections
    ///  are closed without notification, undispatched events are discarded.
    ///  After this returns, no callback fires anymore.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        info!("shutting down tcp server");

        self.listener.shutdown().await;

        let poller = self.poller.lock().expect("poisoned poller lock").take();
        if let Some(poller) = poller {
            poller.shutdown().await;
        }

        let dispatch_task = self.dispatch_task.lock().expect("poisoned dispatch task lock").take();
        if let Some(task) = dispatch_task {
            let _ = task.await;
        }

        let live = self.registry_lock().drain_all();
        let num_live = live.len();
        for conn in live {
            conn.shutdown(false, self);
        }

        let mut num_dropped = 0;
        while self.queue.try_pop().is_some() {
            num_dropped += 1;
        }
        debug!("tcp server shut down ({} connections closed, {} undispatched events dropped)",
            num_live, num_dropped);
    }

    /// Frame `payload` with the connection's protocol and queue it for
    ///  sending. `false` iff `cid` does not name a live connection.
    ///  Callable from arbitrary tasks and threads.
    pub fn send(&self, cid: ConnectionId, payload: &[u8]) -> bool {
        match self.lookup(cid) {
            Some(conn) => conn.send(payload),
            None => false,
        }
    }

    /// Like [TcpServer::send] with a caller-supplied header instead of one
    ///  built by the protocol.
    pub fn send_with_header(&self, cid: ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        match self.lookup(cid) {
            Some(conn) => conn.send_with_header(header, payload),
            None => false,
        }
    }

    /// Close a connection on behalf of the user. The `on_closed` callback is
    ///  delivered after all of the connection's already-queued messages.
    pub fn close_connection(&self, cid: ConnectionId) -> bool {
        if self.check_connection_id(cid).is_none() {
            return false;
        }

        let removed = self.registry_lock().remove(cid);
        match removed {
            Some(conn) => {
                debug!(?cid, "closing connection on user request");
                conn.shutdown(true, self);
                true
            }
            None => false,
        }
    }

    pub fn peer_addr(&self, cid: ConnectionId) -> Option<SocketAddr> {
        self.lookup(cid).map(|conn| conn.peer_addr())
    }

    pub fn set_user_data(&self, cid: ConnectionId, data: Option<Arc<dyn Any + Send + Sync>>) -> bool {
        match self.lookup(cid) {
            Some(conn) => {
                conn.set_user_data(data);
                true
            }
            None => false,
        }
    }

    pub fn user_data(&self, cid: ConnectionId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.lookup(cid)?.user_data()
    }

    pub fn set_extend_info(&self, cid: ConnectionId, info: u64) -> bool {
        match self.lookup(cid) {
            Some(conn) => {
                conn.set_extend_info(info);
                true
            }
            None => false,
        }
    }

    pub fn extend_info(&self, cid: ConnectionId) -> Option<u64> {
        self.lookup(cid).map(|conn| conn.extend_info())
    }

    /// Cheap structural validation without touching the table: the sentinel,
    ///  ids minted by another server lifetime (magic mismatch) and indices
    ///  beyond the configured capacity are rejected outright. NB: bounds are
    ///  checked against `max_connections`, not the current table length, so
    ///  this needs no synchronization with table growth; the slot lookup
    ///  afterwards still verifies the connection is present.
    fn check_connection_id(&self, cid: ConnectionId) -> Option<u32> {
        if !cid.is_valid() {
            return None;
        }
        if cid.magic() != self.magic {
            return None;
        }
        if cid.index() as usize >= self.options.max_connections {
            return None;
        }
        Some(cid.index())
    }

    fn lookup(&self, cid: ConnectionId) -> Option<Arc<Connection>> {
        self.check_connection_id(cid)?;
        self.registry_lock().get(cid)
    }

    fn registry_lock(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.registry.lock().expect("poisoned connection table lock")
    }

    /// Remove `cid` from the table and shut its connection down. The
    ///  connection itself is shut down outside the table lock.
    fn teardown(&self, cid: ConnectionId, notify: bool) {
        let removed = self.registry_lock().remove(cid);
        if let Some(conn) = removed {
            conn.shutdown(notify, self);
        }
    }

    async fn dispatch_loop(&self) {
        loop {
            let msg = tokio::select! {
                _ = self.shutdown.wait() => break,
                msg = self.queue.pop_wait() => msg,
            };

            match msg {
                TcpMessage::NewConnection { cid, peer_addr } => {
                    self.receiver.on_connected(cid, peer_addr).await;
                }
                TcpMessage::MessageReceived { cid, payload } => {
                    self.receiver.on_message_received(cid, payload).await;
                }
                TcpMessage::ConnectionClosed { cid } => {
                    self.receiver.on_closed(cid).await;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_events(&self) -> usize {
        self.queue.pending()
    }

    #[cfg(test)]
    pub(crate) fn live_connections(&self) -> usize {
        self.registry_lock().live_count()
    }
}

impl Acceptor for TcpServer {
    fn on_new_connection(&self, stream: TcpStream, listen_port: u16, peer_addr: SocketAddr) {
        if self.shutdown.is_triggered() {
            return; // dropping the stream closes the socket
        }
        let poller = self.poller.lock().expect("poisoned poller lock").clone();
        let Some(poller) = poller else {
            warn!("accepted a connection without a running poller, dropping it");
            return;
        };
        let protocol = self.protocol.lock().expect("poisoned protocol lock").clone();

        let (cid, conn) = {
            let mut registry = self.registry_lock();
            let Some(index) = registry.reserve_index() else {
                warn!("connection table full ({} connections), dropping accept from {}",
                    self.options.max_connections, peer_addr);
                return;
            };

            let cid = ConnectionId::new(self.magic, listen_port, index);
            let conn = Arc::new(Connection::new(cid, stream, peer_addr, protocol));
            registry.install(index, conn.clone(), now_secs());
            (cid, conn)
        };

        debug!(?cid, %peer_addr, "accepted connection");
        // queue the arrival before the poller can produce the first receive
        //  event, so on_connected always precedes on_message_received
        self.queue.push(TcpMessage::NewConnection { cid, peer_addr });
        poller.register(&conn);
    }
}

impl EventHandler for TcpServer {
    /// NB: the table lock is held while the connection processes the event.
    ///  This serializes event processing against user-initiated closes - a
    ///  message can never be queued after the close notification for the
    ///  same connection. The lock is never held across a user callback.
    fn on_recv_event(&self, cid: ConnectionId) -> bool {
        if self.check_connection_id(cid).is_none() {
            return false;
        }

        let mut registry = self.registry_lock();
        let Some(conn) = registry.get(cid) else {
            return false;
        };

        if conn.do_recv_event(self) {
            registry.touch(cid.index(), now_secs());
            true
        }
        else {
            registry.remove(cid);
            drop(registry);
            conn.shutdown(true, self);
            false
        }
    }

    fn on_send_event(&self, cid: ConnectionId) -> bool {
        if self.check_connection_id(cid).is_none() {
            return false;
        }

        let mut registry = self.registry_lock();
        let Some(conn) = registry.get(cid) else {
            return false;
        };

        if conn.do_send_event() {
            registry.touch(cid.index(), now_secs());
            true
        }
        else {
            registry.remove(cid);
            drop(registry);
            conn.shutdown(true, self);
            false
        }
    }

    fn on_error_event(&self, cid: ConnectionId) {
        if self.check_connection_id(cid).is_none() {
            return;
        }
        self.teardown(cid, true);
    }

    fn on_checking_event(&self, now_secs: u64) {
        let last = self.last_sweep_secs.load(Ordering::Acquire);
        if now_secs <= last {
            return;
        }
        if self.last_sweep_secs
            .compare_exchange(last, now_secs, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // a concurrent tick is already sweeping
        }

        let expired = self.registry_lock().sweep_expired(now_secs);
        for conn in expired {
            debug!(cid = ?conn.cid(), "closing idle connection");
            conn.shutdown(true, self);
        }
    }
}

impl NotificationTransfer for TcpServer {
    fn on_data_received(&self, cid: ConnectionId, payload: Bytes) {
        self.queue.push(TcpMessage::MessageReceived { cid, payload });
    }

    fn on_connection_closed(&self, cid: ConnectionId) {
        self.queue.push(TcpMessage::ConnectionClosed { cid });
    }
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::test_util::{RecordingServerReceiver, ServerEvent};

    fn test_options(max_connections: usize, timeout: Duration) -> RaptorOptions {
        RaptorOptions {
            max_connections,
            connection_timeout: timeout,
            initial_capacity: max_connections,
        }
    }

    async fn started_server(options: RaptorOptions) -> (Arc<TcpServer>, Arc<RecordingServerReceiver>, u16) {
        let receiver = Arc::new(RecordingServerReceiver::new());
        let server = TcpServer::new(receiver.clone(), options);
        let ports = server.add_listening("127.0.0.1:0").await.unwrap();
        server.start().unwrap();
        (server, receiver, ports[0])
    }

    #[tokio::test]
    async fn test_single_echo() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"\0\0\0\x05hello").await.unwrap();

        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Message(_, payload) if payload.as_ref() == b"hello"))
        }).await);

        // on_connected strictly before the first message, carrying the peer address
        let events = receiver.events();
        let ServerEvent::Connected(cid, peer_addr) = events[0].clone() else {
            panic!("first event was {:?}", events[0]);
        };
        assert_eq!(peer_addr, peer.local_addr().unwrap());
        assert_eq!(cid.listen_port(), port);
        assert!(matches!(&events[1], ServerEvent::Message(mcid, _) if *mcid == cid));

        // echo back through the server
        assert!(server.send(cid, b"hello"));
        let mut echoed = [0u8; 9];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut echoed))
            .await
            .expect("no echo arrived")
            .unwrap();
        assert_eq!(&echoed, b"\0\0\0\x05hello");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_frames_assemble_to_one_message() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"\0\0\0\x05").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.write_all(b"hi").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        peer.write_all(b"!!!").await.unwrap();

        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Message(_, _)))
        }).await);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = receiver.events().into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message(_, payload) => Some(payload),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(messages.len(), 1, "expected exactly one assembled message");
        assert_eq!(messages[0].as_ref(), b"hi!!!");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_multiple_messages_arrive_in_wire_order() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut wire = Vec::new();
        for i in 0..20u8 {
            wire.extend_from_slice(b"\0\0\0\x01");
            wire.push(i);
        }
        peer.write_all(&wire).await.unwrap();

        assert!(receiver.wait_until(|events| {
            events.iter().filter(|e| matches!(e, ServerEvent::Message(_, _))).count() == 20
        }).await);

        let payloads = receiver.events().into_iter()
            .filter_map(|e| match e {
                ServerEvent::Message(_, payload) => Some(payload[0]),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(payloads, (0..20u8).collect::<Vec<_>>());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
        }
        assert!(receiver.wait_until(|events| {
            events.iter().filter(|e| matches!(e, ServerEvent::Connected(_, _))).count() == 4
        }).await);

        // the fifth connection is accepted by the OS but dropped by the
        //  server without any callback
        let mut fifth = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), fifth.read(&mut buf)).await;
        assert_eq!(read.expect("fifth connection was not closed").unwrap(), 0);

        assert_eq!(
            receiver.events().iter().filter(|e| matches!(e, ServerEvent::Connected(_, _))).count(),
            4,
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(1))).await;

        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();

        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(c) if *c == cid))
        }).await, "idle connection was not closed");

        // no messages, exactly one close
        let events = receiver.events();
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Message(_, _))));
        assert_eq!(events.iter().filter(|e| matches!(e, ServerEvent::Closed(_))).count(), 1);
        assert_eq!(server.live_connections(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_activity_defers_idle_timeout() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(2))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();

        // keep the connection busy for longer than the idle timeout
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            peer.write_all(b"\0\0\0\x01x").await.unwrap();
        }
        assert!(!receiver.events().iter().any(|e| matches!(e, ServerEvent::Closed(_))),
            "active connection was closed by the sweeper");

        // once quiet, the sweeper reaps it
        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(c) if *c == cid))
        }).await);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_connection_notifies_after_pending_messages() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();

        peer.write_all(b"\0\0\0\x01a\0\0\0\x01b").await.unwrap();
        assert!(receiver.wait_until(|events| {
            events.iter().filter(|e| matches!(e, ServerEvent::Message(_, _))).count() == 2
        }).await);

        assert!(server.close_connection(cid));
        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(c) if *c == cid))
        }).await);

        // writes racing the close must not surface after on_closed
        let _ = peer.write_all(b"\0\0\0\x01c").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let events = receiver.events();
        let closed_at = events.iter()
            .position(|e| matches!(e, ServerEvent::Closed(_)))
            .unwrap();
        assert!(!events[closed_at + 1..].iter().any(|e| matches!(e, ServerEvent::Message(_, _))));
        assert_eq!(events.iter().filter(|e| matches!(e, ServerEvent::Closed(_))).count(), 1);

        // the id is stale from here on
        assert!(!server.send(cid, b"x"));
        assert!(!server.close_connection(cid));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_and_forged_ids_are_rejected() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();
        assert!(server.send(cid, b"x"));

        // wrong magic (an id from a different server lifetime)
        let forged = ConnectionId::new(cid.magic() ^ 0x5a5a, cid.listen_port(), cid.index());
        assert!(!server.send(forged, b"x"));
        assert!(server.user_data(forged).is_none());

        // index beyond the configured capacity
        let out_of_range = ConnectionId::new(cid.magic(), cid.listen_port(), 1000);
        assert!(!server.send(out_of_range, b"x"));

        // the sentinel
        assert!(!server.send(ConnectionId::INVALID, b"x"));

        // stale after close: the slot is empty, the old id dead
        server.close_connection(cid);
        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(_)))
        }).await);
        assert!(!server.send(cid, b"x"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_data_and_extend_info() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let _peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();

        assert!(server.user_data(cid).is_none());
        assert!(server.set_user_data(cid, Some(Arc::new(42u32))));
        assert_eq!(server.user_data(cid).unwrap().downcast_ref::<u32>(), Some(&42));

        assert_eq!(server.extend_info(cid), Some(0));
        assert!(server.set_extend_info(cid, 99));
        assert_eq!(server.extend_info(cid), Some(99));

        assert!(server.peer_addr(cid).is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completeness() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        receiver.wait_for_connection().await.unwrap();

        server.shutdown().await;

        // no callbacks after shutdown returned, the queue is drained
        let events_after_shutdown = receiver.events();
        let _ = peer.write_all(b"\0\0\0\x01x").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(receiver.events(), events_after_shutdown);
        assert_eq!(server.pending_events(), 0);
        assert_eq!(server.live_connections(), 0);

        // the peer's socket is dead
        let mut buf = [0u8; 16];
        match tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => {}
            Ok(Ok(n)) => panic!("received {} bytes from a dead server", n),
            Err(_) => panic!("socket not closed by server shutdown"),
        }

        // idempotent, and the server stays down
        server.shutdown().await;
        assert!(server.start().is_err());
    }

    #[tokio::test]
    async fn test_peer_disconnect_emits_closed() {
        let (server, receiver, port) = started_server(test_options(4, Duration::from_secs(30))).await;

        let peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let cid = receiver.wait_for_connection().await.unwrap();

        drop(peer);
        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(c) if *c == cid))
        }).await);
        assert_eq!(server.live_connections(), 0);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_framing_violation_closes_connection() {
        // tighten the protocol so an absurd length header is rejected
        let receiver = Arc::new(RecordingServerReceiver::new());
        let server = TcpServer::new(receiver.clone(), test_options(4, Duration::from_secs(30)));
        server.set_protocol(Arc::new(LengthPrefixProtocol::with_max_payload_size(64))).unwrap();
        let port = server.add_listening("127.0.0.1:0").await.unwrap()[0];
        server.start().unwrap();

        let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        peer.write_all(b"\xff\xff\xff\xff").await.unwrap();

        assert!(receiver.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Closed(_)))
        }).await);
        assert!(!receiver.events().iter().any(|e| matches!(e, ServerEvent::Message(_, _))));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let receiver = Arc::new(RecordingServerReceiver::new());
        let server = TcpServer::new(receiver, RaptorOptions::default());
        server.start().unwrap();
        assert!(server.start().is_err());
        assert!(server.set_protocol(Arc::new(LengthPrefixProtocol::new())).is_err());
        server.shutdown().await;
    }
}
