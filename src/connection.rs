use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::connection_id::ConnectionId;
use crate::protocol::Protocol;
use crate::service::NotificationTransfer;
use crate::shutdown::ShutdownLatch;
use crate::slice_buffer::SliceBuffer;

/// receive scratch buffer size - an implementation constant, not part of any
///  contract
pub(crate) const RECV_CHUNK_SIZE: usize = 8 * 1024;

/// Per-session state: the socket, both stream buffers and the frozen
///  protocol. A connection is owned exclusively by its server table slot (or
///  by the client); the poller's driver tasks hold it only to observe
///  readiness, and the server passes itself in as a borrowed sink for every
///  event call, so there is no strong reference cycle.
///
/// The receive buffer is touched only by the receive driver. The send buffer
///  is guarded by its mutex because `send` may be called from arbitrary
///  tasks and threads.
pub(crate) struct Connection {
    cid: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocol: Arc<dyn Protocol>,

    rcv_buffer: Mutex<SliceBuffer>,
    snd_buffer: Mutex<SliceBuffer>,

    /// armed whenever the send buffer (re)gains content the socket has not
    ///  accepted yet; the send driver parks on this
    send_ready: Notify,
    closed: ShutdownLatch,

    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    extend_info: AtomicU64,
}

impl Connection {
    pub fn new(
        cid: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        protocol: Arc<dyn Protocol>,
    ) -> Connection {
        Connection {
            cid,
            stream,
            peer_addr,
            protocol,
            rcv_buffer: Mutex::new(SliceBuffer::new()),
            snd_buffer: Mutex::new(SliceBuffer::new()),
            send_ready: Notify::new(),
            closed: ShutdownLatch::new(),
            user_data: Mutex::new(None),
            extend_info: AtomicU64::new(0),
        }
    }

    pub fn cid(&self) -> ConnectionId {
        self.cid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn closed(&self) -> &ShutdownLatch {
        &self.closed
    }

    pub fn send_ready(&self) -> &Notify {
        &self.send_ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_triggered()
    }

    /// Frame `payload` with a header built by the connection's protocol and
    ///  queue it for sending. Returns false iff the connection is closed.
    ///  Callable from arbitrary threads.
    pub fn send(&self, payload: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        let header = self.protocol.build_package_header(payload.len());
        self.enqueue(&header, payload);
        true
    }

    /// Like [Self::send], but with a caller-supplied header instead of one
    ///  built by the protocol - a passthrough for data that is already
    ///  framed.
    pub fn send_with_header(&self, header: &[u8], payload: &[u8]) -> bool {
        if self.is_closed() {
            return false;
        }
        self.enqueue(header, payload);
        true
    }

    fn enqueue(&self, header: &[u8], payload: &[u8]) {
        {
            let mut snd = self.snd_buffer.lock().expect("poisoned send buffer lock");
            snd.add_slice(Bytes::copy_from_slice(header));
            snd.add_slice(Bytes::copy_from_slice(payload));
        }
        self.send_ready.notify_one();
    }

    /// Process read readiness: pull bytes off the socket into the receive
    ///  buffer and deliver every complete package through `sink`. Returns
    ///  false on peer EOF, I/O error or framing violation - the caller tears
    ///  the connection down.
    pub fn do_recv_event(&self, sink: &dyn NotificationTransfer) -> bool {
        let mut rcv = self.rcv_buffer.lock().expect("poisoned receive buffer lock");

        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        loop {
            let num_read = match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!(cid = ?self.cid, "peer closed the connection");
                    return false;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(cid = ?self.cid, "receive error: {}", e);
                    return false;
                }
            };

            rcv.add_slice(Bytes::copy_from_slice(&chunk[..num_read]));

            let drained = drain_packages(&mut rcv, self.protocol.as_ref(), &mut |payload| {
                sink.on_data_received(self.cid, payload);
            });
            if let Err(e) = drained {
                warn!(cid = ?self.cid, "closing connection: {}", e);
                return false;
            }

            // only a completely filled chunk hints at more pending bytes
            if num_read < chunk.len() {
                return true;
            }
        }
    }

    /// Process write readiness: push buffered bytes into the socket until it
    ///  would block or the buffer is empty. Returns false on I/O error.
    pub fn do_send_event(&self) -> bool {
        let mut snd = self.snd_buffer.lock().expect("poisoned send buffer lock");

        while let Some(top) = snd.top_slice() {
            match self.stream.try_write(&top) {
                Ok(0) => return false,
                Ok(num_written) => snd.advance(num_written),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // re-arm so the driver waits for writability again
                    //  instead of parking on an already-consumed notification
                    self.send_ready.notify_one();
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(cid = ?self.cid, "send error: {}", e);
                    return false;
                }
            }
        }
        true
    }

    /// Close the connection: trip the closed latch (stopping both driver
    ///  tasks), release the buffers and, if `notify` is set, report the close
    ///  through `sink`. Idempotent. The socket itself closes when the last
    ///  holder of the connection drops it.
    pub fn shutdown(&self, notify: bool, sink: &dyn NotificationTransfer) {
        if !self.closed.trigger() {
            return;
        }

        if notify {
            sink.on_connection_closed(self.cid);
        }

        self.rcv_buffer.lock().expect("poisoned receive buffer lock").clear();
        self.snd_buffer.lock().expect("poisoned send buffer lock").clear();
    }

    pub fn set_user_data(&self, data: Option<Arc<dyn Any + Send + Sync>>) {
        *self.user_data.lock().expect("poisoned user data lock") = data;
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.lock().expect("poisoned user data lock").clone()
    }

    pub fn set_extend_info(&self, info: u64) {
        self.extend_info.store(info, Ordering::Release);
    }

    pub fn extend_info(&self) -> u64 {
        self.extend_info.load(Ordering::Acquire)
    }
}

/// The framing loop shared by server connections and the client: repeatedly
///  peek a header window off `rcv`, ask the protocol for the total package
///  length, and extract / deliver complete packages until the buffered data
///  runs short.
pub(crate) fn drain_packages(
    rcv: &mut SliceBuffer,
    protocol: &dyn Protocol,
    deliver: &mut dyn FnMut(Bytes),
) -> anyhow::Result<()> {
    loop {
        let cached = rcv.len();
        if cached == 0 {
            return Ok(());
        }

        let header = rcv.peek(protocol.max_header_size());
        let pack_len = protocol.check_package_length(&header);

        if pack_len < 0 {
            bail!("protocol rejected a package header ({})", pack_len);
        }
        if pack_len == 0 {
            if header.len() >= protocol.max_header_size() {
                bail!("protocol made no progress on a full header window");
            }
            return Ok(()); // need more data
        }

        let pack_len = pack_len as usize;
        if cached < pack_len {
            return Ok(()); // package not fully buffered yet
        }

        let package = rcv.take(pack_len);
        match protocol.parse_package(package) {
            Some(payload) => deliver(payload),
            None => bail!("protocol failed to parse a complete package"),
        }
    }
}
