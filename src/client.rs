use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{drain_packages, RECV_CHUNK_SIZE};
use crate::protocol::{LengthPrefixProtocol, Protocol};
use crate::service::ClientReceiver;
use crate::shutdown::ShutdownLatch;
use crate::slice_buffer::SliceBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Idle,
    Connecting,
    Connected,
    /// terminal, entered only through [TcpClient::shutdown]
    Shut,
}

/// The single-connection counterpart of the server engine: one socket, one
///  worker task, the same framing loop. `connect` returns once the attempt
///  is in flight; the worker reports the outcome through
///  [ClientReceiver::on_connect_result] and then pumps receive and send
///  events until the connection breaks (`on_closed`) or the client shuts
///  down (silent).
///
/// `send` may be called from arbitrary tasks and threads; it buffers from
///  the moment a connect is in flight, and the buffer drains once the
///  connection is writable.
pub struct TcpClient {
    /// self-reference handed to the worker task (the client is only ever
    ///  constructed inside an `Arc`)
    weak_self: Weak<TcpClient>,

    receiver: Arc<dyn ClientReceiver>,
    protocol: Mutex<Arc<dyn Protocol>>,

    state: Mutex<ClientState>,
    snd_buffer: Mutex<SliceBuffer>,
    send_ready: Notify,
    shutdown: ShutdownLatch,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClient {
    pub fn new(receiver: Arc<dyn ClientReceiver>) -> Arc<TcpClient> {
        Arc::new_cyclic(|weak_self| TcpClient {
            weak_self: weak_self.clone(),
            receiver,
            protocol: Mutex::new(Arc::new(LengthPrefixProtocol::new())),
            state: Mutex::new(ClientState::Idle),
            snd_buffer: Mutex::new(SliceBuffer::new()),
            send_ready: Notify::new(),
            shutdown: ShutdownLatch::new(),
            worker: Mutex::new(None),
        })
    }

    /// Replace the default length-prefix protocol. Only allowed while no
    ///  connection is in flight.
    pub fn set_protocol(&self, protocol: Arc<dyn Protocol>) -> anyhow::Result<()> {
        if *self.state_lock() != ClientState::Idle {
            bail!("cannot change the protocol while a connection is in flight");
        }
        *self.protocol.lock().expect("poisoned protocol lock") = protocol;
        Ok(())
    }

    /// Resolve `addr` (first address only) and start connecting. Resolution
    ///  errors surface here; the outcome of the connect itself is reported
    ///  asynchronously via `on_connect_result` exactly once.
    ///
    /// After a failed attempt or a broken connection the client returns to
    ///  idle and `connect` may be called again.
    pub async fn connect(&self, addr: &str, connect_timeout: Duration) -> anyhow::Result<()> {
        if self.shutdown.is_triggered() {
            bail!("tcp client is shut down");
        }
        {
            let mut state = self.state_lock();
            if *state != ClientState::Idle {
                bail!("tcp client is already connecting or connected");
            }
            *state = ClientState::Connecting;
        }

        let target = match lookup_host(addr).await {
            Ok(mut addrs) => match addrs.next() {
                Some(target) => target,
                None => {
                    *self.state_lock() = ClientState::Idle;
                    return Err(anyhow!("address {} resolved to nothing", addr));
                }
            },
            Err(e) => {
                *self.state_lock() = ClientState::Idle;
                return Err(anyhow!("cannot resolve {}: {}", addr, e));
            }
        };

        let client = self.weak_self.upgrade().expect("client instance already dropped");
        let worker = tokio::spawn(async move { client.worker(target, connect_timeout).await });
        *self.worker.lock().expect("poisoned worker lock") = Some(worker);
        Ok(())
    }

    /// Frame `payload` with the client's protocol and queue it for sending.
    ///  `false` unless a connection is established or in flight.
    pub fn send(&self, payload: &[u8]) -> bool {
        if !self.is_online() {
            return false;
        }

        let protocol = self.protocol.lock().expect("poisoned protocol lock").clone();
        let header = protocol.build_package_header(payload.len());
        {
            let mut snd = self.snd_buffer.lock().expect("poisoned send buffer lock");
            snd.add_slice(header);
            snd.add_slice(Bytes::copy_from_slice(payload));
        }
        self.send_ready.notify_one();
        true
    }

    pub fn is_online(&self) -> bool {
        matches!(*self.state_lock(), ClientState::Connecting | ClientState::Connected)
    }

    /// Terminal teardown. After this returns no callback fires anymore and
    ///  the client rejects further use.
    pub async fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }

        let worker = self.worker.lock().expect("poisoned worker lock").take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        *self.state_lock() = ClientState::Shut;
        self.snd_buffer.lock().expect("poisoned send buffer lock").clear();
    }

    fn state_lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().expect("poisoned state lock")
    }

    async fn connect_failed(&self) {
        *self.state_lock() = ClientState::Idle;
        if !self.shutdown.is_triggered() {
            self.receiver.on_connect_result(false).await;
        }
    }

    async fn worker(self: Arc<Self>, target: SocketAddr, connect_timeout: Duration) {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("connect to {} failed: {}", target, e);
                self.connect_failed().await;
                return;
            }
            Err(_) => {
                debug!("connect to {} timed out", target);
                self.connect_failed().await;
                return;
            }
        };

        if self.shutdown.is_triggered() {
            return;
        }
        *self.state_lock() = ClientState::Connected;
        self.receiver.on_connect_result(true).await;

        let mut rcv = SliceBuffer::new();
        let mut error_occurred = false;

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => break,
                readable = stream.readable() => {
                    match readable {
                        Ok(()) => {
                            if !self.drive_recv(&stream, &mut rcv).await {
                                error_occurred = true;
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("read readiness error: {}", e);
                            error_occurred = true;
                            break;
                        }
                    }
                }
                _ = self.send_ready.notified() => {
                    let writable = tokio::select! {
                        _ = self.shutdown.wait() => break,
                        writable = stream.writable() => writable,
                    };
                    match writable {
                        Ok(()) => {
                            if !self.drive_send(&stream) {
                                error_occurred = true;
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("write readiness error: {}", e);
                            error_occurred = true;
                            break;
                        }
                    }
                }
            }
        }

        self.snd_buffer.lock().expect("poisoned send buffer lock").clear();
        if self.shutdown.is_triggered() {
            return; // user-initiated, no callback
        }
        *self.state_lock() = ClientState::Idle;
        if error_occurred {
            self.receiver.on_closed().await;
        }
    }

    /// drain readable bytes and deliver the complete packages; false tears
    ///  the connection down
    async fn drive_recv(&self, stream: &TcpStream, rcv: &mut SliceBuffer) -> bool {
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        let mut payloads = Vec::new();

        let healthy = loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    debug!("server closed the connection");
                    break false;
                }
                Ok(num_read) => {
                    rcv.add_slice(Bytes::copy_from_slice(&chunk[..num_read]));

                    let protocol = self.protocol.lock().expect("poisoned protocol lock").clone();
                    let drained = drain_packages(rcv, protocol.as_ref(), &mut |payload| {
                        payloads.push(payload);
                    });
                    if let Err(e) = drained {
                        warn!("closing connection: {}", e);
                        break false;
                    }
                    if num_read < chunk.len() {
                        break true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break true,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("receive error: {}", e);
                    break false;
                }
            }
        };

        // deliver even when the read ended in an error - these packages were
        //  complete on the wire
        for payload in payloads {
            self.receiver.on_message_received(payload).await;
        }
        healthy
    }

    fn drive_send(&self, stream: &TcpStream) -> bool {
        let mut snd = self.snd_buffer.lock().expect("poisoned send buffer lock");

        while let Some(top) = snd.top_slice() {
            match stream.try_write(&top) {
                Ok(0) => return false,
                Ok(num_written) => snd.advance(num_written),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.send_ready.notify_one();
                    return true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("send error: {}", e);
                    return false;
                }
            }
        }
        true
    }
}
