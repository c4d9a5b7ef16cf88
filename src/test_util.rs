//! Shared helpers for the in-module tests: loopback socket pairs and
//!  recording implementations of the callback surfaces.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::connection_id::ConnectionId;
use crate::service::{ClientReceiver, ServerReceiver};

/// a freshly connected loopback socket pair (accepted end first)
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connecting = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    let connected = connecting.await.unwrap();

    (accepted, connected)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected(ConnectionId, SocketAddr),
    Message(ConnectionId, Bytes),
    Closed(ConnectionId),
}

/// A [ServerReceiver] that records every callback in order and lets tests
///  wait for a condition on the recorded sequence.
pub struct RecordingServerReceiver {
    events: StdMutex<Vec<ServerEvent>>,
    changed: Notify,
}

impl RecordingServerReceiver {
    pub fn new() -> RecordingServerReceiver {
        RecordingServerReceiver {
            events: StdMutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    fn record(&self, event: ServerEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait (up to 5s) until the recorded event sequence satisfies `pred`.
    pub async fn wait_until(&self, pred: impl Fn(&[ServerEvent]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&self.events.lock().unwrap()) {
                return true;
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if pred(&self.events.lock().unwrap()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    pub async fn wait_for_connection(&self) -> Option<ConnectionId> {
        self.wait_until(|events| {
            events.iter().any(|e| matches!(e, ServerEvent::Connected(_, _)))
        }).await;

        self.events().iter().find_map(|e| match e {
            ServerEvent::Connected(cid, _) => Some(*cid),
            _ => None,
        })
    }
}

#[async_trait]
impl ServerReceiver for RecordingServerReceiver {
    async fn on_connected(&self, cid: ConnectionId, peer_addr: SocketAddr) {
        self.record(ServerEvent::Connected(cid, peer_addr));
    }

    async fn on_message_received(&self, cid: ConnectionId, payload: Bytes) {
        self.record(ServerEvent::Message(cid, payload));
    }

    async fn on_closed(&self, cid: ConnectionId) {
        self.record(ServerEvent::Closed(cid));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectResult(bool),
    Message(Bytes),
    Closed,
}

pub struct RecordingClientReceiver {
    events: StdMutex<Vec<ClientEvent>>,
    changed: Notify,
}

impl RecordingClientReceiver {
    pub fn new() -> RecordingClientReceiver {
        RecordingClientReceiver {
            events: StdMutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    fn record(&self, event: ClientEvent) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_until(&self, pred: impl Fn(&[ClientEvent]) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if pred(&self.events.lock().unwrap()) {
                return true;
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if pred(&self.events.lock().unwrap()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }
}

#[async_trait]
impl ClientReceiver for RecordingClientReceiver {
    async fn on_connect_result(&self, success: bool) {
        self.record(ClientEvent::ConnectResult(success));
    }

    async fn on_message_received(&self, payload: Bytes) {
        self.record(ClientEvent::Message(payload));
    }

    async fn on_closed(&self) {
        self.record(ClientEvent::Closed);
    }
}
