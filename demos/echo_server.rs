use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, Level};

use raptor::config::RaptorOptions;
use raptor::connection_id::ConnectionId;
use raptor::server::TcpServer;
use raptor::service::ServerReceiver;

/// echoes every received message back to its sender
struct EchoService {
    server: OnceLock<Arc<TcpServer>>,
}

#[async_trait]
impl ServerReceiver for EchoService {
    async fn on_connected(&self, cid: ConnectionId, peer_addr: SocketAddr) {
        info!("connected: {:?} from {}", cid, peer_addr);
    }

    async fn on_message_received(&self, cid: ConnectionId, payload: Bytes) {
        info!("received {} bytes from {:?}, echoing", payload.len(), cid);
        if let Some(server) = self.server.get() {
            server.send(cid, &payload);
        }
    }

    async fn on_closed(&self, cid: ConnectionId) {
        info!("closed: {:?}", cid);
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    init_logging();

    let service = Arc::new(EchoService { server: OnceLock::new() });
    let server = TcpServer::new(service.clone(), RaptorOptions::default());
    let _ = service.server.set(server.clone());

    let ports = server.add_listening("127.0.0.1:9876").await?;
    server.start()?;
    info!("echo server listening on {:?}", ports);

    std::future::pending::<()>().await;
    Ok(())
}
