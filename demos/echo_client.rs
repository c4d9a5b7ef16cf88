use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, Level};

use raptor::client::TcpClient;
use raptor::service::ClientReceiver;

struct LoggingService;

#[async_trait]
impl ClientReceiver for LoggingService {
    async fn on_connect_result(&self, success: bool) {
        info!("connect result: {}", success);
    }

    async fn on_message_received(&self, payload: Bytes) {
        info!("received: {:?}", String::from_utf8_lossy(&payload));
    }

    async fn on_closed(&self) {
        info!("connection closed");
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

    let client = TcpClient::new(Arc::new(LoggingService));
    client.connect("127.0.0.1:9876", Duration::from_secs(3)).await?;

    for i in 0..5 {
        client.send(format!("hello #{}", i).as_bytes());
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    client.shutdown().await;
    Ok(())
}
