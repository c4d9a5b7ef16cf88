use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use tokio::net::{lookup_host, TcpListener};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::service::Acceptor;
use crate::shutdown::ShutdownLatch;

/// Owns the accepting sockets and their accept loops. Sockets are bound when
///  an address is added (resolution happens right there, through the platform
///  resolver); the loops start when the server starts and feed every accepted
///  socket into the [Acceptor] seam. Accept errors are logged and retried -
///  only shutdown ends a loop.
pub(crate) struct Listener {
    shutdown: Arc<ShutdownLatch>,
    /// bound but not yet accepting; drained by [Listener::start]
    pending: Mutex<Vec<TcpListener>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(shutdown: Arc<ShutdownLatch>) -> Listener {
        Listener {
            shutdown,
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Resolve `addr` (`host:port` or `[host]:port`) and bind every resolved
    ///  address. Succeeds if at least one address bound, returning the bound
    ///  ports (useful when binding port 0).
    pub async fn add_listening(&self, addr: &str) -> anyhow::Result<Vec<u16>> {
        let resolved = lookup_host(addr).await
            .map_err(|e| anyhow!("cannot resolve listen address {}: {}", addr, e))?
            .collect::<Vec<_>>();
        if resolved.is_empty() {
            bail!("listen address {} resolved to nothing", addr);
        }

        let mut bound = Vec::new();
        let mut last_error = None;
        for socket_addr in resolved {
            match TcpListener::bind(socket_addr).await {
                Ok(socket) => {
                    debug!("listening on {:?}", socket.local_addr());
                    bound.push(socket);
                }
                Err(e) => {
                    warn!("cannot bind {}: {}", socket_addr, e);
                    last_error = Some(e);
                }
            }
        }

        if bound.is_empty() {
            return Err(anyhow!("cannot bind any address for {}: {}",
                addr,
                last_error.expect("no bind error despite empty bind result"),
            ));
        }

        let ports = bound.iter()
            .map(|socket| socket.local_addr().map(|a| a.port()).unwrap_or(0))
            .collect();
        self.pending.lock().expect("poisoned listener lock").extend(bound);
        Ok(ports)
    }

    /// Spawn an accept loop for every bound socket that does not have one
    ///  yet.
    pub fn start(&self, acceptor: Arc<dyn Acceptor>) {
        let sockets = {
            let mut pending = self.pending.lock().expect("poisoned listener lock");
            std::mem::take(&mut *pending)
        };

        let mut tasks = self.tasks.lock().expect("poisoned listener lock");
        for socket in sockets {
            tasks.push(tokio::spawn(accept_loop(socket, acceptor.clone(), self.shutdown.clone())));
        }
    }

    /// Wait for all accept loops to observe the shutdown latch and end.
    ///  (Triggering the latch is the owner's responsibility.)
    pub async fn shutdown(&self) {
        self.pending.lock().expect("poisoned listener lock").clear();

        let tasks = {
            let mut tasks = self.tasks.lock().expect("poisoned listener lock");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn accept_loop(socket: TcpListener, acceptor: Arc<dyn Acceptor>, shutdown: Arc<ShutdownLatch>) {
    let listen_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            accepted = socket.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        acceptor.on_new_connection(stream, listen_port, peer_addr);
                    }
                    Err(e) => {
                        // transient resource errors (EMFILE and friends) -
                        //  log and keep accepting
                        warn!("accept error on port {}: {}", listen_port, e);
                    }
                }
            }
        }
    }
    debug!("accept loop on port {} terminated", listen_port);
}
