use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::Connection;
use crate::service::EventHandler;
use crate::shutdown::ShutdownLatch;

/// seconds since the UNIX epoch, the time base of the idle-deadline index
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_secs()
}

/// The readiness event loop: the sole producer of per-connection I/O events.
///
/// [ReadinessPoller::register] spawns two driver tasks per connection. The
///  receive driver awaits read readiness and reports it as
///  [EventHandler::on_recv_event]; the send driver parks until the connection
///  signals buffered data, then awaits write readiness and reports
///  [EventHandler::on_send_event]. Readiness errors become
///  [EventHandler::on_error_event]. A separate tick task fires
///  [EventHandler::on_checking_event] once per second for the idle sweeper.
///
/// Drivers stop when the handler reports the connection dead (`false`), when
///  the connection's closed latch trips, or when the poller shuts down.
///  Registration cannot fail: spawning onto a live runtime always succeeds,
///  so there is no submit-failure unwind path here (a completion-based
///  implementation posting its first asynchronous receive would need one).
pub(crate) struct ReadinessPoller {
    handler: Arc<dyn EventHandler>,
    shutdown: Arc<ShutdownLatch>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    driver_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadinessPoller {
    pub fn new(handler: Arc<dyn EventHandler>) -> ReadinessPoller {
        ReadinessPoller {
            handler,
            shutdown: Arc::new(ShutdownLatch::new()),
            tick_task: Mutex::new(None),
            driver_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the periodic tick. `tick_interval` is at least one second;
    ///  coarser is allowed.
    pub fn start(&self, tick_interval: Duration) {
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => handler.on_checking_event(now_secs()),
                }
            }
        });
        *self.tick_task.lock().expect("poisoned tick task lock") = Some(task);
    }

    /// Put a connection under poller control. From here on, all of its I/O
    ///  events flow into the handler.
    pub fn register(&self, conn: &Arc<Connection>) {
        let mut driver_tasks = self.driver_tasks.lock().expect("poisoned driver task lock");
        driver_tasks.retain(|task| !task.is_finished());
        driver_tasks.push(tokio::spawn(recv_driver(conn.clone(), self.handler.clone(), self.shutdown.clone())));
        driver_tasks.push(tokio::spawn(send_driver(conn.clone(), self.handler.clone(), self.shutdown.clone())));
    }

    /// Stop the tick and all driver tasks; joins them, so once this returns
    ///  no further event reaches the handler.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let task = self.tick_task.lock().expect("poisoned tick task lock").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let driver_tasks = {
            let mut driver_tasks = self.driver_tasks.lock().expect("poisoned driver task lock");
            std::mem::take(&mut *driver_tasks)
        };
        for task in driver_tasks {
            let _ = task.await;
        }
    }
}

async fn recv_driver(
    conn: Arc<Connection>,
    handler: Arc<dyn EventHandler>,
    shutdown: Arc<ShutdownLatch>,
) {
    let cid = conn.cid();
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = conn.closed().wait() => break,
            readable = conn.stream().readable() => {
                match readable {
                    Ok(()) => {
                        if !handler.on_recv_event(cid) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(?cid, "read readiness error: {}", e);
                        handler.on_error_event(cid);
                        break;
                    }
                }
            }
        }
    }
}

async fn send_driver(
    conn: Arc<Connection>,
    handler: Arc<dyn EventHandler>,
    shutdown: Arc<ShutdownLatch>,
) {
    let cid = conn.cid();
    loop {
        // park until there is something to write
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = conn.closed().wait() => break,
            _ = conn.send_ready().notified() => {}
        }

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = conn.closed().wait() => break,
            writable = conn.stream().writable() => {
                match writable {
                    Ok(()) => {
                        if !handler.on_send_event(cid) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(?cid, "write readiness error: {}", e);
                        handler.on_error_event(cid);
                        break;
                    }
                }
            }
        }
    }
}
