use std::cell::UnsafeCell;
use std::net::SocketAddr;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::connection_id::ConnectionId;

/// One event on its way from an I/O task to the user's callbacks.
#[derive(Debug)]
pub(crate) enum TcpMessage {
    NewConnection { cid: ConnectionId, peer_addr: SocketAddr },
    MessageReceived { cid: ConnectionId, payload: Bytes },
    ConnectionClosed { cid: ConnectionId },
}

struct Node {
    next: AtomicPtr<Node>,
    msg: Option<TcpMessage>,
}

enum PopResult {
    Data(TcpMessage),
    Empty,
    /// a producer was preempted between swapping the head and linking its
    ///  node - the queue is non-empty but momentarily untraversable, retry
    Inconsistent,
}

/// Multi-producer single-consumer queue of [TcpMessage]s: a linked list with
///  a stub node where producers atomically swap themselves in at the head and
///  the single consumer chases the tail.
///
/// `push` is wait-free and may be called from any task or thread. `pop` must
///  only ever be called from one consumer at a time; [DispatchQueue] enforces
///  this by keeping the queue private to the dispatch task (plus the
///  single-threaded shutdown drain after that task has ended).
struct MpscQueue {
    head: AtomicPtr<Node>,
    tail: UnsafeCell<*mut Node>,
}

unsafe impl Send for MpscQueue {}
unsafe impl Sync for MpscQueue {}

impl MpscQueue {
    fn new() -> MpscQueue {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            msg: None,
        }));
        MpscQueue {
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
        }
    }

    fn push(&self, msg: TcpMessage) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            msg: Some(msg),
        }));

        let prev = self.head.swap(node, Ordering::AcqRel);
        // a pop() between the swap above and the store below observes the
        //  'inconsistent' state and retries
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    fn pop(&self) -> PopResult {
        unsafe {
            let tail = *self.tail.get();
            let next = (*tail).next.load(Ordering::Acquire);

            if next.is_null() {
                return if tail == self.head.load(Ordering::Acquire) {
                    PopResult::Empty
                }
                else {
                    PopResult::Inconsistent
                };
            }

            *self.tail.get() = next;
            drop(Box::from_raw(tail));

            let msg = (*next).msg.take()
                .expect("non-stub queue node without a message");
            PopResult::Data(msg)
        }
    }
}

impl Drop for MpscQueue {
    fn drop(&mut self) {
        unsafe {
            let mut node = *self.tail.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Acquire);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

/// The queue feeding the dispatch task, together with the pending counter and
///  wakeup used as the producer/consumer handshake. Producers are the poller
///  drivers and the accept path; the sole consumer is the server's dispatch
///  task (and the shutdown drain once that task has ended).
pub(crate) struct DispatchQueue {
    queue: MpscQueue,
    pending: AtomicUsize,
    readable: Notify,
}

impl DispatchQueue {
    pub fn new() -> DispatchQueue {
        DispatchQueue {
            queue: MpscQueue::new(),
            pending: AtomicUsize::new(0),
            readable: Notify::new(),
        }
    }

    pub fn push(&self, msg: TcpMessage) {
        self.queue.push(msg);
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.readable.notify_one();
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Pop without waiting; `None` means the queue is empty. Spins through
    ///  the transient inconsistent state (bounded by the producer finishing
    ///  two instructions).
    pub fn try_pop(&self) -> Option<TcpMessage> {
        loop {
            match self.queue.pop() {
                PopResult::Data(msg) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    return Some(msg);
                }
                PopResult::Empty => return None,
                PopResult::Inconsistent => std::hint::spin_loop(),
            }
        }
    }

    /// Wait until a message is available and pop it. Cancel safe: a message
    ///  is only removed from the queue when this completes.
    pub async fn pop_wait(&self) -> TcpMessage {
        loop {
            if let Some(msg) = self.try_pop() {
                return msg;
            }

            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // re-check: a push may have landed between try_pop and enable
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            notified.await;
        }
    }
}
