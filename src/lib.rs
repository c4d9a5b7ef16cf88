//! A TCP networking framework core: a server and a client engine that handle
//!  many concurrent connections, frame length-delimited application messages
//!  over a pluggable wire protocol, and deliver them to user-supplied
//!  callbacks.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data) over plain TCP - framing is delegated to a [protocol::Protocol]
//!   implementation, with a length-prefix protocol bundled as the default
//! * Connections are addressed through compact 64-bit
//!   [connection_id::ConnectionId] handles instead of references, so user
//!   code can store and pass them freely; stale handles (a closed connection,
//!   or one from a previous server lifetime) fail validation instead of
//!   hitting whatever reuses the slot
//! * All user-visible callbacks of a server are serialized onto a single
//!   dispatch task, decoupled from the I/O paths through an MPSC queue -
//!   slow user code delays its own callbacks, never the sockets
//! * Idle connections are reaped by a deadline-ordered sweeper; any
//!   successful receive or send event resets a connection's clock
//! * Errors on one connection never affect another; the server stays up
//!   until it is explicitly shut down
//!
//! ## Architecture
//!
//! ```ascii
//! listener (accept loops)
//!     v
//! server table: slots + free list + deadline index   <- conn_mtx
//!     v                                   ^
//! poller: per-connection receive / send drivers + tick
//!     v
//! connection: framing loop over slice buffers
//!     v
//! MPSC dispatch queue -> dispatch task -> ServerReceiver callbacks
//! ```
//!
//! The poller is the sole producer of per-connection I/O events. It is
//!  readiness-based: drivers await socket readiness and the connection pulls
//!  bytes with non-blocking reads / writes, so a completion-based
//!  implementation could replace it behind the same event contract.

pub mod client;
pub mod config;
pub mod connection_id;
pub mod protocol;
pub mod server;
pub mod service;
pub mod slice_buffer;

mod connection;
mod connection_registry;
mod dispatch_queue;
mod listener;
mod poller;
mod shutdown;

#[cfg(test)]
mod test_util;
