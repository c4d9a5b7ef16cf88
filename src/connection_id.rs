use std::fmt::{Debug, Formatter};

/// Opaque 64-bit handle identifying a connection in a server's table.
///
/// The layout is `{magic:16 | listen_port:16 | index:32}` from high to low
///  bits. The magic is chosen once per server start (derived from wall-clock
///  seconds), so a handle kept across a restart fails validation instead of
///  silently addressing whatever connection happens to occupy the slot now.
///  The index gives O(1) access to the connection table; the listening port
///  is informational.
///
/// NB: The magic is *not* a security feature - it does not need to be
///      unguessable, it only needs to differ between server lifetimes with
///      high probability.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// The sentinel returned / rejected by all operations; no valid id has
    ///  this representation (the server never uses magic 0).
    pub const INVALID: ConnectionId = ConnectionId(0);

    pub const fn new(magic: u16, listen_port: u16, index: u32) -> ConnectionId {
        ConnectionId(((magic as u64) << 48) | ((listen_port as u64) << 32) | index as u64)
    }

    pub const fn from_raw(raw: u64) -> ConnectionId {
        ConnectionId(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn magic(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn listen_port(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "[{:04x}@{}#{}]", self.magic(), self.listen_port(), self.index())
        }
        else {
            write!(f, "[invalid]")
        }
    }
}
