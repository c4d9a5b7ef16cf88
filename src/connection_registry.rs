use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::trace;

use crate::config::RaptorOptions;
use crate::connection::Connection;
use crate::connection_id::ConnectionId;

/// `(deadline_second, slot_index)` - the index makes keys unique, so a plain
///  ordered set gives multimap semantics sorted by deadline
type TimeoutKey = (u64, u32);

struct ConnectionSlot {
    conn: Option<Arc<Connection>>,
    timeout_key: Option<TimeoutKey>,
}

/// The connection table with its free list and idle-deadline index. All
///  methods expect to run under the server's connection mutex; the registry
///  itself is plain single-threaded data.
///
/// Invariants maintained across all operations:
/// * the free list and the set of slots without a connection are equal as sets
/// * the deadline index and the set of slots with a connection are equal as
///   sets, keyed by the slot's stored timeout key
pub(crate) struct ConnectionRegistry {
    max_connections: usize,
    connection_timeout_secs: u64,
    slots: Vec<ConnectionSlot>,
    free_indices: VecDeque<u32>,
    timeouts: BTreeSet<TimeoutKey>,
}

impl ConnectionRegistry {
    pub fn new(options: &RaptorOptions) -> ConnectionRegistry {
        let initial = options.initial_capacity
            .clamp(1, options.max_connections.max(1));

        let mut registry = ConnectionRegistry {
            max_connections: options.max_connections,
            connection_timeout_secs: options.connection_timeout.as_secs(),
            slots: Vec::with_capacity(initial),
            free_indices: VecDeque::new(),
            timeouts: BTreeSet::new(),
        };
        registry.grow_to(initial);
        registry
    }

    fn grow_to(&mut self, new_len: usize) {
        for index in self.slots.len()..new_len {
            self.slots.push(ConnectionSlot { conn: None, timeout_key: None });
            self.free_indices.push_back(index as u32);
        }
    }

    /// Pop a free slot index, doubling the table (up to `max_connections`)
    ///  when the free list is dry. `None` means the table is full.
    pub fn reserve_index(&mut self) -> Option<u32> {
        if let Some(index) = self.free_indices.pop_front() {
            return Some(index);
        }

        if self.slots.len() >= self.max_connections {
            return None;
        }
        let new_len = (self.slots.len() * 2).clamp(1, self.max_connections);
        trace!("growing connection table to {} slots", new_len);
        self.grow_to(new_len);

        self.free_indices.pop_front()
    }

    /// Store a connection in a previously reserved slot and arm its idle
    ///  deadline.
    pub fn install(&mut self, index: u32, conn: Arc<Connection>, now_secs: u64) {
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.conn.is_none(), "installing into an occupied slot");

        let key = (now_secs + self.connection_timeout_secs, index);
        self.timeouts.insert(key);
        slot.conn = Some(conn);
        slot.timeout_key = Some(key);
    }

    /// Return an index reserved with [Self::reserve_index] that was never
    ///  installed (the accept path unwinding).
    pub fn release_index(&mut self, index: u32) {
        debug_assert!(self.slots[index as usize].conn.is_none());
        self.free_indices.push_back(index);
    }

    /// Look up a connection by its full id. `None` if the slot is empty *or*
    ///  occupied by a different (newer) connection - an event racing a slot
    ///  reuse must not be delivered to the new occupant.
    pub fn get(&self, cid: ConnectionId) -> Option<Arc<Connection>> {
        let slot = self.slots.get(cid.index() as usize)?;
        let conn = slot.conn.as_ref()?;
        if conn.cid() != cid {
            return None;
        }
        Some(conn.clone())
    }

    /// Push a connection's idle deadline out to `now + connection_timeout`.
    pub fn touch(&mut self, index: u32, now_secs: u64) {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return;
        };
        if slot.conn.is_none() {
            return;
        }

        if let Some(old_key) = slot.timeout_key.take() {
            self.timeouts.remove(&old_key);
        }
        let key = (now_secs + self.connection_timeout_secs, index);
        self.timeouts.insert(key);
        slot.timeout_key = Some(key);
    }

    /// Remove the connection identified by `cid`, clearing its slot, erasing
    ///  its deadline and returning the index to the free list. The caller is
    ///  responsible for actually shutting the connection down.
    pub fn remove(&mut self, cid: ConnectionId) -> Option<Arc<Connection>> {
        // full-id check, not just presence
        let _ = self.get(cid)?;
        self.remove_index(cid.index())
    }

    fn remove_index(&mut self, index: u32) -> Option<Arc<Connection>> {
        let slot = &mut self.slots[index as usize];
        let conn = slot.conn.take()?;
        if let Some(key) = slot.timeout_key.take() {
            self.timeouts.remove(&key);
        }
        self.free_indices.push_back(index);
        Some(conn)
    }

    /// Remove and return every connection whose idle deadline is at or before
    ///  `now`. Walks the deadline index from the front and stops at the first
    ///  entry in the future.
    pub fn sweep_expired(&mut self, now_secs: u64) -> Vec<Arc<Connection>> {
        let expired = self.timeouts
            .range(..=(now_secs, u32::MAX))
            .cloned()
            .collect::<Vec<_>>();

        expired.into_iter()
            .filter_map(|(_, index)| self.remove_index(index))
            .collect()
    }

    /// Empty the whole table for server shutdown: every live connection is
    ///  returned, the deadline index and free list are cleared and the table
    ///  is dropped.
    pub fn drain_all(&mut self) -> Vec<Arc<Connection>> {
        let live = self.slots.iter_mut()
            .filter_map(|slot| slot.conn.take())
            .collect();

        self.timeouts.clear();
        self.free_indices.clear();
        self.slots.clear();
        live
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free_indices.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let free_set = self.free_indices.iter().cloned().collect::<BTreeSet<_>>();
        assert_eq!(free_set.len(), self.free_indices.len(), "duplicate free index");

        for (i, slot) in self.slots.iter().enumerate() {
            let index = i as u32;
            match &slot.conn {
                None => {
                    assert!(free_set.contains(&index), "empty slot {} not in free list", i);
                    assert!(slot.timeout_key.is_none());
                }
                Some(_) => {
                    assert!(!free_set.contains(&index), "occupied slot {} in free list", i);
                    let key = slot.timeout_key.expect("occupied slot without deadline");
                    assert!(self.timeouts.contains(&key));
                }
            }
        }
        assert_eq!(self.timeouts.len(), self.live_count());
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test_util::tcp_pair;

    fn options(max: usize, initial: usize, timeout_secs: u64) -> RaptorOptions {
        RaptorOptions {
            max_connections: max,
            connection_timeout: Duration::from_secs(timeout_secs),
            initial_capacity: initial,
        }
    }

    async fn new_conn(cid: ConnectionId) -> Arc<Connection> {
        use crate::protocol::LengthPrefixProtocol;

        let (stream, _peer) = tcp_pair().await;
        let peer_addr = stream.peer_addr().unwrap();
        Arc::new(Connection::new(cid, stream, peer_addr, Arc::new(LengthPrefixProtocol::new())))
    }

    #[tokio::test]
    async fn test_install_get_remove() {
        let mut registry = ConnectionRegistry::new(&options(8, 4, 5));

        let index = registry.reserve_index().unwrap();
        let cid = ConnectionId::new(0x77, 9000, index);
        let conn = new_conn(cid).await;

        registry.install(index, conn.clone(), 100);
        registry.check_invariants();
        assert_eq!(registry.live_count(), 1);
        assert!(Arc::ptr_eq(&registry.get(cid).unwrap(), &conn));

        let removed = registry.remove(cid).unwrap();
        assert!(Arc::ptr_eq(&removed, &conn));
        registry.check_invariants();
        assert_eq!(registry.live_count(), 0);
        assert!(registry.get(cid).is_none());
    }

    #[tokio::test]
    async fn test_get_rejects_superseded_id() {
        let mut registry = ConnectionRegistry::new(&options(8, 4, 5));

        let index = registry.reserve_index().unwrap();
        let old_cid = ConnectionId::new(0x77, 9000, index);
        registry.install(index, new_conn(old_cid).await, 100);
        let _ = registry.remove(old_cid);

        // FIFO free list: the index comes back only after the others
        let mut reused = registry.reserve_index().unwrap();
        while reused != index {
            registry.release_index(reused);
            reused = registry.reserve_index().unwrap();
        }
        let new_cid = ConnectionId::new(0x88, 9000, index);
        registry.install(index, new_conn(new_cid).await, 100);

        assert!(registry.get(old_cid).is_none());
        assert!(registry.get(new_cid).is_some());
    }

    #[tokio::test]
    async fn test_growth_doubles_up_to_max() {
        let mut registry = ConnectionRegistry::new(&options(5, 2, 5));
        assert_eq!(registry.capacity(), 2);

        for i in 0..5 {
            let index = registry.reserve_index()
                .unwrap_or_else(|| panic!("no free slot for connection {}", i));
            let cid = ConnectionId::new(1, 1, index);
            registry.install(index, new_conn(cid).await, 100);
        }
        registry.check_invariants();
        assert_eq!(registry.capacity(), 5);

        // table full now
        assert_eq!(registry.reserve_index(), None);
    }

    #[tokio::test]
    async fn test_free_list_is_fifo() {
        let mut registry = ConnectionRegistry::new(&options(4, 4, 5));

        let a = registry.reserve_index().unwrap();
        let cid_a = ConnectionId::new(1, 1, a);
        registry.install(a, new_conn(cid_a).await, 100);
        let b = registry.reserve_index().unwrap();
        let cid_b = ConnectionId::new(1, 1, b);
        registry.install(b, new_conn(cid_b).await, 100);

        let _ = registry.remove(cid_a);
        let _ = registry.remove(cid_b);

        // remaining initial indices first, then the released ones in order
        let mut order = Vec::new();
        while let Some(i) = registry.reserve_index() {
            order.push(i);
            registry.release_index(order[order.len() - 1]);
            if order.len() == 2 {
                break;
            }
        }
        assert_eq!(order, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_sweep_only_removes_expired() {
        let mut registry = ConnectionRegistry::new(&options(8, 4, 10));

        let i1 = registry.reserve_index().unwrap();
        let cid1 = ConnectionId::new(1, 1, i1);
        registry.install(i1, new_conn(cid1).await, 100); // deadline 110

        let i2 = registry.reserve_index().unwrap();
        let cid2 = ConnectionId::new(1, 1, i2);
        registry.install(i2, new_conn(cid2).await, 105); // deadline 115

        assert!(registry.sweep_expired(109).is_empty());

        let expired = registry.sweep_expired(110);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].cid(), cid1);
        registry.check_invariants();

        assert!(registry.get(cid1).is_none());
        assert!(registry.get(cid2).is_some());

        let expired = registry.sweep_expired(200);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].cid(), cid2);
        registry.check_invariants();
    }

    #[tokio::test]
    async fn test_touch_defers_expiry() {
        let mut registry = ConnectionRegistry::new(&options(8, 4, 10));

        let index = registry.reserve_index().unwrap();
        let cid = ConnectionId::new(1, 1, index);
        registry.install(index, new_conn(cid).await, 100); // deadline 110

        registry.touch(index, 108); // deadline 118
        registry.check_invariants();

        assert!(registry.sweep_expired(110).is_empty());
        assert_eq!(registry.sweep_expired(118).len(), 1);
    }

    #[tokio::test]
    async fn test_drain_all() {
        let mut registry = ConnectionRegistry::new(&options(8, 4, 10));

        for _ in 0..3 {
            let index = registry.reserve_index().unwrap();
            let cid = ConnectionId::new(1, 1, index);
            registry.install(index, new_conn(cid).await, 100);
        }

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(registry.live_count(), 0);
        assert!(registry.sweep_expired(u64::MAX - 1000).is_empty());
    }
}
