//! UDP client registry: an open-addressing hash table keyed by source
//! address, with linear probing and LRU (smallest `last_seen`) eviction on
//! overflow (spec §4.8). Single-writer discipline: only the UDP receiver
//! thread is expected to call the mutating methods; callers on other
//! threads wrap this in their own short critical section for reads.

use crate::codec::Protocol;
use crate::types::{ClientId, TransportAddr, UDP_ID_BASE};

const PROBE_BOUND: usize = 128;
const MIN_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_seen: i64,
    addr: TransportAddr,
    id: ClientId,
    protocol: Protocol,
    active: bool,
}

impl Entry {
    const EMPTY: Entry =
        Entry { last_seen: 0, addr: TransportAddr::ZERO, id: 0, protocol: Protocol::Unknown, active: false };
}

pub struct UdpRegistry {
    slots: Box<[Entry]>,
    mask: usize,
    max_clients: usize,
    count: usize,
    next_id: ClientId,
}

impl UdpRegistry {
    /// `max_clients` is the configured `MAX_UDP_CLIENTS`; the backing table
    /// is sized to at least `2 * max_clients`, rounded up to a power of two,
    /// with a floor of 8192 slots per spec §3.
    pub fn new(max_clients: usize) -> Self {
        let capacity = (max_clients * 2).max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: vec![Entry::EMPTY; capacity].into_boxed_slice(),
            mask: capacity - 1,
            max_clients,
            count: 0,
            next_id: UDP_ID_BASE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.count
    }

    /// Look up `addr`, refreshing `last_seen`/`protocol` on a hit, or insert
    /// a new entry on a miss (evicting the LRU entry within the probe chain
    /// first if the table or the `max_clients` budget is exhausted).
    pub fn lookup_or_insert(&mut self, addr: TransportAddr, protocol: Protocol, now: i64) -> ClientId {
        let home = (addr.fnv_hash() as usize) & self.mask;
        let mut first_empty: Option<usize> = None;
        let mut lru: Option<usize> = None;

        for step in 0..PROBE_BOUND {
            let idx = (home + step) & self.mask;
            let entry = self.slots[idx];
            if entry.active && entry.addr == addr {
                self.slots[idx].last_seen = now;
                self.slots[idx].protocol = protocol;
                return entry.id;
            }
            if !entry.active && first_empty.is_none() {
                first_empty = Some(idx);
            }
            // `Option::is_none_or` needs 1.82; this crate's MSRV is 1.81.
            #[allow(clippy::unnecessary_map_or)]
            if entry.active && lru.map_or(true, |l| entry.last_seen < self.slots[l].last_seen) {
                lru = Some(idx);
            }
        }

        let target = if self.count < self.max_clients {
            // Under budget: prefer a genuinely empty slot in the probe chain.
            if let Some(idx) = first_empty {
                idx
            } else if let Some(idx) = lru {
                self.count -= 1;
                idx
            } else {
                self.evict_oldest_global()
            }
        } else {
            // At budget: an insert must evict an active entry, even if the
            // probe chain happens to contain an empty slot — taking the
            // empty slot here would silently exceed `max_clients`.
            if let Some(idx) = lru {
                self.count -= 1;
                idx
            } else {
                self.evict_oldest_global()
            }
        };

        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).filter(|&n| n != 0).unwrap_or(UDP_ID_BASE);
        self.slots[target] = Entry { last_seen: now, addr, id, protocol, active: true };
        self.count += 1;
        id
    }

    fn evict_oldest_global(&mut self) -> usize {
        let mut oldest = 0usize;
        let mut oldest_seen = i64::MAX;
        for (i, e) in self.slots.iter().enumerate() {
            if e.active && e.last_seen < oldest_seen {
                oldest_seen = e.last_seen;
                oldest = i;
            }
        }
        self.count -= 1;
        oldest
    }

    pub fn addr_of(&self, id: ClientId) -> Option<TransportAddr> {
        self.slots.iter().find(|e| e.active && e.id == id).map(|e| e.addr)
    }

    /// Resolve a client id back to its reply address and the protocol its
    /// last datagram was detected as — used by the output router to echo a
    /// reply in the same wire format the client has been sending (spec
    /// §4.8's `UdpClientEntry.protocol` field exists for exactly this).
    pub fn reply_target(&self, id: ClientId) -> Option<(TransportAddr, Protocol)> {
        self.slots.iter().find(|e| e.active && e.id == id).map(|e| (e.addr, e.protocol))
    }

    /// Evict every active entry whose `last_seen` is older than
    /// `timeout_secs` relative to `now`. Returns the number evicted.
    pub fn evict_inactive(&mut self, timeout_secs: i64, now: i64) -> usize {
        let mut evicted = 0;
        for e in self.slots.iter_mut() {
            if e.active && now - e.last_seen > timeout_secs {
                *e = Entry::EMPTY;
                evicted += 1;
            }
        }
        self.count -= evicted;
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> TransportAddr {
        TransportAddr::new(std::net::Ipv4Addr::new(10, 0, 0, n), 9000)
    }

    #[test]
    fn repeated_lookup_is_idempotent() {
        let mut reg = UdpRegistry::new(16);
        let id1 = reg.lookup_or_insert(addr(1), Protocol::Csv, 100);
        let id2 = reg.lookup_or_insert(addr(1), Protocol::Csv, 105);
        assert_eq!(id1, id2);
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn distinct_addresses_get_distinct_ids() {
        let mut reg = UdpRegistry::new(16);
        let id1 = reg.lookup_or_insert(addr(1), Protocol::Csv, 1);
        let id2 = reg.lookup_or_insert(addr(2), Protocol::Csv, 1);
        assert_ne!(id1, id2);
        assert!(id1 >= UDP_ID_BASE);
        assert!(id2 >= UDP_ID_BASE);
    }

    #[test]
    fn eviction_on_full_drops_the_oldest_and_does_not_reuse_its_id() {
        let mut reg = UdpRegistry::new(4);
        let mut ids = Vec::new();
        for i in 0..4u8 {
            ids.push(reg.lookup_or_insert(addr(i), Protocol::Csv, i as i64));
        }
        assert_eq!(reg.active_count(), 4);
        // A 5th distinct source arrives; the oldest (addr 0, last_seen 0) must be evicted.
        let new_id = reg.lookup_or_insert(addr(5), Protocol::Csv, 10);
        assert_eq!(reg.active_count(), 4);
        assert!(reg.addr_of(ids[0]).is_none());
        assert_ne!(new_id, ids[0]);
    }

    #[test]
    fn evict_inactive_removes_stale_entries_only() {
        let mut reg = UdpRegistry::new(16);
        let fresh = reg.lookup_or_insert(addr(1), Protocol::Csv, 1000);
        let stale = reg.lookup_or_insert(addr(2), Protocol::Csv, 0);
        let evicted = reg.evict_inactive(300, 1000);
        assert_eq!(evicted, 1);
        assert!(reg.addr_of(fresh).is_some());
        assert!(reg.addr_of(stale).is_none());
    }

    #[test]
    fn addr_of_returns_none_for_unknown_id() {
        let reg = UdpRegistry::new(16);
        assert_eq!(reg.addr_of(UDP_ID_BASE), None);
    }
}
