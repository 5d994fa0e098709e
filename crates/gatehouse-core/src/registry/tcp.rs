//! TCP client registry: a fixed-size array of slots indexed by `id - 1`.
//!
//! Per spec §4.8, a registry-level mutex guards only `active` and the slot
//! count; the per-slot output queue itself is lock-free. We model that here
//! by storing a short-lived, cheaply-cloneable handle (`T`, typically a
//! small struct wrapping an `Arc`-backed output queue producer) behind each
//! slot's mutex: callers clone the handle out under the lock, then drive it
//! without holding the lock (the "re-check-at-point-of-use" discipline —
//! [`TcpRegistry::get`] is the re-check).

use std::sync::Mutex;

use crate::types::{ClientId, TransportAddr};

struct Slot<T> {
    active: bool,
    addr: TransportAddr,
    payload: Option<T>,
}

/// Fixed-capacity TCP client registry. `T` is the per-connection handle
/// (output queue producer, socket fd, whatever the caller's listener needs
/// to reach a slot without re-taking this registry's lock).
pub struct TcpRegistry<T> {
    slots: Box<[Mutex<Slot<T>>]>,
}

impl<T: Clone> TcpRegistry<T> {
    /// `capacity` is `MAX_TCP_CLIENTS`; ids handed out are `1..=capacity`.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Mutex::new(Slot { active: false, addr: TransportAddr::ZERO, payload: None }))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first free slot for a newly accepted connection. Returns
    /// `None` if every slot is occupied.
    pub fn add(&self, addr: TransportAddr, payload: T) -> Option<ClientId> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut s = slot.lock().unwrap();
            if !s.active {
                s.active = true;
                s.addr = addr;
                s.payload = Some(payload);
                return Some((i + 1) as ClientId);
            }
        }
        None
    }

    /// Mark `id`'s slot free. A no-op for an out-of-range or already-inactive id.
    pub fn remove(&self, id: ClientId) -> bool {
        let Some(slot) = self.slot_at(id) else { return false };
        let mut s = slot.lock().unwrap();
        if !s.active {
            return false;
        }
        s.active = false;
        s.addr = TransportAddr::ZERO;
        s.payload = None;
        true
    }

    pub fn is_active(&self, id: ClientId) -> bool {
        self.slot_at(id).map(|s| s.lock().unwrap().active).unwrap_or(false)
    }

    pub fn addr_of(&self, id: ClientId) -> Option<TransportAddr> {
        let s = self.slot_at(id)?.lock().unwrap();
        s.active.then_some(s.addr)
    }

    /// Clone out the slot's handle if it is currently active, or `None` if
    /// the slot is empty, inactive, or out of range. This is the registry's
    /// single read path — every caller re-checks activity here before using
    /// the returned handle, rather than caching it across iterations.
    pub fn get(&self, id: ClientId) -> Option<T> {
        let s = self.slot_at(id)?.lock().unwrap();
        if s.active {
            s.payload.clone()
        } else {
            None
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.lock().unwrap().active).count()
    }

    /// Disconnect every active client (used on shutdown).
    pub fn disconnect_all(&self) {
        for slot in self.slots.iter() {
            let mut s = slot.lock().unwrap();
            s.active = false;
            s.addr = TransportAddr::ZERO;
            s.payload = None;
        }
    }

    fn slot_at(&self, id: ClientId) -> Option<&Mutex<Slot<T>>> {
        if id == 0 {
            return None;
        }
        self.slots.get((id - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> TransportAddr {
        TransportAddr::new(std::net::Ipv4Addr::new(127, 0, 0, 1), port)
    }

    #[test]
    fn add_assigns_sequential_ids_from_first_free_slot() {
        let reg: TcpRegistry<u32> = TcpRegistry::new(4);
        assert_eq!(reg.add(addr(1), 100), Some(1));
        assert_eq!(reg.add(addr(2), 200), Some(2));
        assert_eq!(reg.active_count(), 2);
    }

    #[test]
    fn remove_frees_the_slot_for_reuse() {
        let reg: TcpRegistry<u32> = TcpRegistry::new(2);
        let id = reg.add(addr(1), 100).unwrap();
        assert!(reg.remove(id));
        assert!(!reg.is_active(id));
        assert_eq!(reg.add(addr(2), 200), Some(id));
    }

    #[test]
    fn add_fails_when_full() {
        let reg: TcpRegistry<u32> = TcpRegistry::new(1);
        assert_eq!(reg.add(addr(1), 1), Some(1));
        assert_eq!(reg.add(addr(2), 2), None);
    }

    #[test]
    fn get_returns_none_for_inactive_or_out_of_range() {
        let reg: TcpRegistry<u32> = TcpRegistry::new(2);
        assert_eq!(reg.get(1), None);
        assert_eq!(reg.get(99), None);
        let id = reg.add(addr(1), 42).unwrap();
        assert_eq!(reg.get(id), Some(42));
        reg.remove(id);
        assert_eq!(reg.get(id), None);
    }

    #[test]
    fn disconnect_all_clears_every_slot() {
        let reg: TcpRegistry<u32> = TcpRegistry::new(4);
        reg.add(addr(1), 1).unwrap();
        reg.add(addr(2), 2).unwrap();
        reg.disconnect_all();
        assert_eq!(reg.active_count(), 0);
    }
}
