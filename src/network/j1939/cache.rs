//! Per-interface table of 256 address slots.
//!
//! Every method runs under the interface lock and only touches pointers and
//! counters; nothing here allocates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use super::ecu::{Ecu, EcuRef};
use super::identity::Address;
use crate::error::{J1939Error, Result};

const SLOTS: usize = 256;

#[derive(Default)]
struct AddrEnt {
    ecu: Option<Weak<Ecu>>,
    // local sessions using this address
    nusers: AtomicUsize,
}

impl AddrEnt {
    fn holds(&self, ecu: &Ecu) -> bool {
        self.ecu
            .as_ref()
            .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), ecu))
    }
}

pub struct AddressCache {
    ents: [AddrEnt; SLOTS],
}

impl Default for AddressCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            ents: std::array::from_fn(|_| AddrEnt::default()),
        }
    }

    /// The record bound at `addr`, with its refcount taken. Empty for
    /// anything that is not a unicast address.
    pub fn lookup(&self, addr: Address) -> Option<EcuRef> {
        if !addr.is_unicast() {
            return None;
        }
        self.ents[addr.index()].ecu.as_ref().and_then(EcuRef::upgrade)
    }

    pub fn is_bound_to(&self, addr: Address, ecu: &Ecu) -> bool {
        addr.is_unicast() && self.ents[addr.index()].holds(ecu)
    }

    /// Binds `ecu` at `addr` and moves its address there.
    ///
    /// A record previously held elsewhere is unbound from its old slot first.
    /// A different record found in the slot is displaced and returned; its
    /// address becomes idle. No arbitration happens here.
    pub fn bind(&mut self, addr: Address, ecu: &EcuRef) -> Result<Option<EcuRef>> {
        let addr = addr.unicast()?;

        let old = ecu.address();
        if old != addr && old.is_unicast() {
            let _ = self.unbind(old, ecu);
        }
        if self.ents[addr.index()].holds(ecu) {
            return Ok(None);
        }

        let displaced = self.lookup(addr);
        if let Some(prev) = &displaced {
            let _ = self.unbind(addr, prev);
        }

        let ent = &mut self.ents[addr.index()];
        ent.ecu = Some(ecu.downgrade());
        ent.nusers.fetch_add(ecu.users(), Ordering::AcqRel);
        ecu.set_address(addr);
        Ok(displaced)
    }

    /// Clears `addr` if it still holds `ecu`.
    ///
    /// A slot that was rebound to another record in the meantime is left
    /// alone and [`J1939Error::StaleUnbind`] is returned.
    pub fn unbind(&mut self, addr: Address, ecu: &Ecu) -> Result<()> {
        let addr = addr.unicast()?;
        let ent = &mut self.ents[addr.index()];
        if !ent.holds(ecu) {
            return Err(J1939Error::StaleUnbind(addr));
        }

        ent.ecu = None;
        let users = ecu.users();
        let _ = ent
            .nusers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(users))
            });
        if ecu.address() == addr {
            ecu.set_address(Address::IDLE);
        }
        Ok(())
    }

    pub fn users(&self, addr: Address) -> usize {
        if !addr.is_unicast() {
            return 0;
        }
        self.ents[addr.index()].nusers.load(Ordering::Acquire)
    }

    /// Needs only shared access, the counter is atomic.
    pub fn increment_user(&self, addr: Address) -> Result<usize> {
        let addr = addr.unicast()?;
        Ok(self.ents[addr.index()].nusers.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Decrements the slot's user count. Reaching zero does not evict the
    /// bound record.
    pub fn decrement_user(&self, addr: Address) -> Result<usize> {
        let addr = addr.unicast()?;
        self.ents[addr.index()]
            .nusers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| J1939Error::NotFound)
    }

    /// Empties every slot and zeroes every count.
    pub fn clear(&mut self) {
        for ent in self.ents.iter_mut() {
            ent.ecu = None;
            ent.nusers.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn ecu(name: u64) -> EcuRef {
        EcuRef::new(Ecu::new(name.into(), Weak::new()))
    }

    #[test]
    fn bind_and_lookup() {
        let mut cache = AddressCache::new();
        let a = ecu(100);
        assert!(cache.bind(Address(42), &a).unwrap().is_none());
        assert_eq!(a.address(), Address(42));

        let found = cache.lookup(Address(42)).unwrap();
        assert!(found.same(&a));
        assert!(cache.lookup(Address::IDLE).is_none());
        assert!(cache.lookup(Address(43)).is_none());
    }

    #[test]
    fn bind_rejects_reserved_addresses() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        for raw in [253u8, 254, 255] {
            assert_eq!(
                cache.bind(Address(raw), &a).unwrap_err(),
                J1939Error::AddressOutOfRange(Address(raw))
            );
        }
        assert_eq!(a.address(), Address::IDLE);
    }

    #[test]
    fn rebinding_moves_record() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        cache.bind(Address(10), &a).unwrap();
        cache.bind(Address(11), &a).unwrap();
        assert!(cache.lookup(Address(10)).is_none());
        assert!(cache.is_bound_to(Address(11), &a));
    }

    #[test]
    fn bind_displaces_previous_holder() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        let b = ecu(2);
        cache.bind(Address(7), &a).unwrap();
        let displaced = cache.bind(Address(7), &b).unwrap().unwrap();
        assert!(displaced.same(&a));
        assert_eq!(a.address(), Address::IDLE);
        assert!(cache.is_bound_to(Address(7), &b));
    }

    #[test]
    fn stale_unbind_keeps_newer_binding() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        let b = ecu(2);
        cache.bind(Address(42), &a).unwrap();
        cache.unbind(Address(42), &a).unwrap();
        cache.bind(Address(42), &b).unwrap();

        let err = cache.unbind(Address(42), &a).unwrap_err();
        assert_eq!(err, J1939Error::StaleUnbind(Address(42)));
        assert!(err.is_benign());
        assert!(cache.is_bound_to(Address(42), &b));
    }

    #[test]
    fn slot_users_track_record_users() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        a.add_user();
        cache.bind(Address(3), &a).unwrap();
        assert_eq!(cache.users(Address(3)), 1);
        cache.unbind(Address(3), &a).unwrap();
        assert_eq!(cache.users(Address(3)), 0);
    }

    #[test]
    fn user_count_does_not_evict() {
        let mut cache = AddressCache::new();
        let a = ecu(1);
        cache.bind(Address(5), &a).unwrap();
        assert_eq!(cache.increment_user(Address(5)).unwrap(), 1);
        assert_eq!(cache.decrement_user(Address(5)).unwrap(), 0);
        assert!(cache.is_bound_to(Address(5), &a));
        assert_eq!(cache.decrement_user(Address(5)), Err(J1939Error::NotFound));
    }
}
