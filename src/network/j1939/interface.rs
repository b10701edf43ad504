//! Per-interface network management state.
//!
//! One [`InterfaceState`] exists per CAN interface that is up. It owns the
//! address cache and the ECU registry behind a single spinning reader/writer
//! lock: acquiring it never yields or sleeps, so readers on the frame path can
//! take it from any context. Writers hold it only for pointer and counter
//! updates. Record allocation happens before the lock is taken, and records
//! are released and events logged only after it is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::cache::AddressCache;
use super::ecu::{Ecu, EcuRef, EcuState};
use super::identity::{Address, Name};
use super::registry::EcuRegistry;
use crate::error::{J1939Error, Result};
use crate::types::Config;

/// Default time an uncontested claim needs before it is considered held.
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 250;

/// Default number of ECU records an interface can track.
pub const DEFAULT_MAX_ECUS: usize = 256;

/// Per-interface configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub claim_timeout_ms: u64,
    pub max_ecus: usize,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            max_ecus: DEFAULT_MAX_ECUS,
        }
    }
}

impl Config for InterfaceConfig {
    fn validate(&self) -> Result<()> {
        if self.claim_timeout_ms == 0 {
            return Err(J1939Error::InvalidParameter);
        }
        if self.max_ecus == 0 {
            return Err(J1939Error::InvalidParameter);
        }
        Ok(())
    }
}

/// The network device an interface state is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetDevice {
    pub ifindex: u32,
    pub name: String,
}

impl NetDevice {
    pub fn new(ifindex: u32, name: impl Into<String>) -> Self {
        Self {
            ifindex,
            name: name.into(),
        }
    }
}

/// Notifications delivered to [`InterfaceListener`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceEvent {
    /// A claim went uncontested for the claim timeout.
    AddressClaimed { name: Name, address: Address },
    /// `name` lost or gave up `address`. `winner` is set when it lost to
    /// another claim.
    AddressLost {
        name: Name,
        address: Address,
        winner: Option<Name>,
    },
    /// The interface reported an error but stays up.
    Error(J1939Error),
    /// The interface is gone. Delivered exactly once, after which the
    /// listener is dropped.
    Removed,
}

/// Consumers of interface events, typically bound sessions.
pub trait InterfaceListener: Send + Sync {
    fn on_interface_event(&self, device: &NetDevice, event: &InterfaceEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub(crate) struct Tables {
    pub(crate) cache: AddressCache,
    pub(crate) registry: EcuRegistry,
}

impl Tables {
    /// Address held by `name`, [`Address::NO_ADDR`] if it holds none.
    pub(crate) fn address_of(&self, name: Name) -> Address {
        match self.registry.find(name) {
            Some(ecu) if self.cache.is_bound_to(ecu.address(), ecu) => ecu.address(),
            _ => Address::NO_ADDR,
        }
    }

    /// Gives up whatever address `ecu` holds and stops its claim.
    /// Returns the address it held.
    pub(crate) fn relinquish(&mut self, ecu: &Ecu) -> Option<Address> {
        ecu.timer.cancel();
        let old = ecu.address();
        let held = old.is_unicast() && self.cache.unbind(old, ecu).is_ok();
        if matches!(ecu.state(), EcuState::Claiming | EcuState::Claimed) {
            ecu.set_state(EcuState::Idle);
        }
        held.then_some(old)
    }

    /// Removes `ecu` from cache and registry. The registry's reference is
    /// returned so it can be released outside the lock.
    pub(crate) fn unregister(&mut self, ecu: &Ecu) -> Option<EcuRef> {
        ecu.timer.cancel();
        let addr = ecu.address();
        if addr.is_unicast() {
            let _ = self.cache.unbind(addr, ecu);
        }
        ecu.set_address(Address::IDLE);
        ecu.set_state(EcuState::Unregistered);
        self.registry.remove(ecu)
    }
}

pub(crate) struct Shared {
    device: NetDevice,
    config: InterfaceConfig,
    tables: RwLock<Tables>,
    alive: AtomicBool,
    listeners: Mutex<Vec<(ListenerId, Weak<dyn InterfaceListener>)>>,
    next_listener: AtomicU64,
}

impl Drop for Shared {
    fn drop(&mut self) {
        debug!(ifindex = self.device.ifindex, "interface state released");
    }
}

/// Counted handle to the network management state of one interface.
#[derive(Clone)]
pub struct InterfaceState(Arc<Shared>);

impl InterfaceState {
    pub fn new(device: NetDevice, config: InterfaceConfig) -> Result<Self> {
        config.validate()?;
        let tables = Tables {
            cache: AddressCache::new(),
            registry: EcuRegistry::with_capacity(config.max_ecus),
        };
        Ok(InterfaceState(Arc::new(Shared {
            device,
            config,
            tables: RwLock::new(tables),
            alive: AtomicBool::new(true),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        })))
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        InterfaceState(shared)
    }

    pub fn device(&self) -> &NetDevice {
        &self.0.device
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.0.config
    }

    pub fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::Acquire)
    }

    /// Number of live handles to this interface state.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.0.tables.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.0.tables.write()
    }

    /// Write guard on a live interface.
    pub(crate) fn write_live(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        let tables = self.0.tables.write();
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        Ok(tables)
    }

    fn allocate(&self, name: Name) -> EcuRef {
        EcuRef::new(Ecu::new(name, Arc::downgrade(&self.0)))
    }

    fn owns(&self, ecu: &Ecu) -> Result<()> {
        if ecu.belongs_to(&self.0) {
            Ok(())
        } else {
            Err(J1939Error::NotFound)
        }
    }

    /// Runs `f` under the write lock on the record for `name`, registering a
    /// new record first if the NAME is unknown.
    ///
    /// If `f` fails, a record registered by this call is removed again.
    pub(crate) fn with_record<T>(
        &self,
        name: Name,
        f: impl FnOnce(&mut Tables, &EcuRef) -> Result<T>,
    ) -> Result<T> {
        let mut fresh = None;
        loop {
            let mut tables = self.write_live()?;
            let existing = tables.registry.find(name).cloned();
            let (ecu, inserted) = match existing {
                Some(ecu) => (ecu, false),
                None => match fresh.take() {
                    Some(ecu) => {
                        if let Err(err) = tables.registry.insert(EcuRef::clone(&ecu)) {
                            drop(tables);
                            return Err(err);
                        }
                        (ecu, true)
                    }
                    None => {
                        drop(tables);
                        fresh = Some(self.allocate(name));
                        continue;
                    }
                },
            };

            let result = f(&mut *tables, &ecu);
            let rollback = match (&result, inserted) {
                (Err(_), true) => tables.registry.remove(&ecu),
                _ => None,
            };
            drop(tables);
            drop(rollback);
            if inserted && result.is_ok() {
                debug!(ifindex = self.0.device.ifindex, name = %name, "ecu registered");
            }
            return result;
        }
    }

    /// The record bound at `addr`, with a reference taken. Never blocks.
    pub fn lookup_by_address(&self, addr: Address) -> Result<EcuRef> {
        if !self.is_alive() {
            return Err(J1939Error::NotFound);
        }
        self.read().cache.lookup(addr).ok_or(J1939Error::NotFound)
    }

    /// Binds `ecu` at `addr`. Any other record in the slot is displaced and
    /// becomes idle; the caller is expected to have arbitrated already.
    pub fn bind(&self, addr: Address, ecu: &EcuRef) -> Result<()> {
        let addr = addr.unicast()?;
        self.owns(ecu)?;
        let displaced = {
            let mut tables = self.write_live()?;
            if !tables.registry.contains(ecu) {
                return Err(J1939Error::NotFound);
            }
            let displaced = tables.cache.bind(addr, ecu)?;
            if let Some(prev) = &displaced {
                tables.relinquish(prev);
            }
            displaced
        };

        debug!(name = %ecu.name(), address = %addr, "address bound");
        if let Some(prev) = displaced {
            self.notify(&InterfaceEvent::AddressLost {
                name: prev.name(),
                address: addr,
                winner: None,
            });
        }
        Ok(())
    }

    /// Clears `addr` if it is still bound to `ecu`; a slot rebound in the
    /// meantime yields the benign [`J1939Error::StaleUnbind`].
    pub fn unbind(&self, addr: Address, ecu: &EcuRef) -> Result<()> {
        let addr = addr.unicast()?;
        self.owns(ecu)?;
        {
            let mut tables = self.write_live()?;
            tables.cache.unbind(addr, ecu)?;
            ecu.timer.cancel();
            if matches!(ecu.state(), EcuState::Claiming | EcuState::Claimed) {
                ecu.set_state(EcuState::Idle);
            }
        }
        debug!(name = %ecu.name(), address = %addr, "address unbound");
        Ok(())
    }

    /// Pins `addr` for a consumer. Returns the new slot user count.
    pub fn increment_user(&self, addr: Address) -> Result<usize> {
        let tables = self.read();
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        tables.cache.increment_user(addr)
    }

    /// Unpins `addr`. Reaching zero only means nobody is interested any more.
    pub fn decrement_user(&self, addr: Address) -> Result<usize> {
        let tables = self.read();
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        tables.cache.decrement_user(addr)
    }

    pub fn users(&self, addr: Address) -> usize {
        self.read().cache.users(addr)
    }

    pub fn find_by_name(&self, name: Name) -> Result<EcuRef> {
        if !self.is_alive() {
            return Err(J1939Error::NotFound);
        }
        self.read()
            .registry
            .find(name)
            .cloned()
            .ok_or(J1939Error::NotFound)
    }

    /// Registers `name` as an unclaimed record, or returns the existing one.
    pub fn create(&self, name: Name) -> Result<EcuRef> {
        if let Ok(ecu) = self.find_by_name(name) {
            return Ok(ecu);
        }
        self.with_record(name, |_, ecu| Ok(ecu.clone()))
    }

    /// Cancels the claim of `ecu`, unbinds it and drops it from the registry.
    /// Outstanding handles keep the record itself alive.
    pub fn unregister(&self, ecu: &EcuRef) -> Result<()> {
        self.owns(ecu)?;
        let (removed, address) = {
            let mut tables = self.write_live()?;
            let address = ecu.address();
            let removed = tables.unregister(ecu).ok_or(J1939Error::NotFound)?;
            (removed, address)
        };
        drop(removed);

        debug!(name = %ecu.name(), "ecu unregistered");
        if address.is_unicast() {
            self.notify(&InterfaceEvent::AddressLost {
                name: ecu.name(),
                address,
                winner: None,
            });
        }
        Ok(())
    }

    /// Snapshot of every known record in registration order.
    pub fn ecus(&self) -> Vec<EcuRef> {
        let mut out = Vec::with_capacity(self.0.config.max_ecus);
        let tables = self.read();
        out.extend(tables.registry.iter().cloned());
        drop(tables);
        out
    }

    /// True if `name` is a local ECU or `addr` is a locally used address.
    pub fn is_local(&self, name: Option<Name>, addr: Address) -> bool {
        let tables = self.read();
        let local_name = name
            .and_then(|name| tables.registry.find(name))
            .map_or(false, |ecu| ecu.is_local());
        local_name || tables.cache.users(addr) > 0
    }

    /// The address `name` currently holds, [`Address::NO_ADDR`] if none.
    pub fn name_to_addr(&self, name: Name) -> Address {
        self.read().address_of(name)
    }

    /// Marks `name` and/or `sa` as owned by this host.
    pub fn local_ecu_get(&self, name: Option<Name>, sa: Address) -> Result<()> {
        let Some(name) = name else {
            let tables = self.write_live()?;
            if sa.is_unicast() {
                tables.cache.increment_user(sa)?;
            }
            return Ok(());
        };

        self.with_record(name, |tables, ecu| {
            if sa.is_unicast() {
                tables.cache.increment_user(sa)?;
            }
            ecu.add_user();
            let addr = ecu.address();
            if tables.cache.is_bound_to(addr, ecu) {
                tables.cache.increment_user(addr)?;
            }
            Ok(())
        })
    }

    /// Undoes a [`local_ecu_get`](Self::local_ecu_get).
    /// Fails without touching any count if `name` has no local user.
    pub fn local_ecu_put(&self, name: Option<Name>, sa: Address) -> Result<()> {
        let tables = self.write_live()?;
        if let Some(name) = name {
            let ecu = tables.registry.find(name).ok_or(J1939Error::NotFound)?;
            if !ecu.remove_user() {
                return Err(J1939Error::NotFound);
            }
            let addr = ecu.address();
            if tables.cache.is_bound_to(addr, ecu) {
                let _ = tables.cache.decrement_user(addr);
            }
        }
        if sa.is_unicast() {
            let _ = tables.cache.decrement_user(sa);
        }
        Ok(())
    }

    /// Registers a listener for interface events. Only a weak reference is
    /// kept: a listener that is dropped simply stops receiving events.
    pub fn listen(&self, listener: Arc<dyn InterfaceListener>) -> Result<ListenerId> {
        let mut listeners = self.0.listeners.lock();
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        let id = ListenerId(self.0.next_listener.fetch_add(1, Ordering::Relaxed));
        listeners.push((id, Arc::downgrade(&listener)));
        Ok(id)
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        let mut listeners = self.0.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(known, _)| *known != id);
        listeners.len() != before
    }

    pub(crate) fn notify(&self, event: &InterfaceEvent) {
        let listeners = self.live_listeners();
        for listener in listeners {
            listener.on_interface_event(&self.0.device, event);
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn InterfaceListener>> {
        let mut listeners = self.0.listeners.lock();
        listeners.retain(|(_, listener)| listener.strong_count() > 0);
        listeners
            .iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect()
    }

    /// Reports an interface error to every listener without tearing down.
    pub fn notify_error(&self, error: J1939Error) {
        debug!(ifindex = self.0.device.ifindex, error = %error, "interface error");
        self.notify(&InterfaceEvent::Error(error));
    }

    /// Teardown barrier. Cancels every claim timer, clears the cache,
    /// unregisters every record and tells each listener exactly once that the
    /// interface is gone. Returns false if the interface was already down.
    pub(crate) fn teardown(&self) -> bool {
        if !self.0.alive.swap(false, Ordering::AcqRel) {
            return false;
        }

        let released = {
            let mut tables = self.0.tables.write();
            for ecu in tables.registry.iter() {
                ecu.timer.cancel();
                ecu.set_address(Address::IDLE);
                ecu.set_state(EcuState::Unregistered);
            }
            tables.cache.clear();
            tables.registry.drain_all()
        };
        let count = released.len();
        drop(released);

        let listeners: Vec<_> = std::mem::take(&mut *self.0.listeners.lock())
            .into_iter()
            .filter_map(|(_, listener)| listener.upgrade())
            .collect();
        for listener in &listeners {
            listener.on_interface_event(&self.0.device, &InterfaceEvent::Removed);
        }

        info!(
            ifindex = self.0.device.ifindex,
            device = %self.0.device.name,
            ecus = count,
            listeners = listeners.len(),
            "interface torn down"
        );
        true
    }
}

impl std::fmt::Debug for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceState")
            .field("device", &self.0.device)
            .field("alive", &self.is_alive())
            .finish()
    }
}
