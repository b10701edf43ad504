//! ECU records and the shared handle handed out by lookups.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use super::identity::{Address, Name};
use super::interface::{InterfaceState, Shared};
use super::timer::ClaimTimer;
use crate::types::Timestamp;

/// Address-claim state of an [`Ecu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EcuState {
    /// Known, never held an address.
    Unclaimed = 0,
    /// Holds an address tentatively, claim timer running.
    Claiming = 1,
    /// Holds its address.
    Claimed = 2,
    /// Lost its address to a smaller NAME or gave it up.
    Idle = 3,
    /// Removed from its interface; only outstanding handles keep it alive.
    Unregistered = 4,
}

impl EcuState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => EcuState::Unclaimed,
            1 => EcuState::Claiming,
            2 => EcuState::Claimed,
            3 => EcuState::Idle,
            _ => EcuState::Unregistered,
        }
    }

    /// States in which a claim may be (re)started.
    pub fn can_claim(self) -> bool {
        !matches!(self, EcuState::Unregistered)
    }
}

/// One node on the bus, local or remote.
///
/// `address` and `state` are only written under the interface write lock but
/// can be read from anywhere without it.
pub struct Ecu {
    name: Name,
    address: AtomicU8,
    state: AtomicU8,
    // local sessions bound to this NAME
    nusers: AtomicUsize,
    pub(crate) timer: ClaimTimer,
    iface: Weak<Shared>,
}

impl Ecu {
    pub(crate) fn new(name: Name, iface: Weak<Shared>) -> Self {
        Self {
            name,
            address: AtomicU8::new(Address::IDLE.raw()),
            state: AtomicU8::new(EcuState::Unclaimed as u8),
            nusers: AtomicUsize::new(0),
            timer: ClaimTimer::new(),
            iface,
        }
    }

    pub fn name(&self) -> Name {
        self.name
    }

    /// Current address, [`Address::IDLE`] when none is held.
    pub fn address(&self) -> Address {
        Address(self.address.load(Ordering::Acquire))
    }

    pub fn state(&self) -> EcuState {
        EcuState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Number of local users (bound sessions) of this NAME.
    pub fn users(&self) -> usize {
        self.nusers.load(Ordering::Acquire)
    }

    /// An ECU with local users is owned by this host.
    pub fn is_local(&self) -> bool {
        self.users() > 0
    }

    pub fn claim_deadline(&self) -> Option<Timestamp> {
        self.timer.deadline()
    }

    /// The interface this record belongs to, if it is still around.
    pub fn interface(&self) -> Option<InterfaceState> {
        self.iface.upgrade().map(InterfaceState::from_shared)
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.iface.as_ptr(), Arc::as_ptr(shared))
    }

    pub(crate) fn set_address(&self, address: Address) {
        self.address.store(address.raw(), Ordering::Release);
    }

    pub(crate) fn set_state(&self, state: EcuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn add_user(&self) {
        self.nusers.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns false if there was no user to drop.
    pub(crate) fn remove_user(&self) -> bool {
        self.nusers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl fmt::Debug for Ecu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ecu")
            .field("name", &self.name)
            .field("address", &self.address())
            .field("state", &self.state())
            .field("nusers", &self.users())
            .finish()
    }
}

impl Drop for Ecu {
    fn drop(&mut self) {
        trace!(name = %self.name, "ecu released");
    }
}

/// Counted handle to an [`Ecu`]. Cloning takes a reference, dropping releases it.
#[derive(Clone)]
pub struct EcuRef(Arc<Ecu>);

impl EcuRef {
    pub(crate) fn new(ecu: Ecu) -> Self {
        EcuRef(Arc::new(ecu))
    }

    pub(crate) fn upgrade(weak: &Weak<Ecu>) -> Option<Self> {
        weak.upgrade().map(EcuRef)
    }

    pub(crate) fn downgrade(&self) -> Weak<Ecu> {
        Arc::downgrade(&self.0)
    }

    /// Number of live handles, the registry's own included.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// True if both handles point at the same record.
    pub fn same(&self, other: &Ecu) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0), other)
    }
}

impl Deref for EcuRef {
    type Target = Ecu;

    fn deref(&self) -> &Ecu {
        &self.0
    }
}

impl fmt::Debug for EcuRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
