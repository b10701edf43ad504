//! Sessions: local endpoints bound to a NAME and/or address.
//!
//! Binding a session marks its NAME and address as local for as long as the
//! session lives, which is what lets the receive path flag loopback traffic
//! and the transmit path accept the session's source address.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::identity::{Address, Name, Pgn, Priority};
use super::interface::{InterfaceEvent, InterfaceListener, InterfaceState, ListenerId, NetDevice};
use super::metadata::{PacketMeta, SessionId};
use crate::error::{J1939Error, Result};

pub struct Session {
    id: SessionId,
    iface: InterfaceState,
    name: Option<Name>,
    addr: Address,
    listener: Mutex<Option<ListenerId>>,
    pending: AtomicUsize,
    removals: AtomicUsize,
    closed: AtomicBool,
    last_error: Mutex<Option<J1939Error>>,
    lost_to: Mutex<Option<Name>>,
}

impl Session {
    /// Binds a session on `iface`. At least one of `name` or a unicast
    /// `addr` must be given.
    pub fn bind(
        iface: &InterfaceState,
        id: SessionId,
        name: Option<Name>,
        addr: Address,
    ) -> Result<Arc<Self>> {
        if name.is_none() && !addr.is_unicast() {
            return Err(J1939Error::InvalidParameter);
        }
        iface.local_ecu_get(name, addr)?;

        let session = Arc::new(Session {
            id,
            iface: iface.clone(),
            name,
            addr,
            listener: Mutex::new(None),
            pending: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            lost_to: Mutex::new(None),
        });

        // on failure, dropping the session releases what local_ecu_get pinned
        let listener = iface.listen(session.clone())?;
        *session.listener.lock() = Some(listener);
        debug!(session = id.raw(), name = ?name, address = %addr, "session bound");
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> Option<Name> {
        self.name
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn interface(&self) -> &InterfaceState {
        &self.iface
    }

    /// Packets handed to the stack and not yet released.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// How many times the interface removal reached this session.
    pub fn removal_notifications(&self) -> usize {
        self.removals.load(Ordering::Acquire)
    }

    pub fn is_removed(&self) -> bool {
        self.removal_notifications() > 0
    }

    pub fn last_error(&self) -> Option<J1939Error> {
        self.last_error.lock().clone()
    }

    /// NAME that took this session's address away, if it happened.
    pub fn lost_to(&self) -> Option<Name> {
        *self.lost_to.lock()
    }

    /// Builds and resolves the metadata of an outbound packet and counts it
    /// as pending.
    pub fn prepare_tx(
        &self,
        pgn: Pgn,
        priority: Priority,
        dst_name: Option<Name>,
        da: Address,
    ) -> Result<PacketMeta> {
        if self.closed.load(Ordering::Acquire) || self.is_removed() {
            return Err(J1939Error::InterfaceDown);
        }
        let mut meta = PacketMeta::new(pgn, self.addr, da);
        meta.priority = priority;
        meta.insock = Some(self.id);
        meta.set_src_name(self.name);
        meta.set_dst_name(dst_name);
        self.iface.resolve_tx(&mut meta)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(meta)
    }

    /// Releases one pending packet.
    pub fn pending_del(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Unbinds the session. Idempotent; dropping the session closes it too.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().take() {
            self.iface.unlisten(listener);
        }
        if self.is_removed() {
            return Ok(());
        }
        self.iface.local_ecu_put(self.name, self.addr)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl InterfaceListener for Session {
    fn on_interface_event(&self, device: &NetDevice, event: &InterfaceEvent) {
        match event {
            InterfaceEvent::Removed => {
                self.removals.fetch_add(1, Ordering::AcqRel);
                self.pending.store(0, Ordering::Release);
                *self.last_error.lock() = Some(J1939Error::InterfaceDown);
                debug!(session = self.id.raw(), ifindex = device.ifindex, "interface removed");
            }
            InterfaceEvent::Error(err) => {
                self.pending.store(0, Ordering::Release);
                *self.last_error.lock() = Some(err.clone());
            }
            InterfaceEvent::AddressLost {
                name,
                winner: Some(winner),
                ..
            } if Some(*name) == self.name => {
                *self.lost_to.lock() = Some(*winner);
            }
            InterfaceEvent::AddressClaimed { name, .. } if Some(*name) == self.name => {
                *self.lost_to.lock() = None;
            }
            _ => {}
        }
    }
}
