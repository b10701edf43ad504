//! SAE J1939 network management.
//!
//! Each CAN interface running J1939 gets an [`InterfaceState`]: a 256-slot
//! [`AddressCache`] and an [`EcuRegistry`] behind one non-blocking lock.
//! [`J1939`] sits on top of a [`PhysicalLayer`], turning frames into
//! [`Packet`]s with resolved [`PacketMeta`] and sending address claims.

mod address_claim;
mod cache;
mod ecu;
mod identity;
mod interface;
mod metadata;
mod registry;
mod session;
mod stack;
mod timer;


use std::time::Instant;

use tracing::{debug, warn};

pub use address_claim::ClaimResult;
pub use cache::AddressCache;
pub use ecu::{Ecu, EcuRef, EcuState};
pub use identity::{Address, Name, Pgn, Priority};
pub use interface::{
    InterfaceConfig, InterfaceEvent, InterfaceListener, InterfaceState, ListenerId, NetDevice,
    DEFAULT_CLAIM_TIMEOUT_MS, DEFAULT_MAX_ECUS,
};
pub use metadata::{
    EcuFlags, J1939Addr, MsgFlags, Packet, PacketMeta, SessionId, TpFlags, CONTROL_BUFFER_SIZE,
};
pub use registry::{resolve_conflict, Arbitration, EcuRegistry};
pub use session::Session;
pub use stack::J1939Stack;
pub use timer::{ClaimTimer, FireToken};

use super::NetworkLayer;
use crate::error::{J1939Error, Result};
use crate::physical::PhysicalLayer;
use crate::types::{Frame, Timestamp};

/// Builds the 29-bit identifier and frame for a packet.
pub fn build_frame(meta: &PacketMeta, data: &[u8]) -> Frame {
    let mut pgn = meta.addr.pgn.group().raw();
    if meta.addr.pgn.is_pdu1() {
        pgn |= meta.addr.da.raw() as u32;
    }
    let id = ((meta.priority.raw() as u32) << 26) | (pgn << 8) | (meta.addr.sa.raw() as u32);

    Frame {
        id,
        data: data.to_vec(),
        timestamp: 0,
        is_extended: true,
        is_fd: false,
    }
}

/// Extracts the addressing metadata carried in a frame's identifier.
pub fn parse_frame(frame: &Frame) -> Result<PacketMeta> {
    if !frame.is_extended {
        return Err(J1939Error::InvalidParameter);
    }

    let priority = Priority::new(((frame.id >> 26) & 0x7) as u8)?;
    let raw = Pgn::masked(frame.id >> 8);
    let sa = Address((frame.id & 0xFF) as u8);
    let da = if raw.is_pdu1() {
        Address((raw.raw() & 0xFF) as u8)
    } else {
        Address::NO_ADDR
    };

    let mut meta = PacketMeta::new(raw.group(), sa, da);
    meta.priority = priority;
    Ok(meta)
}

/// J1939 network layer over a physical CAN interface.
pub struct J1939<P: PhysicalLayer> {
    iface: InterfaceState,
    physical: P,
    is_open: bool,
    epoch: Instant,
}

impl<P: PhysicalLayer> J1939<P> {
    /// Creates a new J1939 instance with the given physical layer
    pub fn with_physical(iface: InterfaceState, physical: P) -> Self {
        Self {
            iface,
            physical,
            is_open: false,
            epoch: Instant::now(),
        }
    }

    pub fn interface(&self) -> &InterfaceState {
        &self.iface
    }

    pub fn physical(&self) -> &P {
        &self.physical
    }

    pub fn physical_mut(&mut self) -> &mut P {
        &mut self.physical
    }

    /// Milliseconds since this layer was created.
    pub fn now(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }

    /// Completes expired claims using the layer's own clock.
    pub fn poll(&mut self) -> usize {
        let now = self.now();
        self.poll_at(now)
    }

    pub fn poll_at(&mut self, now: Timestamp) -> usize {
        self.iface.poll_timers(now)
    }

    /// Claims `address` for `name` and announces the outcome on the bus.
    pub fn claim_address_at(
        &mut self,
        name: Name,
        address: Address,
        now: Timestamp,
    ) -> Result<ClaimResult> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }

        let result = self.iface.claim(name, address, now)?;
        let sent = match result {
            ClaimResult::Claiming { .. } | ClaimResult::AlreadyClaimed => {
                self.send_address_claim(name, address)
            }
            ClaimResult::Lost { .. } => {
                // cannot claim
                self.send_address_claim(name, Address::IDLE)
            }
        };

        if let Err(err) = sent {
            // a claim that never reached the bus must not mature
            if matches!(result, ClaimResult::Claiming { .. }) {
                if let Ok(ecu) = self.iface.find_by_name(name) {
                    let _ = self.iface.release_address(&ecu);
                }
            }
            warn!(name = %name, address = %address, error = %err, "address claim not sent");
            return Err(err);
        }
        Ok(result)
    }

    fn send_address_claim(&mut self, name: Name, source: Address) -> Result<()> {
        let mut meta = PacketMeta::new(Pgn::ADDRESS_CLAIMED, source, Address::NO_ADDR);
        meta.priority = Priority::DEFAULT;
        meta.set_src_name(Some(name));

        let frame = build_frame(&meta, &name.to_le_bytes());
        self.physical.send_frame(&frame)
    }
}

impl<P: PhysicalLayer> NetworkLayer for J1939<P> {
    type Message = Packet;

    fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }

        self.physical.open()?;
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }

        self.physical.close()?;
        self.is_open = false;
        Ok(())
    }

    fn send(&mut self, mut meta: PacketMeta, data: &[u8]) -> Result<()> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }

        self.iface.resolve_tx(&mut meta)?;
        let frame = build_frame(&meta, data);
        self.physical.send_frame(&frame)
    }

    fn receive(&mut self) -> Result<Self::Message> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }

        let frame = self.physical.receive_frame()?;
        let mut meta = parse_frame(&frame)?;

        if meta.addr.pgn == Pgn::ADDRESS_CLAIMED {
            let now = self.now();
            let echo = <[u8; 8]>::try_from(frame.data.as_slice())
                .map(|bytes| self.iface.is_own_claim(Name::from_le_bytes(bytes), meta.addr.sa))
                .unwrap_or(false);
            let processed = if echo {
                debug!(source = %meta.addr.sa, "own address claim echoed");
                Ok(None)
            } else {
                self.iface.ac_recv(&meta, &frame.data, now)
            };
            match processed {
                Ok(_) => {}
                Err(err @ J1939Error::DuplicateName(_)) => {
                    warn!(source = %meta.addr.sa, error = %err, "address claim rejected");
                    self.iface.notify_error(err);
                }
                Err(err) => debug!(source = %meta.addr.sa, error = %err, "address claim dropped"),
            }
        }

        self.iface.resolve_rx(&mut meta)?;
        Ok(Packet {
            meta,
            data: frame.data,
            timestamp: frame.timestamp,
        })
    }

    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }

        self.physical.set_timeout(timeout_ms)
    }

    fn claim_address(&mut self, name: Name, address: Address) -> Result<ClaimResult> {
        let now = self.now();
        self.claim_address_at(name, address, now)
    }

    fn get_address(&self, name: Name) -> Result<Address> {
        let address = self.iface.name_to_addr(name);
        if address.is_unicast() {
            Ok(address)
        } else {
            Err(J1939Error::NotFound)
        }
    }
}
