//! Per-packet addressing metadata.
//!
//! [`PacketMeta`] travels with every packet in a fixed-size side channel, so
//! its size is checked at compile time against [`CONTROL_BUFFER_SIZE`].

use std::mem::size_of;
use std::num::NonZeroU32;

use bitflags::bitflags;
use static_assertions::const_assert;

use super::identity::{Address, Name, Pgn, Priority};
use super::interface::InterfaceState;
use crate::error::{J1939Error, Result};
use crate::types::Timestamp;

/// Size of the per-packet side channel the metadata must fit into.
pub const CONTROL_BUFFER_SIZE: usize = 48;

bitflags! {
    /// Set on the receive path for quick lookups further up the stack.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EcuFlags: u8 {
        const LOCAL = 1 << 0;
        /// The NAME field holds a resolved NAME.
        const NAME = 1 << 1;
    }
}

bitflags! {
    /// Flags modifying the transport protocol.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TpFlags: u8 {
        /// Skip the inter-packet delay of broadcast transfers.
        const BAM_NODELAY = 1 << 0;
    }
}

bitflags! {
    /// Transmit-time flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u8 {
        /// Synchronise transmission with the originating session.
        const SYN = 1 << 0;
    }
}

/// Identifies the session a packet originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(NonZeroU32);

impl SessionId {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(SessionId)
    }

    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

/// Source and destination of a packet, by NAME and by address.
///
/// The NAME fields are only meaningful while [`EcuFlags::NAME`] is set on the
/// matching side; read them through [`PacketMeta::src_name`] and
/// [`PacketMeta::dst_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Addr {
    src_name: Name,
    dst_name: Name,
    pub pgn: Pgn,
    pub sa: Address,
    pub da: Address,
}

impl Default for J1939Addr {
    fn default() -> Self {
        Self {
            src_name: Name(0),
            dst_name: Name(0),
            pgn: Pgn::default(),
            sa: Address::NO_ADDR,
            da: Address::NO_ADDR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMeta {
    pub addr: J1939Addr,
    pub priority: Priority,
    pub src_flags: EcuFlags,
    pub dst_flags: EcuFlags,
    pub tp_flags: TpFlags,
    pub msg_flags: MsgFlags,
    /// Session that sent the packet, set for locally generated traffic.
    pub insock: Option<SessionId>,
}

const_assert!(size_of::<PacketMeta>() <= CONTROL_BUFFER_SIZE);

impl PacketMeta {
    pub fn new(pgn: Pgn, sa: Address, da: Address) -> Self {
        Self {
            addr: J1939Addr {
                pgn,
                sa,
                da,
                ..J1939Addr::default()
            },
            ..Self::default()
        }
    }

    /// Whether a broadcast transfer keeps the normal inter-packet delay.
    pub fn use_bam_delay(&self) -> bool {
        !self.tp_flags.contains(TpFlags::BAM_NODELAY)
    }

    pub fn is_broadcast(&self) -> bool {
        !self.addr.da.is_valid()
    }

    pub fn is_local_src(&self) -> bool {
        self.src_flags.contains(EcuFlags::LOCAL)
    }

    pub fn is_local_dst(&self) -> bool {
        self.dst_flags.contains(EcuFlags::LOCAL)
    }

    /// Source NAME, `None` until resolved.
    pub fn src_name(&self) -> Option<Name> {
        self.src_flags
            .contains(EcuFlags::NAME)
            .then_some(self.addr.src_name)
    }

    /// Destination NAME, `None` until resolved.
    pub fn dst_name(&self) -> Option<Name> {
        self.dst_flags
            .contains(EcuFlags::NAME)
            .then_some(self.addr.dst_name)
    }

    pub fn set_src_name(&mut self, name: Option<Name>) {
        self.addr.src_name = name.unwrap_or(Name(0));
        self.src_flags.set(EcuFlags::NAME, name.is_some());
    }

    pub fn set_dst_name(&mut self, name: Option<Name>) {
        self.addr.dst_name = name.unwrap_or(Name(0));
        self.dst_flags.set(EcuFlags::NAME, name.is_some());
    }
}

/// A packet with its addressing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub meta: PacketMeta,
    pub data: Vec<u8>,
    pub timestamp: Timestamp,
}

impl InterfaceState {
    /// Fills in the NAMEs behind a received packet's addresses and marks
    /// which ends are local. Unresolved NAMEs stay `None`.
    pub fn resolve_rx(&self, meta: &mut PacketMeta) -> Result<()> {
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        let (sa, da) = (meta.addr.sa, meta.addr.da);

        let tables = self.read();
        let src_name = tables.cache.lookup(sa).map(|ecu| ecu.name());
        let dst_name = tables.cache.lookup(da).map(|ecu| ecu.name());
        let src_local = tables.cache.users(sa) > 0;
        let dst_local = tables.cache.users(da) > 0;
        drop(tables);

        meta.set_src_name(src_name);
        meta.set_dst_name(dst_name);
        meta.src_flags.set(EcuFlags::LOCAL, src_local);
        meta.dst_flags.set(EcuFlags::LOCAL, dst_local);
        Ok(())
    }

    /// Resolves the addresses of an outbound packet addressed by NAME.
    ///
    /// The source must be local. Address-claim packets keep the source they
    /// were built with. Nothing is written if resolution fails.
    pub fn resolve_tx(&self, meta: &mut PacketMeta) -> Result<()> {
        if !self.is_alive() {
            return Err(J1939Error::InterfaceDown);
        }
        let addr = meta.addr;
        let (src_name, dst_name) = (meta.src_name(), meta.dst_name());
        let claim = addr.pgn.group() == Pgn::ADDRESS_CLAIMED;

        let tables = self.read();
        let mut sa = addr.sa;
        if !claim {
            if let Some(name) = src_name {
                sa = tables.address_of(name);
                if !sa.is_unicast() {
                    return Err(J1939Error::UnresolvedSource(name));
                }
            }
            if !sa.is_unicast() {
                return Err(J1939Error::AddressOutOfRange(sa));
            }
            if tables.cache.users(sa) == 0 {
                return Err(J1939Error::AddressNotLocal(sa));
            }
        }

        let mut da = addr.da;
        if let Some(name) = dst_name {
            da = tables.address_of(name);
            if !da.is_unicast() {
                return Err(J1939Error::UnresolvedDestination(name));
            }
        }
        let dst_local = tables.cache.users(da) > 0;
        drop(tables);

        meta.addr.sa = sa;
        meta.addr.da = da;
        meta.src_flags.insert(EcuFlags::LOCAL);
        meta.dst_flags.set(EcuFlags::LOCAL, dst_local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bam_delay_flag() {
        let mut meta = PacketMeta::default();
        assert!(meta.use_bam_delay());
        meta.tp_flags |= TpFlags::BAM_NODELAY;
        assert!(!meta.use_bam_delay());
    }

    #[test]
    fn defaults_are_unresolved() {
        let meta = PacketMeta::new(Pgn::REQUEST, Address(0x20), Address::NO_ADDR);
        assert_eq!(meta.src_name(), None);
        assert_eq!(meta.dst_name(), None);
        assert!(meta.is_broadcast());
        assert!(!meta.is_local_src());
        assert_eq!(SessionId::new(0), None);
    }

    #[test]
    fn unresolved_name_stays_empty() {
        let mut meta = PacketMeta::default();
        meta.set_src_name(Some(Name(0)));
        assert_eq!(meta.src_name(), Some(Name(0)));
        assert_eq!(meta.dst_name(), None);

        meta.set_src_name(None);
        assert_eq!(meta.src_name(), None);
        assert!(!meta.src_flags.contains(EcuFlags::NAME));
    }
}
