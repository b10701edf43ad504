//! Identity value types used throughout address claiming.
//!
//! A [`Name`] is the 64-bit identifier an ECU carries for its whole life; an
//! [`Address`] is the one-byte handle it contends for and then uses as the
//! source field of every frame it sends.

use std::fmt;

use crate::error::{J1939Error, Result};

/// 64-bit J1939 NAME.
///
/// Ordering is numeric: during address contention the smaller NAME wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(pub u64);

impl Name {
    /// Decodes a NAME from an address-claim payload (little-endian on the wire).
    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Name(u64::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for Name {
    fn from(raw: u64) -> Self {
        Name(raw)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One-byte bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u8);

impl Address {
    /// Highest address usable for point-to-point traffic.
    pub const MAX_UNICAST: Address = Address(252);
    /// Reserved, never claimable.
    pub const RESERVED: Address = Address(253);
    /// Source address of a node that has no address ("cannot claim").
    pub const IDLE: Address = Address(254);
    /// No address / global destination.
    pub const NO_ADDR: Address = Address(255);

    pub fn is_unicast(self) -> bool {
        self.0 <= Self::MAX_UNICAST.0
    }

    pub fn is_idle(self) -> bool {
        self == Self::IDLE
    }

    pub fn is_valid(self) -> bool {
        self != Self::NO_ADDR
    }

    /// Returns the address if it can hold a live claim.
    pub fn unicast(self) -> Result<Address> {
        if self.is_unicast() {
            Ok(self)
        } else {
            Err(J1939Error::AddressOutOfRange(self))
        }
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u8> for Address {
    fn from(raw: u8) -> Self {
        Address(raw)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// 3-bit frame priority, 0 is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(6);
    pub const LOWEST: Priority = Priority(7);

    pub fn new(raw: u8) -> Result<Self> {
        if raw > Self::LOWEST.0 {
            return Err(J1939Error::InvalidParameter);
        }
        Ok(Priority(raw))
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// 18-bit Parameter Group Number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pgn(u32);

impl Pgn {
    pub const MAX: u32 = 0x3ffff;
    pub const REQUEST: Pgn = Pgn(0x0ea00);
    pub const ADDRESS_CLAIMED: Pgn = Pgn(0x0ee00);

    pub fn new(raw: u32) -> Result<Self> {
        if raw > Self::MAX {
            return Err(J1939Error::InvalidParameter);
        }
        Ok(Pgn(raw))
    }

    pub(crate) fn masked(raw: u32) -> Self {
        Pgn(raw & Self::MAX)
    }

    /// PDU1 groups carry a destination address in the low byte.
    pub fn is_pdu1(self) -> bool {
        // data page and reserved bits are ignored here
        (self.0 & 0xff00) < 0xf000
    }

    /// The group number with the destination byte of a PDU1 group cleared.
    pub fn group(self) -> Pgn {
        if self.is_pdu1() {
            Pgn(self.0 & 0x3ff00)
        } else {
            self
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pgn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:05x}", self.0)
    }
}
