//! Ordered list of every ECU known on an interface, and the claim
//! arbitration rule.

use std::cmp::Ordering;

use super::ecu::{Ecu, EcuRef};
use super::identity::Name;
use crate::error::{J1939Error, Result};

/// Outcome of a contest for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arbitration {
    /// The current holder keeps the address.
    HolderWins,
    /// The new claimant takes the address over.
    ClaimantWins,
}

/// The smaller NAME wins. Two claims with the same NAME are a protocol
/// violation and are never resolved automatically.
pub fn resolve_conflict(holder: &Ecu, claimant: &Ecu) -> Result<Arbitration> {
    match claimant.name().cmp(&holder.name()) {
        Ordering::Less => Ok(Arbitration::ClaimantWins),
        Ordering::Greater => Ok(Arbitration::HolderWins),
        Ordering::Equal => Err(J1939Error::DuplicateName(holder.name())),
    }
}

/// Insertion-ordered list with a capacity fixed up front, so neither
/// insertion nor removal ever allocates.
pub struct EcuRegistry {
    ecus: Vec<EcuRef>,
    capacity: usize,
}

impl EcuRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ecus: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.ecus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ecus.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Linear scan; bus populations are small.
    pub fn find(&self, name: Name) -> Option<&EcuRef> {
        self.ecus.iter().find(|ecu| ecu.name() == name)
    }

    pub fn contains(&self, ecu: &Ecu) -> bool {
        self.ecus.iter().any(|known| known.same(ecu))
    }

    pub fn insert(&mut self, ecu: EcuRef) -> Result<()> {
        if self.ecus.len() >= self.capacity {
            return Err(J1939Error::AllocationFailure {
                capacity: self.capacity,
            });
        }
        self.ecus.push(ecu);
        Ok(())
    }

    /// Removes `ecu` and hands back the registry's own reference so the
    /// caller can release it after dropping the lock.
    pub fn remove(&mut self, ecu: &Ecu) -> Option<EcuRef> {
        let pos = self.ecus.iter().position(|known| known.same(ecu))?;
        Some(self.ecus.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EcuRef> {
        self.ecus.iter()
    }

    /// Empties the registry, returning every reference it held.
    pub fn drain_all(&mut self) -> Vec<EcuRef> {
        std::mem::take(&mut self.ecus)
    }
}
