//! Address claiming: claims, arbitration between claimants, claim timer
//! expiry and inbound address-claim frames.

use tracing::{debug, info, warn};

use super::ecu::{EcuRef, EcuState};
use super::identity::{Address, Name};
use super::interface::{InterfaceEvent, InterfaceState, Tables};
use super::metadata::PacketMeta;
use super::registry::{self, Arbitration};
use crate::error::{J1939Error, Result};
use crate::types::Timestamp;

/// What a claim attempt did to the claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// The claimant now holds the address tentatively and its claim timer is
    /// running. `displaced` is the NAME that held the address before.
    Claiming { displaced: Option<Name> },
    /// The claimant already holds the address.
    AlreadyClaimed,
    /// The current holder has the smaller NAME; the claimant is idle.
    Lost { winner: Name },
}

struct Claimed {
    result: ClaimResult,
    displaced: Option<EcuRef>,
}

fn claim_locked(
    tables: &mut Tables,
    ecu: &EcuRef,
    addr: Address,
    deadline: Timestamp,
) -> Result<Claimed> {
    if tables.cache.is_bound_to(addr, ecu) {
        let result = match ecu.state() {
            EcuState::Claimed => ClaimResult::AlreadyClaimed,
            EcuState::Claiming => ClaimResult::Claiming { displaced: None },
            _ => {
                ecu.set_state(EcuState::Claiming);
                ecu.timer.arm(deadline);
                ClaimResult::Claiming { displaced: None }
            }
        };
        return Ok(Claimed {
            result,
            displaced: None,
        });
    }

    let holder = tables.cache.lookup(addr);
    if let Some(holder) = &holder {
        if registry::resolve_conflict(holder, ecu)? == Arbitration::HolderWins {
            tables.relinquish(ecu);
            ecu.set_state(EcuState::Idle);
            return Ok(Claimed {
                result: ClaimResult::Lost {
                    winner: holder.name(),
                },
                displaced: None,
            });
        }
        tables.relinquish(holder);
    }

    tables.cache.bind(addr, ecu)?;
    ecu.set_state(EcuState::Claiming);
    ecu.timer.arm(deadline);
    Ok(Claimed {
        result: ClaimResult::Claiming {
            displaced: holder.as_ref().map(|h| h.name()),
        },
        displaced: holder,
    })
}

impl InterfaceState {
    /// Claims `addr` for `name`, registering the NAME if it is new.
    ///
    /// The record is bound at `addr` straight away so competing claims see
    /// it; it becomes Claimed once [`poll_timers`](Self::poll_timers) runs at
    /// or past `now + claim_timeout_ms` without a smaller NAME taking over.
    pub fn claim(&self, name: Name, addr: Address, now: Timestamp) -> Result<ClaimResult> {
        let addr = addr.unicast()?;
        let deadline = now.saturating_add(self.config().claim_timeout_ms);
        let claimed = self.with_record(name, |tables, ecu| {
            claim_locked(tables, ecu, addr, deadline)
        })?;

        match &claimed.result {
            ClaimResult::Claiming { displaced } => {
                info!(name = %name, address = %addr, displaced = ?displaced, "claiming address");
            }
            ClaimResult::AlreadyClaimed => {
                debug!(name = %name, address = %addr, "address already claimed");
            }
            ClaimResult::Lost { winner } => {
                info!(name = %name, address = %addr, winner = %winner, "address claim lost");
                self.notify(&InterfaceEvent::AddressLost {
                    name,
                    address: addr,
                    winner: Some(*winner),
                });
            }
        }
        if let Some(prev) = claimed.displaced {
            self.notify(&InterfaceEvent::AddressLost {
                name: prev.name(),
                address: addr,
                winner: Some(name),
            });
        }
        Ok(claimed.result)
    }

    /// Applies the arbitration rule between the holder of an address and a
    /// claimant; the loser gives up any address it holds and becomes idle.
    pub fn resolve_conflict(&self, holder: &EcuRef, claimant: &EcuRef) -> Result<Arbitration> {
        let (outcome, loser, address) = {
            let mut tables = self.write_live()?;
            if !tables.registry.contains(holder) || !tables.registry.contains(claimant) {
                return Err(J1939Error::NotFound);
            }
            let outcome = registry::resolve_conflict(holder, claimant)?;
            let (loser, winner) = match outcome {
                Arbitration::HolderWins => (claimant, holder),
                Arbitration::ClaimantWins => (holder, claimant),
            };
            let address = tables.relinquish(loser);
            loser.set_state(EcuState::Idle);
            (outcome, (loser.name(), winner.name()), address)
        };

        let (name, winner) = loser;
        debug!(loser = %name, winner = %winner, "conflict resolved");
        self.notify(&InterfaceEvent::AddressLost {
            name,
            address: address.unwrap_or(Address::IDLE),
            winner: Some(winner),
        });
        Ok(outcome)
    }

    /// Gives up whatever address `ecu` holds without unregistering it.
    pub fn release_address(&self, ecu: &EcuRef) -> Result<Option<Address>> {
        let released = {
            let mut tables = self.write_live()?;
            if !tables.registry.contains(ecu) {
                return Err(J1939Error::NotFound);
            }
            tables.relinquish(ecu)
        };
        if let Some(address) = released {
            debug!(name = %ecu.name(), address = %address, "address released");
            self.notify(&InterfaceEvent::AddressLost {
                name: ecu.name(),
                address,
                winner: None,
            });
        }
        Ok(released)
    }

    /// Fires every claim timer that expired at `now`. Returns the number of
    /// records that moved from Claiming to Claimed.
    pub fn poll_timers(&self, now: Timestamp) -> usize {
        let mut claimed = 0;
        loop {
            let due = {
                let tables = self.read();
                let due = tables
                    .registry
                    .iter()
                    .find_map(|ecu| ecu.timer.try_fire(now).map(|token| (ecu.clone(), token)));
                due
            };
            let Some((ecu, token)) = due else {
                break;
            };

            let done = {
                let tables = self.write();
                // completing first keeps a cancelled firing from acting
                let fired = ecu.timer.complete(token);
                let done = fired
                    && self.is_alive()
                    && ecu.state() == EcuState::Claiming
                    && tables.cache.is_bound_to(ecu.address(), &ecu);
                if done {
                    ecu.set_state(EcuState::Claimed);
                }
                done
            };

            if done {
                claimed += 1;
                let address = ecu.address();
                info!(name = %ecu.name(), address = %address, "address claimed");
                self.notify(&InterfaceEvent::AddressClaimed {
                    name: ecu.name(),
                    address,
                });
            }
        }
        claimed
    }

    /// Earliest pending claim deadline, for callers scheduling the next poll.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.read()
            .registry
            .iter()
            .filter_map(|ecu| ecu.claim_deadline())
            .min()
    }

    /// Whether a claim for `name` from `sa` repeats what this interface
    /// already holds for it: the echo of a claim sent from here, or of a
    /// cannot-claim sent after losing.
    pub fn is_own_claim(&self, name: Name, sa: Address) -> bool {
        let Ok(ecu) = self.find_by_name(name) else {
            return false;
        };
        if sa.is_idle() {
            return ecu.state() == EcuState::Idle && !ecu.address().is_unicast();
        }
        if !matches!(ecu.state(), EcuState::Claiming | EcuState::Claimed) {
            return false;
        }
        let bound = self.read().cache.is_bound_to(sa, &ecu);
        bound
    }

    /// Processes an inbound address-claim frame: an 8-byte little-endian
    /// NAME sent from the address being claimed.
    ///
    /// A claim from source [`Address::IDLE`] is a "cannot claim" and releases
    /// whatever the NAME held. A claim from the bus carrying the NAME of a
    /// local ECU is rejected as [`J1939Error::DuplicateName`]. Our own claims
    /// looped back from the bus are recognised by their originating session.
    pub fn ac_recv(
        &self,
        meta: &PacketMeta,
        data: &[u8],
        now: Timestamp,
    ) -> Result<Option<ClaimResult>> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| J1939Error::MalformedClaim { len: data.len() })?;
        let name = Name::from_le_bytes(bytes);
        let sa = meta.addr.sa;
        let looped = meta.insock.is_some();
        let known = self.find_by_name(name).ok();

        if !looped {
            if let Some(ecu) = known.as_ref().filter(|ecu| ecu.is_local()) {
                warn!(name = %ecu.name(), address = %sa, "remote claim with a local NAME");
                return Err(J1939Error::DuplicateName(name));
            }
        }

        if sa.is_idle() {
            if let Some(ecu) = &known {
                self.release_address(ecu)?;
            }
            debug!(name = %name, "cannot claim address");
            return Ok(None);
        }
        if !sa.is_unicast() {
            return Err(J1939Error::AddressOutOfRange(sa));
        }

        if looped {
            if let Some(ecu) = &known {
                let held = ecu.address() == sa
                    && matches!(ecu.state(), EcuState::Claiming | EcuState::Claimed);
                if held {
                    return Ok(None);
                }
            }
        }

        self.claim(name, sa, now).map(Some)
    }
}
