use thiserror::Error;

use crate::network::j1939::{Address, Name};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum J1939Error {
    // Physical layer errors
    #[error("CAN error: {0}")]
    CanError(String),

    // Address cache / registry errors
    #[error("not found")]
    NotFound,
    #[error("address {0} is not a unicast address")]
    AddressOutOfRange(Address),
    #[error("duplicate NAME {0} on the bus")]
    DuplicateName(Name),
    #[error("registry full: max {capacity} ECUs")]
    AllocationFailure { capacity: usize },
    #[error("address {0} is no longer bound to the expected ECU")]
    StaleUnbind(Address),

    // Addressing resolution errors
    #[error("source NAME {0} has no claimed address")]
    UnresolvedSource(Name),
    #[error("destination NAME {0} has no claimed address")]
    UnresolvedDestination(Name),
    #[error("source address {0} is not local")]
    AddressNotLocal(Address),
    #[error("address claim payload must be 8 bytes, got {len}")]
    MalformedClaim { len: usize },

    // Generic errors
    #[error("interface is down")]
    InterfaceDown,
    #[error("operation timed out")]
    Timeout,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("component not initialized")]
    NotInitialized,
}

impl J1939Error {
    /// Outcomes that callers treat as a no-op rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, J1939Error::NotFound | J1939Error::StaleUnbind(_))
    }
}

pub type Result<T> = std::result::Result<T, J1939Error>;
