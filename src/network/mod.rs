pub mod j1939;

use crate::error::Result;
use j1939::{Address, ClaimResult, Name, PacketMeta};

/// Network layer trait that must be implemented by J1939
pub trait NetworkLayer: Send + Sync {
    type Message;

    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn send(&mut self, meta: PacketMeta, data: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Self::Message>;
    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()>;
    fn claim_address(&mut self, name: Name, address: Address) -> Result<ClaimResult>;
    fn get_address(&self, name: Name) -> Result<Address>;
}
