//! Physical layer seam for the J1939 network layer.
//!
//! The physical layer is responsible for the actual transmission and reception
//! of frames on the bus. This crate does not drive CAN controllers itself;
//! platforms implement [`PhysicalLayer`] for their controller and hand it to
//! [`J1939`](crate::network::j1939::J1939).
//!
//! # Examples
//!
//! ```rust,ignore
//! use libj1939::network::j1939::{InterfaceConfig, InterfaceState, NetDevice, J1939};
//!
//! let iface = InterfaceState::new(NetDevice::new(1, "can0"), InterfaceConfig::default())?;
//! let mut j1939 = J1939::with_physical(iface, my_can_controller);
//! ```

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use crate::error::Result;
use crate::types::{Config, Frame};

/// Physical layer trait that must be implemented by CAN controllers
pub trait PhysicalLayer: Send + Sync {
    type Config: Config;

    fn new(config: Self::Config) -> Result<Self>
    where
        Self: Sized;
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn send_frame(&mut self, frame: &Frame) -> Result<()>;
    fn receive_frame(&mut self) -> Result<Frame>;
    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()>;
}
