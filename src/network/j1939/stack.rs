//! Registry of the interfaces network management runs on.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::interface::{InterfaceConfig, InterfaceState, NetDevice};
use crate::error::{J1939Error, Result};
use crate::types::Config;

/// Tracks one [`InterfaceState`] per interface index.
///
/// Interface events arrive here from whatever administers the interfaces;
/// nothing in this module is touched by the frame path.
pub struct J1939Stack {
    config: InterfaceConfig,
    interfaces: Mutex<HashMap<u32, InterfaceState>>,
}

impl J1939Stack {
    pub fn new(config: InterfaceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            interfaces: Mutex::new(HashMap::new()),
        })
    }

    /// Starts network management on `device`, or returns the state already
    /// running on it.
    pub fn on_interface_ready(&self, device: NetDevice) -> Result<InterfaceState> {
        if device.ifindex == 0 {
            return Err(J1939Error::InvalidParameter);
        }
        let mut interfaces = self.interfaces.lock();
        if let Some(iface) = interfaces.get(&device.ifindex) {
            return Ok(iface.clone());
        }

        let ifindex = device.ifindex;
        let iface = InterfaceState::new(device, self.config.clone())?;
        interfaces.insert(ifindex, iface.clone());
        drop(interfaces);

        info!(ifindex, device = %iface.device().name, "interface ready");
        Ok(iface)
    }

    /// Runs the teardown barrier on the interface and forgets it. The state
    /// itself is freed once every other holder lets go.
    pub fn on_interface_removed(&self, ifindex: u32) -> Result<()> {
        let iface = self
            .interfaces
            .lock()
            .remove(&ifindex)
            .ok_or(J1939Error::NotFound)?;
        iface.teardown();
        debug!(ifindex, holders = iface.refcount() - 1, "interface removed");
        Ok(())
    }

    /// Forwards an error condition (bus-off, for example) to the listeners
    /// of an interface that stays up.
    pub fn on_interface_error(&self, ifindex: u32, error: J1939Error) -> Result<()> {
        let iface = self.get(ifindex)?;
        iface.notify_error(error);
        Ok(())
    }

    pub fn get(&self, ifindex: u32) -> Result<InterfaceState> {
        self.interfaces
            .lock()
            .get(&ifindex)
            .cloned()
            .ok_or(J1939Error::NotFound)
    }

    pub fn len(&self) -> usize {
        self.interfaces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for J1939Stack {
    fn drop(&mut self) {
        for (_, iface) in self.interfaces.get_mut().drain() {
            iface.teardown();
        }
    }
}
