use std::collections::VecDeque;

use super::PhysicalLayer;
use crate::error::{J1939Error, Result};
use crate::types::{Config, Frame};

#[derive(Debug, Default)]
pub struct MockConfig {
    pub timeout_ms: u32,
    /// Sent frames are also queued for reception.
    pub loopback: bool,
}

impl Config for MockConfig {
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// Mock physical layer for testing
///
/// Received frames come from a queue filled by the test; sent frames are
/// recorded. An empty receive queue reports [`J1939Error::Timeout`].
#[derive(Debug, Default)]
pub struct MockPhysical {
    config: MockConfig,
    rx: VecDeque<Frame>,
    sent: Vec<Frame>,
    bus_off: bool,
    is_open: bool,
}

impl MockPhysical {
    pub fn new_loopback() -> Self {
        Self {
            config: MockConfig {
                loopback: true,
                ..MockConfig::default()
            },
            ..Self::default()
        }
    }

    /// Queues a frame as if it had arrived from the bus.
    pub fn inject(&mut self, frame: Frame) {
        self.rx.push_back(frame);
    }

    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.sent)
    }

    /// Makes every transmission fail until cleared.
    pub fn set_bus_off(&mut self, bus_off: bool) {
        self.bus_off = bus_off;
    }

    pub fn timeout_ms(&self) -> u32 {
        self.config.timeout_ms
    }
}

impl PhysicalLayer for MockPhysical {
    type Config = MockConfig;

    fn new(config: Self::Config) -> Result<Self> {
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    fn open(&mut self) -> Result<()> {
        self.is_open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.is_open = false;
        Ok(())
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }
        if self.bus_off {
            return Err(J1939Error::CanError("bus off".into()));
        }
        self.sent.push(frame.clone());
        if self.config.loopback {
            self.rx.push_back(frame.clone());
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Frame> {
        if !self.is_open {
            return Err(J1939Error::NotInitialized);
        }
        self.rx.pop_front().ok_or(J1939Error::Timeout)
    }

    fn set_timeout(&mut self, timeout_ms: u32) -> Result<()> {
        self.config.timeout_ms = timeout_ms;
        Ok(())
    }
}
