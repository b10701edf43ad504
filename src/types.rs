/// CAN ID type
pub type CanId = u32;

/// Generic frame data type
pub type FrameData = Vec<u8>;

/// Timestamp in milliseconds
pub type Timestamp = u64;

/// Generic frame structure used across layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: CanId,
    pub data: FrameData,
    pub timestamp: Timestamp,
    pub is_extended: bool,
    pub is_fd: bool,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            id: 0,
            data: Vec::new(),
            timestamp: 0,
            is_extended: false,
            is_fd: false,
        }
    }
}

/// Configuration trait that must be implemented by all protocol configurations
pub trait Config: Send + Sync {
    fn validate(&self) -> crate::error::Result<()>;
}
