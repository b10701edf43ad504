// OSI Layer modules
pub mod network; // J1939 network management
pub mod physical; // CAN controller seam

// Re-exports for convenience
pub use network::j1939;

// Common types and traits
pub mod error;
pub mod types;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_valid() {
        assert!(!VERSION.is_empty());
    }
}
