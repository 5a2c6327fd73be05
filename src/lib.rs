pub mod config;
pub mod core;
pub mod errors;

// Re-export commonly used items for convenience
pub use config::{BargeInPolicy, BridgeConfig};
pub use self::core::*;
pub use errors::{BridgeError, BridgeResult};
