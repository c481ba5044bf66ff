//! AlertWatch Common Library
//!
//! Shared types, configuration and durable session storage for the
//! AlertWatch end-to-end harness.

pub mod config;
pub mod error;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::{HarnessConfig, IdentityConfig};
pub use error::{Error, Result};
pub use session::{SessionStatus, SessionStore};
pub use types::*;

/// AlertWatch harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration file, relative to the working directory
pub fn default_config_path() -> std::path::PathBuf {
    std::path::PathBuf::from("alertwatch.toml")
}
