//! Error types for AlertWatch

use thiserror::Error;

/// Result type alias using AlertWatch Error
pub type Result<T> = std::result::Result<T, Error>;

/// AlertWatch error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session artifact for '{user_type}' is corrupt: {reason}")]
    SessionCorrupt { user_type: String, reason: String },

    #[error("Unknown user type: {0}")]
    UnknownUserType(String),
}
